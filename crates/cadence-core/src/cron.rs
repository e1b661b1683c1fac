// POSIX 5-field cron matching
// Field order: minute hour day-of-month month day-of-week. Supports `*`,
// `*/n`, lists, ranges, and three-letter month/weekday names. When both
// day-of-month and day-of-week are restricted they combine with OR, per the
// POSIX convention.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cron expression: {0}")]
pub struct CronError(pub String);

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DOW_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// One parsed field, stored as a bitmask over the allowed value range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    dom: FieldSet,
    month: FieldSet,
    dow: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<CronExpr, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError(format!(
                "expected 5 fields, got {} in '{}'",
                fields.len(),
                expr
            )));
        }
        Ok(CronExpr {
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            dom: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, Some(MONTH_NAMES))?,
            dow: parse_dow_field(fields[4])?,
        })
    }

    /// Whether this expression fires at the given zoned instant (seconds are
    /// ignored; callers zero them before matching).
    pub fn matches<Z: TimeZone>(&self, t: &DateTime<Z>) -> bool {
        if !self.minute.contains(t.minute())
            || !self.hour.contains(t.hour())
            || !self.month.contains(t.month())
        {
            return false;
        }
        let dom_hit = self.dom.contains(t.day());
        let dow_hit = self.dow.contains(t.weekday().num_days_from_sunday());
        match (self.dom.restricted, self.dow.restricted) {
            // POSIX: both restricted means either may satisfy the date.
            (true, true) => dom_hit || dow_hit,
            _ => dom_hit && dow_hit,
        }
    }
}

fn parse_dow_field(raw: &str) -> Result<FieldSet, CronError> {
    let mut set = parse_field(raw, 0, 7, Some(DOW_NAMES))?;
    // 7 is an alias for Sunday.
    if set.contains(7) {
        set.bits |= 1;
        set.bits &= !(1u64 << 7);
    }
    Ok(set)
}

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<FieldSet, CronError> {
    let mut bits = 0u64;
    let mut restricted = true;
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(CronError(format!("empty list item in '{raw}'")));
        }
        let (range_part, step) = match item.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| CronError(format!("bad step '{step_str}'")))?;
                if step == 0 {
                    return Err(CronError("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range_part == "*" {
            if step == 1 && raw == "*" {
                restricted = false;
            }
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (
                parse_value(a, min, max, names)?,
                parse_value(b, min, max, names)?,
            )
        } else {
            let v = parse_value(range_part, min, max, names)?;
            (v, v)
        };

        if lo > hi {
            return Err(CronError(format!("inverted range '{item}'")));
        }
        let mut v = lo;
        while v <= hi {
            bits |= 1u64 << v;
            v += step;
        }
    }
    Ok(FieldSet { bits, restricted })
}

fn parse_value(raw: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u32, CronError> {
    if let Some(names) = names {
        let lowered = raw.to_lowercase();
        if let Some(idx) = names.iter().position(|n| *n == lowered) {
            // Month names are 1-based, weekday names 0-based.
            return Ok(if min == 1 { idx as u32 + 1 } else { idx as u32 });
        }
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| CronError(format!("bad value '{raw}'")))?;
    if value < min || value > max {
        return Err(CronError(format!(
            "value {value} out of range {min}-{max}"
        )));
    }
    Ok(value)
}

/// Resolve an IANA timezone name.
pub fn resolve_timezone(tz: &str) -> Option<Tz> {
    tz.parse::<Tz>().ok()
}

/// `YYYY-MM-DDTHH:MM` in the given zone; None when the zone is unknown.
pub fn zoned_minute_key(t: DateTime<Utc>, tz: &str) -> Option<String> {
    let zone = resolve_timezone(tz)?;
    let zoned = t.with_timezone(&zone);
    Some(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}",
        zoned.year(),
        zoned.month(),
        zoned.day(),
        zoned.hour(),
        zoned.minute()
    ))
}
