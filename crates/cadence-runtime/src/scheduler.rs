// Scheduler
// Fixed-interval ticker that fires pipeline cron schedules. Each firing is
// fingerprinted by zoned minute + expression + timezone so a minute never
// fires twice across restarts; a trailing catch-up window compensates for
// downtime. Missed minutes coalesce because the first enqueued run makes the
// pipeline active for the remaining slots.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cadence_core::cron::{zoned_minute_key, CronExpr};
use cadence_core::Clock;
use cadence_types::{Pipeline, Schedule};

use crate::queue::{QueueOutcome, RunQueue};

pub const SCHEDULER_TICK: Duration = Duration::from_secs(15);

pub struct Scheduler {
    queue: RunQueue,
    clock: Arc<dyn Clock>,
    catchup_minutes: u32,
    markers: Mutex<Option<HashMap<String, String>>>,
    ticking: AtomicBool,
    warned: StdMutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(queue: RunQueue, clock: Arc<dyn Clock>, catchup_minutes: u32) -> Self {
        Self {
            queue,
            clock,
            catchup_minutes,
            markers: Mutex::new(None),
            ticking: AtomicBool::new(false),
            warned: StdMutex::new(HashSet::new()),
        }
    }

    /// Run the tick loop until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.tick().await,
                }
            }
        })
    }

    /// One scheduler pass. Re-entrant calls are skipped.
    pub async fn tick(&self) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tick_inner().await;
        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) {
        let store = self.queue.environment().store.clone();

        let mut markers_guard = self.markers.lock().await;
        if markers_guard.is_none() {
            *markers_guard = Some(store.load_scheduler_markers().await);
        }
        let markers = markers_guard.get_or_insert_with(HashMap::new);

        let now = floor_to_minute(self.clock.now());
        let slots: Vec<DateTime<Utc>> = (0..=self.catchup_minutes)
            .rev()
            .map(|i| now - chrono::Duration::minutes(i as i64))
            .collect();

        let mut changed = false;
        let mut fired_this_tick: HashSet<String> = HashSet::new();
        for pipeline in store.list_pipelines().await {
            let Some(schedule) = pipeline.schedule.clone().filter(|s| s.enabled) else {
                continue;
            };

            let cron = match CronExpr::parse(&schedule.cron) {
                Ok(cron) => cron,
                Err(err) => {
                    let sentinel = format!("invalid-cron:{}", schedule.cron);
                    self.warn_once(&format!("{}|{sentinel}", pipeline.id), || {
                        tracing::warn!(
                            "pipeline '{}' has an invalid cron expression: {err}",
                            pipeline.name
                        );
                    });
                    if markers.get(&pipeline.id) != Some(&sentinel) {
                        markers.insert(pipeline.id.clone(), sentinel);
                        changed = true;
                    }
                    continue;
                }
            };

            if zoned_minute_key(now, &schedule.timezone).is_none() {
                let sentinel = format!("invalid-timezone:{}", schedule.timezone);
                self.warn_once(&format!("{}|{sentinel}", pipeline.id), || {
                    tracing::warn!(
                        "pipeline '{}' has an unknown timezone '{}'",
                        pipeline.name,
                        schedule.timezone
                    );
                });
                if markers.get(&pipeline.id) != Some(&sentinel) {
                    markers.insert(pipeline.id.clone(), sentinel);
                    changed = true;
                }
                continue;
            }

            for slot in &slots {
                if self
                    .consider_slot(&pipeline, &schedule, &cron, *slot, markers, &mut fired_this_tick)
                    .await
                {
                    changed = true;
                }
            }
        }

        if changed {
            if let Err(err) = store.save_scheduler_markers(markers.clone()).await {
                tracing::error!("failed to persist scheduler markers: {err}");
            }
        }
    }

    /// Returns true when the marker map changed.
    async fn consider_slot(
        &self,
        pipeline: &Pipeline,
        schedule: &Schedule,
        cron: &CronExpr,
        slot: DateTime<Utc>,
        markers: &mut HashMap<String, String>,
        fired_this_tick: &mut HashSet<String>,
    ) -> bool {
        let Some(zone) = cadence_core::cron::resolve_timezone(&schedule.timezone) else {
            return false;
        };
        let zoned = slot.with_timezone(&zone);
        if !cron.matches(&zoned) {
            return false;
        }
        let Some(minute_key) = zoned_minute_key(slot, &schedule.timezone) else {
            return false;
        };
        let marker = format!("{minute_key}|{}|{}", schedule.cron, schedule.timezone);

        if let Some(stored) = markers.get(&pipeline.id) {
            if stored == &marker {
                return false;
            }
            // Markers never regress: only advance past the stored minute.
            if let Some(stored_key) = marker_minute_key(stored) {
                if minute_key.as_str() <= stored_key {
                    return false;
                }
            }
        }

        // Fresh firing. Missed minutes coalesce: once a run launched this
        // tick (or an older run is still active), later slots only advance
        // the marker.
        if fired_this_tick.contains(&pipeline.id) || self.queue.has_active_run(&pipeline.id).await {
            tracing::info!(
                "scheduler: pipeline '{}' already has an active run; skipping {minute_key}",
                pipeline.name
            );
        } else {
            let task = schedule
                .task_override
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Scheduled run of {}", pipeline.name));
            match self
                .queue
                .queue_run(
                    &pipeline.id,
                    task,
                    schedule.inputs.clone(),
                    false,
                    schedule.run_mode,
                )
                .await
            {
                Ok(QueueOutcome::Launched(run)) => {
                    fired_this_tick.insert(pipeline.id.clone());
                    tracing::info!(
                        "scheduler: launched run {} for pipeline '{}' at {minute_key}",
                        run.id,
                        pipeline.name
                    );
                }
                Ok(QueueOutcome::Rejected(plan)) => {
                    let failed: Vec<String> = plan
                        .failed_checks()
                        .iter()
                        .map(|c| c.id.clone())
                        .collect();
                    tracing::warn!(
                        "scheduler: preflight failed for pipeline '{}': {}",
                        pipeline.name,
                        failed.join(", ")
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        "scheduler: failed to launch pipeline '{}': {err}",
                        pipeline.name
                    );
                }
            }
        }

        // The marker advances for every handled firing, including skips.
        markers.insert(pipeline.id.clone(), marker);
        true
    }

    fn warn_once(&self, key: &str, warn: impl FnOnce()) {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(key.to_string()) {
            warn();
        }
    }
}

fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Minute-key segment of a marker; None for sentinel markers.
fn marker_minute_key(marker: &str) -> Option<&str> {
    let (head, _) = marker.split_once('|')?;
    head.chars().next().filter(char::is_ascii_digit)?;
    Some(head)
}
