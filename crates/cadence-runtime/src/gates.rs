// Quality gate evaluation
// Post-step assertions over model output and run artifacts. Manual approval
// gates are not evaluated here; they suspend the run and are resolved by a
// human through the queue.

use regex::RegexBuilder;
use serde_json::Value;

use cadence_core::StateStore;
use cadence_types::{GateKind, GateResult, QualityGate, Step, ANY_STEP};

/// Outcome of evaluating the automatic gates for one step.
#[derive(Debug, Default)]
pub struct GateEvaluation {
    pub results: Vec<GateResult>,
    /// Gates requiring a human decision, in definition order.
    pub manual_gates: Vec<QualityGate>,
}

impl GateEvaluation {
    pub fn blocking_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed && r.blocking)
    }
}

/// Gates that apply to `step`: gates targeting the step id first, then
/// `any_step` gates, in definition order.
pub fn gates_for_step<'a>(gates: &'a [QualityGate], step: &Step) -> Vec<&'a QualityGate> {
    let mut applicable: Vec<&QualityGate> = gates
        .iter()
        .filter(|g| g.target_step_id == step.id)
        .collect();
    applicable.extend(gates.iter().filter(|g| g.target_step_id == ANY_STEP));
    applicable
}

pub async fn evaluate_gates(
    store: &dyn StateStore,
    pipeline_id: &str,
    run_id: &str,
    gates: &[QualityGate],
    step: &Step,
    output: &str,
) -> GateEvaluation {
    let mut evaluation = GateEvaluation::default();
    for gate in gates_for_step(gates, step) {
        match gate.kind {
            GateKind::ManualApproval => evaluation.manual_gates.push(gate.clone()),
            _ => {
                let (passed, detail) =
                    evaluate_automatic(store, pipeline_id, run_id, gate, output).await;
                evaluation.results.push(GateResult {
                    gate_id: gate.id.clone(),
                    gate_name: gate.name.clone(),
                    passed,
                    blocking: gate.blocking,
                    detail,
                });
            }
        }
    }
    evaluation
}

async fn evaluate_automatic(
    store: &dyn StateStore,
    pipeline_id: &str,
    run_id: &str,
    gate: &QualityGate,
    output: &str,
) -> (bool, Option<String>) {
    match gate.kind {
        GateKind::RegexMustMatch | GateKind::RegexMustNotMatch => {
            let pattern = gate.pattern.as_deref().unwrap_or("");
            let regex = match build_regex(pattern, gate.pattern_flags.as_deref()) {
                Ok(regex) => regex,
                Err(err) => {
                    return (false, Some(format!("invalid pattern: {err}")));
                }
            };
            let matched = regex.is_match(output);
            let passed = match gate.kind {
                GateKind::RegexMustMatch => matched,
                _ => !matched,
            };
            let detail = gate.message.clone().or_else(|| {
                (!passed).then(|| match gate.kind {
                    GateKind::RegexMustMatch => format!("output did not match /{pattern}/"),
                    _ => format!("output matched forbidden /{pattern}/"),
                })
            });
            (passed, detail)
        }
        GateKind::JsonFieldExists => {
            let path = gate.json_path.as_deref().unwrap_or("");
            let passed = extract_json(output)
                .map(|value| json_path_exists(&value, path))
                .unwrap_or(false);
            let detail =
                (!passed).then(|| format!("json field '{path}' missing or null"));
            (passed, detail)
        }
        GateKind::ArtifactExists => {
            let path = gate.artifact_path.as_deref().unwrap_or("");
            let passed = store.artifact_exists(pipeline_id, run_id, path).await;
            let detail = (!passed).then(|| format!("artifact '{path}' not found"));
            (passed, detail)
        }
        GateKind::ManualApproval => (true, None),
    }
}

fn build_regex(pattern: &str, flags: Option<&str>) -> Result<regex::Regex, regex::Error> {
    let mut builder = RegexBuilder::new(pattern);
    if let Some(flags) = flags {
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                _ => {}
            }
        }
    }
    builder.build()
}

/// Parse step output as JSON, falling back to the first fenced ```json block.
pub fn extract_json(output: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(output.trim()) {
        return Some(value);
    }
    let mut in_block = false;
    let mut block = String::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !in_block && (trimmed == "```json" || trimmed == "```") {
            in_block = trimmed == "```json";
            continue;
        }
        if in_block {
            if trimmed == "```" {
                break;
            }
            block.push_str(line);
            block.push('\n');
        }
    }
    serde_json::from_str(&block).ok()
}

/// Walk a dotted path; passes iff the terminal value exists and is non-null.
fn json_path_exists(value: &Value, path: &str) -> bool {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return false,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return false,
            },
            _ => return false,
        }
    }
    !current.is_null()
}
