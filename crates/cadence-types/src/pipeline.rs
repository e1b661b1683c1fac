// Pipeline definition types
// A pipeline is a directed graph of agent steps joined by conditional links.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel target accepted by quality gates that apply to every step.
pub const ANY_STEP: &str = "any_step";

// ============================================================================
// Steps
// ============================================================================

/// Role a step plays inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Analysis,
    Planner,
    Orchestrator,
    Executor,
    Tester,
    Review,
}

impl StepRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepRole::Analysis => "analysis",
            StepRole::Planner => "planner",
            StepRole::Orchestrator => "orchestrator",
            StepRole::Executor => "executor",
            StepRole::Tester => "tester",
            StepRole::Review => "review",
        }
    }
}

/// Output contract requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Json,
}

fn default_delegation_count() -> u32 {
    1
}

fn default_context_template() -> String {
    "Task:\n{{task}}\n\nPrevious output:\n{{previous_output}}".to_string()
}

/// One LLM invocation within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub name: String,
    pub role: StepRole,
    /// Prompt template for this step. May reference `{{key}}` run inputs.
    pub prompt: String,
    #[serde(rename = "providerId")]
    pub provider_id: String,
    pub model: String,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub fast_mode: bool,
    /// Request the provider's extended (1M token) context window.
    #[serde(default)]
    pub wide_context: bool,
    #[serde(default)]
    pub context_window_tokens: Option<u32>,
    /// Context rendered beneath the prompt. Supports `{{task}}` and
    /// `{{previous_output}}` placeholders plus arbitrary `{{key}}` inputs.
    #[serde(default = "default_context_template")]
    pub context_template: String,
    #[serde(default)]
    pub enable_delegation: bool,
    #[serde(default = "default_delegation_count")]
    pub delegation_count: u32,
    /// Persist step artifacts into the run's isolated folder.
    #[serde(default)]
    pub store_isolated: bool,
    /// Persist step artifacts into the pipeline's shared folder.
    #[serde(default)]
    pub store_shared: bool,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub required_output_fields: Vec<String>,
    #[serde(default)]
    pub required_output_files: Vec<String>,
}

// ============================================================================
// Links
// ============================================================================

/// Condition under which a link is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkCondition {
    #[default]
    Always,
    OnPass,
    OnFail,
}

/// Directed transition between two steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default)]
    pub condition: LinkCondition,
}

// ============================================================================
// Quality gates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    RegexMustMatch,
    RegexMustNotMatch,
    JsonFieldExists,
    ArtifactExists,
    ManualApproval,
}

/// Post-step assertion that may block or annotate progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGate {
    pub id: String,
    pub name: String,
    /// Step this gate applies to, or [`ANY_STEP`].
    pub target_step_id: String,
    pub kind: GateKind,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub pattern_flags: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Smart,
    Quick,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Cron trigger attached to a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub enabled: bool,
    /// POSIX 5-field cron expression.
    pub cron: String,
    /// IANA timezone name the cron is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub task_override: Option<String>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

// ============================================================================
// Runtime policy
// ============================================================================

pub const MIN_LOOPS: u32 = 0;
pub const MAX_LOOPS: u32 = 12;
pub const MIN_STEP_EXECUTIONS: u32 = 4;
pub const MAX_STEP_EXECUTIONS: u32 = 120;
pub const MIN_STAGE_TIMEOUT_MS: u64 = 10_000;
pub const MAX_STAGE_TIMEOUT_MS: u64 = 1_200_000;

/// Runtime policy caps for a pipeline. Out-of-range values are clamped on
/// normalize rather than rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    pub max_loops: u32,
    pub max_step_executions: u32,
    pub stage_timeout_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_loops: 3,
            max_step_executions: 24,
            stage_timeout_ms: 300_000,
        }
    }
}

impl PipelineSettings {
    pub fn clamped(self) -> Self {
        Self {
            max_loops: self.max_loops.clamp(MIN_LOOPS, MAX_LOOPS),
            max_step_executions: self
                .max_step_executions
                .clamp(MIN_STEP_EXECUTIONS, MAX_STEP_EXECUTIONS),
            stage_timeout_ms: self
                .stage_timeout_ms
                .clamp(MIN_STAGE_TIMEOUT_MS, MAX_STAGE_TIMEOUT_MS),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A structural problem found while validating a pipeline or request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            links: Vec::new(),
            settings: PipelineSettings::default(),
            schedule: None,
            quality_gates: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Clamp settings and delegation counts into their allowed ranges.
    pub fn normalize(&mut self) {
        self.settings = self.settings.clamped();
        for step in &mut self.steps {
            step.delegation_count = step.delegation_count.clamp(1, 8);
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn orchestrator_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.role == StepRole::Orchestrator)
    }

    /// Validate structural invariants. Returns every issue found so callers
    /// can report them all at once.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("steps[{idx}].id"),
                    "step id must not be empty",
                ));
            } else if !seen.insert(step.id.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("steps[{idx}].id"),
                    format!("duplicate step id '{}'", step.id),
                ));
            }
        }

        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for (idx, link) in self.links.iter().enumerate() {
            if !ids.contains(link.source_step_id.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("links[{idx}].sourceStepId"),
                    format!("unknown step '{}'", link.source_step_id),
                ));
            }
            if !ids.contains(link.target_step_id.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("links[{idx}].targetStepId"),
                    format!("unknown step '{}'", link.target_step_id),
                ));
            }
        }

        for (idx, gate) in self.quality_gates.iter().enumerate() {
            if gate.target_step_id != ANY_STEP && !ids.contains(gate.target_step_id.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("qualityGates[{idx}].targetStepId"),
                    format!("unknown step '{}'", gate.target_step_id),
                ));
            }
            match gate.kind {
                GateKind::RegexMustMatch | GateKind::RegexMustNotMatch => {
                    if gate.pattern.as_deref().unwrap_or("").is_empty() {
                        issues.push(ValidationIssue::new(
                            format!("qualityGates[{idx}].pattern"),
                            "regex gates require a pattern",
                        ));
                    }
                }
                GateKind::JsonFieldExists => {
                    if gate.json_path.as_deref().unwrap_or("").is_empty() {
                        issues.push(ValidationIssue::new(
                            format!("qualityGates[{idx}].jsonPath"),
                            "json_field_exists gates require a jsonPath",
                        ));
                    }
                }
                GateKind::ArtifactExists => {
                    if gate.artifact_path.as_deref().unwrap_or("").is_empty() {
                        issues.push(ValidationIssue::new(
                            format!("qualityGates[{idx}].artifactPath"),
                            "artifact_exists gates require an artifactPath",
                        ));
                    }
                }
                GateKind::ManualApproval => {}
            }
        }

        issues
    }
}
