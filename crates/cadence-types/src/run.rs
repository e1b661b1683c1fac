// Run state types
// One PipelineRun per attempt to execute a pipeline end-to-end.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Step, StepRole};

/// Hard cap on retained log lines per run. Older lines are dropped and a
/// truncation notice is kept at the front.
pub const MAX_RUN_LOG_LINES: usize = 1000;

// ============================================================================
// Run status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the transition `self -> next` is legal. Terminal states accept
    /// no transitions; pause/approval suspensions bounce back to running.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Paused)
            | (Running, AwaitingApproval)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled) => true,
            (Paused, Running) | (Paused, Cancelled) => true,
            (AwaitingApproval, Running)
            | (AwaitingApproval, Failed)
            | (AwaitingApproval, Cancelled) => true,
            // Recovery resets interrupted work back into the queue.
            (Running, Queued) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Step runs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Outcome the model reported via its final `WORKFLOW_STATUS:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Pass,
    Fail,
    Neutral,
    Skipped,
}

/// Result of evaluating one quality gate against a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub gate_id: String,
    pub gate_name: String,
    pub passed: bool,
    pub blocking: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub step_id: String,
    pub step_name: String,
    pub role: StepRole,
    pub status: StepRunStatus,
    pub attempts: u32,
    pub outcome: WorkflowOutcome,
    #[serde(default)]
    pub input_context: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub subagent_notes: Vec<String>,
    #[serde(default)]
    pub gate_results: Vec<GateResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            role: step.role,
            status: StepRunStatus::Pending,
            attempts: 0,
            outcome: WorkflowOutcome::Neutral,
            input_context: String::new(),
            output: String::new(),
            subagent_notes: Vec::new(),
            gate_results: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

// ============================================================================
// Approvals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Record of a `manual_approval` gate waiting on (or resolved by) a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub step_id: String,
    pub gate_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub note: Option<String>,
}

impl Approval {
    pub fn pending(step_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.into(),
            gate_id: gate_id.into(),
            created_at: Utc::now(),
            status: ApprovalStatus::Pending,
            note: None,
        }
    }
}

// ============================================================================
// Pipeline runs
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    /// Name snapshot so deleted pipelines still render in run history.
    pub pipeline_name: String,
    pub task: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub step_runs: Vec<StepRun>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
}

impl PipelineRun {
    pub fn new(
        pipeline_id: impl Into<String>,
        pipeline_name: impl Into<String>,
        task: impl Into<String>,
        inputs: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            pipeline_name: pipeline_name.into(),
            task: task.into(),
            inputs,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            logs: Vec::new(),
            step_runs: Vec::new(),
            approvals: Vec::new(),
        }
    }

    /// Append a timestamped log line, dropping the oldest lines past the cap.
    pub fn push_log(&mut self, line: impl AsRef<str>) {
        let stamped = format!("[{}] {}", Utc::now().format("%H:%M:%S"), line.as_ref());
        self.logs.push(stamped);
        if self.logs.len() > MAX_RUN_LOG_LINES {
            let overflow = self.logs.len() - (MAX_RUN_LOG_LINES - 1);
            self.logs.drain(0..overflow);
            self.logs
                .insert(0, format!("[log truncated, {overflow} earlier lines dropped]"));
        }
    }

    /// Move to a new status, stamping `finished_at` iff the status is terminal.
    pub fn set_status(&mut self, next: RunStatus) {
        self.status = next;
        if next.is_terminal() {
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        } else {
            self.finished_at = None;
        }
        if next == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn pending_approval(&self) -> Option<&Approval> {
        self.approvals
            .iter()
            .find(|a| a.status == ApprovalStatus::Pending)
    }

    pub fn step_run_mut(&mut self, step_id: &str) -> Option<&mut StepRun> {
        self.step_runs.iter_mut().find(|s| s.step_id == step_id)
    }
}
