// Run executor
// Drives one PipelineRun to a terminal status: dynamic step routing over the
// link graph, retry with capped backoff, quality gates, approval suspension,
// loop and execution budgets, cooperative cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cadence_core::{resolution_order, CadenceError, Result, StateStore, SecureInputVault};
use cadence_providers::process::is_transient;
use cadence_providers::{AuthMode, CredentialResolver, ProviderRegistry};
use cadence_types::{
    Approval, ApprovalStatus, LinkCondition, Pipeline, RunStatus, Step, StepRun, StepRunStatus,
    WorkflowOutcome,
};

use crate::gates::evaluate_gates;
use crate::step_runner::{dispatch_step, render_context};

/// Maximum attempts per step visit, shared between gate retries and
/// transient provider errors.
pub const STEP_RETRY_CAP: u32 = 3;

/// Capped exponential backoff between transient retries.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Auth-classified failures on the API-key path before falling back to OAuth.
const AUTH_FALLBACK_THRESHOLD: u32 = 2;

/// Everything a run worker needs, shared across the runtime.
pub struct RunEnvironment {
    pub store: Arc<dyn StateStore>,
    pub providers: ProviderRegistry,
    pub credentials: Arc<dyn CredentialResolver>,
    pub vault: Arc<SecureInputVault>,
}

/// How a worker left the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The run reached completed/failed/cancelled.
    Terminal,
    /// The run is paused or awaiting approval; a new worker attaches later.
    Suspended,
}

#[derive(Default)]
struct AuthState {
    failures: u32,
    forced_oauth: bool,
}

/// Execute one run to termination or suspension. All recoverable errors are
/// folded into step outcomes; an `Err` here means state persistence itself
/// failed and the caller cancels the run.
pub async fn execute_run(
    env: Arc<RunEnvironment>,
    pipeline: Pipeline,
    run_id: String,
    inputs: HashMap<String, String>,
    cancel: CancellationToken,
) -> Result<WorkerExit> {
    let store = env.store.clone();
    let order = resolution_order(&pipeline.steps, &pipeline.links);
    let settings = pipeline.settings.clamped();

    // Build the pending-step skeleton and flip to running.
    let steps_by_id: HashMap<&str, &Step> =
        pipeline.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    {
        let order = order.clone();
        let skeleton: Vec<StepRun> = order
            .iter()
            .take(settings.max_step_executions as usize)
            .filter_map(|id| steps_by_id.get(id.as_str()).map(|s| StepRun::pending(s)))
            .collect();
        store
            .update_run(
                &run_id,
                Box::new(move |run| {
                    if run.step_runs.is_empty() {
                        run.step_runs = skeleton;
                    }
                    if run.status == RunStatus::Queued {
                        run.set_status(RunStatus::Running);
                        run.push_log("Run started");
                    }
                }),
            )
            .await?;
    }

    // Resume bookkeeping: a Running record means we suspended mid-gate for an
    // approval. Approved -> finalize it; otherwise it re-runs.
    finalize_resumed_step(&store, &run_id).await?;

    let mut auth_state: HashMap<String, AuthState> = HashMap::new();
    let mut retry_same: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Ok(WorkerExit::Terminal);
        }
        let Some(run) = store.get_run(&run_id).await else {
            return Err(CadenceError::NotFound(format!("run {run_id}")));
        };
        match run.status {
            RunStatus::Paused => return Ok(WorkerExit::Suspended),
            RunStatus::AwaitingApproval => return Ok(WorkerExit::Suspended),
            status if status.is_terminal() => return Ok(WorkerExit::Terminal),
            _ => {}
        }

        // Route to the next step.
        let visits = visit_counts(&run.step_runs);
        let dispatches: u32 = run.step_runs.iter().map(|r| r.attempts).sum();
        let last = run
            .step_runs
            .iter()
            .rev()
            .find(|r| matches!(r.status, StepRunStatus::Completed | StepRunStatus::Failed));

        let next_step_id = match retry_same.take() {
            Some(id) => Some(id),
            None => match route_next(&pipeline, &order, &visits, settings.max_loops, last) {
                RouteDecision::Step(id) => Some(id),
                RouteDecision::Fallback(id, name) => {
                    store
                        .update_run(
                            &run_id,
                            Box::new(move |run| {
                                run.push_log(format!(
                                    "disconnected_fallback: routing to orchestrator '{name}'"
                                ));
                            }),
                        )
                        .await?;
                    Some(id)
                }
                RouteDecision::Finish => {
                    let failed = last.map(|l| l.outcome == WorkflowOutcome::Fail).unwrap_or(false);
                    store
                        .update_run(
                            &run_id,
                            Box::new(move |run| {
                                mark_pending_skipped(run);
                                if failed {
                                    run.set_status(RunStatus::Failed);
                                    run.push_log("Run failed: final step reported fail with no recovery route");
                                } else {
                                    run.set_status(RunStatus::Completed);
                                    run.push_log("Run completed");
                                }
                            }),
                        )
                        .await?;
                    return Ok(WorkerExit::Terminal);
                }
            },
        };

        let Some(step_id) = next_step_id else {
            return Ok(WorkerExit::Terminal);
        };
        let Some(step) = steps_by_id.get(step_id.as_str()).copied() else {
            let step_id_for_log = step_id.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        mark_pending_skipped(run);
                        run.set_status(RunStatus::Failed);
                        run.push_log(format!("Run failed: unknown step '{step_id_for_log}'"));
                    }),
                )
                .await?;
            return Ok(WorkerExit::Terminal);
        };

        // Execution budget.
        if dispatches >= settings.max_step_executions {
            let budget = settings.max_step_executions;
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        mark_pending_skipped(run);
                        run.set_status(RunStatus::Failed);
                        run.push_log(format!(
                            "Run failed: step_budget_exhausted ({budget} executions)"
                        ));
                    }),
                )
                .await?;
            return Ok(WorkerExit::Terminal);
        }

        // Render input context from the previous completed output. The copy
        // stored on the record is rendered from the masked inputs so secrets
        // never land in state.json.
        let previous_output = last.map(|l| l.output.clone()).unwrap_or_default();
        let rendered = render_context(&step.context_template, &run.task, &previous_output, &inputs);
        let rendered_for_record =
            render_context(&step.context_template, &run.task, &previous_output, &run.inputs);

        // Open (or create) the step record for this attempt.
        let step_snapshot = step.clone();
        store
            .update_run(
                &run_id,
                Box::new(move |run| {
                    let attempt = open_step_record(run, &step_snapshot, rendered_for_record);
                    run.push_log(format!(
                        "Step '{}' started (attempt {attempt}) via {}/{}",
                        step_snapshot.name, step_snapshot.provider_id, step_snapshot.model
                    ));
                }),
            )
            .await?;

        // Credentials: resolve just before spawn; apply the OAuth fallback if
        // this provider burned its API-key attempts.
        let auth = auth_state.entry(step.provider_id.clone()).or_default();
        let mut credentials = match env.credentials.resolve(&step.provider_id).await {
            Ok(credentials) => credentials,
            Err(err) => {
                fail_step(&store, &run_id, &step.id, format!("credential resolution failed: {err}"))
                    .await?;
                retry_same = None;
                continue;
            }
        };
        if auth.forced_oauth && credentials.oauth_available {
            credentials = credentials.with_mode(AuthMode::OAuth);
        }

        let Some(adapter) = env.providers.get(&step.provider_id).await else {
            let provider = step.provider_id.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        mark_pending_skipped(run);
                        run.set_status(RunStatus::Failed);
                        run.push_log(format!("Run failed: provider '{provider}' not configured"));
                    }),
                )
                .await?;
            return Ok(WorkerExit::Terminal);
        };

        let mcp_names: Vec<String> = {
            let mut names = Vec::new();
            for id in &step.mcp_server_ids {
                if let Some(server) = store.get_mcp_server(id).await {
                    names.push(server.name);
                }
            }
            names
        };

        let dispatch = dispatch_step(
            adapter,
            &credentials,
            step,
            &rendered,
            &mcp_names,
            settings.stage_timeout_ms,
            cancel.clone(),
        )
        .await;

        if cancel.is_cancelled() {
            return Ok(WorkerExit::Terminal);
        }

        // Flush tool/progress log lines gathered during the stream.
        if !dispatch.logs.is_empty() {
            let lines = dispatch.logs.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        for line in lines {
                            run.push_log(line);
                        }
                    }),
                )
                .await?;
        }

        // OAuth fallback accounting.
        auth.failures += dispatch.auth_failures;
        if !auth.forced_oauth
            && auth.failures >= AUTH_FALLBACK_THRESHOLD
            && credentials.oauth_available
        {
            auth.forced_oauth = true;
            let provider = step.provider_id.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        run.push_log(format!(
                            "Switching provider '{provider}' to OAuth after repeated 401s"
                        ));
                    }),
                )
                .await?;
        }

        // Provider/subprocess errors.
        if let Some(error) = dispatch.error.clone() {
            let attempts = current_attempts(&store, &run_id, &step.id).await;
            if is_transient(&error) && attempts < STEP_RETRY_CAP {
                let backoff = RETRY_BACKOFF[((attempts as usize).saturating_sub(1)).min(2)];
                let step_name = step.name.clone();
                store
                    .update_run(
                        &run_id,
                        Box::new(move |run| {
                            run.push_log(format!(
                                "Step '{step_name}' transient error, retrying in {}s: {error}",
                                backoff.as_secs()
                            ));
                        }),
                    )
                    .await?;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Ok(WorkerExit::Terminal),
                }
                retry_same = Some(step.id.clone());
                continue;
            }
            fail_step(&store, &run_id, &step.id, error).await?;
            retry_same = None;
            continue;
        }

        // Quality gates.
        let evaluation = evaluate_gates(
            store.as_ref(),
            &pipeline.id,
            &run_id,
            &pipeline.quality_gates,
            step,
            &dispatch.output,
        )
        .await;

        // Record dispatch results before any suspension so resume can
        // finalize from the stored record.
        {
            let output = dispatch.output.clone();
            let notes = dispatch.subagent_notes.clone();
            let outcome = dispatch.outcome_or_neutral();
            let gate_results = evaluation.results.clone();
            let step_id_for_record = step.id.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        if let Some(record) = open_record_mut(run, &step_id_for_record) {
                            record.output = output;
                            record.subagent_notes = notes;
                            record.outcome = outcome;
                            record.gate_results = gate_results;
                        }
                    }),
                )
                .await?;
        }

        if let Some(failure) = evaluation.blocking_failure() {
            let attempts = current_attempts(&store, &run_id, &step.id).await;
            let gate_name = failure.gate_name.clone();
            let detail = failure.detail.clone().unwrap_or_default();
            if attempts < STEP_RETRY_CAP {
                let step_name = step.name.clone();
                store
                    .update_run(
                        &run_id,
                        Box::new(move |run| {
                            run.push_log(format!(
                                "Gate '{gate_name}' failed on '{step_name}', retrying: {detail}"
                            ));
                        }),
                    )
                    .await?;
                retry_same = Some(step.id.clone());
                continue;
            }
            let step_id_for_record = step.id.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        if let Some(record) = open_record_mut(run, &step_id_for_record) {
                            record.status = StepRunStatus::Failed;
                            record.outcome = WorkflowOutcome::Fail;
                            record.error = Some(format!("gate '{gate_name}' failed: {detail}"));
                            record.finished_at = Some(chrono::Utc::now());
                        }
                        mark_pending_skipped(run);
                        run.set_status(RunStatus::Failed);
                        run.push_log(format!(
                            "Run failed: blocking gate '{gate_name}' still failing after {STEP_RETRY_CAP} attempts"
                        ));
                    }),
                )
                .await?;
            return Ok(WorkerExit::Terminal);
        }

        for result in evaluation.results.iter().filter(|r| !r.passed) {
            let line = format!(
                "Gate '{}' failed (non-blocking): {}",
                result.gate_name,
                result.detail.clone().unwrap_or_default()
            );
            store
                .update_run(&run_id, Box::new(move |run| run.push_log(line)))
                .await?;
        }

        // Manual approval gates suspend the run; the worker exits and is
        // re-attached when the approval resolves.
        if let Some(gate) = next_unapproved_manual_gate(&store, &run_id, &evaluation.manual_gates, &step.id).await
        {
            let gate_name = gate.name.clone();
            let gate_id = gate.id.clone();
            let step_id_for_record = step.id.clone();
            let step_name = step.name.clone();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        run.approvals
                            .push(Approval::pending(step_id_for_record, gate_id));
                        run.set_status(RunStatus::AwaitingApproval);
                        run.push_log(format!(
                            "Awaiting approval for gate '{gate_name}' on step '{step_name}'"
                        ));
                    }),
                )
                .await?;
            return Ok(WorkerExit::Suspended);
        }

        // Step complete.
        {
            let step_id_for_record = step.id.clone();
            let step_name = step.name.clone();
            let outcome = dispatch.outcome_or_neutral();
            let tail = dispatch.output_tail();
            store
                .update_run(
                    &run_id,
                    Box::new(move |run| {
                        if let Some(record) = open_record_mut(run, &step_id_for_record) {
                            record.status = StepRunStatus::Completed;
                            record.finished_at = Some(chrono::Utc::now());
                        }
                        run.push_log(format!(
                            "Step '{step_name}' completed ({})",
                            match outcome {
                                WorkflowOutcome::Pass => "pass",
                                WorkflowOutcome::Fail => "fail",
                                WorkflowOutcome::Neutral => "neutral",
                                WorkflowOutcome::Skipped => "skipped",
                            }
                        ));
                        if !tail.is_empty() {
                            run.push_log(format!("Output tail: {tail}"));
                        }
                    }),
                )
                .await?;
        }

        // Persist the step output as an artifact when requested.
        if step.store_isolated || step.store_shared {
            let relative = format!("steps/{}.md", step.id);
            let _ = store
                .write_artifact(&pipeline.id, &run_id, &relative, &dispatch.output, step.store_shared)
                .await;
        }

        retry_same = None;
    }
}

// ============================================================================
// Routing
// ============================================================================

enum RouteDecision {
    Step(String),
    /// Orchestrator fallback: step id + display name.
    Fallback(String, String),
    Finish,
}

fn route_next(
    pipeline: &Pipeline,
    order: &[String],
    visits: &HashMap<String, u32>,
    max_loops: u32,
    last: Option<&StepRun>,
) -> RouteDecision {
    let Some(last) = last else {
        return match order.first() {
            Some(first) => RouteDecision::Step(first.clone()),
            None => RouteDecision::Finish,
        };
    };

    let outcome = last.outcome;
    for link in pipeline
        .links
        .iter()
        .filter(|l| l.source_step_id == last.step_id)
    {
        let matches = match link.condition {
            LinkCondition::Always => true,
            LinkCondition::OnPass => outcome == WorkflowOutcome::Pass,
            LinkCondition::OnFail => outcome == WorkflowOutcome::Fail,
        };
        if !matches {
            continue;
        }
        let prior = visits.get(&link.target_step_id).copied().unwrap_or(0);
        // First entry is free; re-entries are bounded by the loop cap.
        if prior > max_loops {
            continue;
        }
        return RouteDecision::Step(link.target_step_id.clone());
    }

    if let Some(orchestrator) = pipeline.orchestrator_step() {
        if orchestrator.id != last.step_id {
            let prior = visits.get(&orchestrator.id).copied().unwrap_or(0);
            if prior < max_loops {
                return RouteDecision::Fallback(orchestrator.id.clone(), orchestrator.name.clone());
            }
        }
    }

    RouteDecision::Finish
}

/// Steps never reached keep a skeleton record; close them out as skipped.
fn mark_pending_skipped(run: &mut cadence_types::PipelineRun) {
    for record in &mut run.step_runs {
        if record.status == StepRunStatus::Pending {
            record.status = StepRunStatus::Skipped;
            record.outcome = WorkflowOutcome::Skipped;
        }
    }
}

fn visit_counts(records: &[StepRun]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for record in records {
        if record.attempts > 0 {
            *counts.entry(record.step_id.clone()).or_insert(0) += 1;
        }
    }
    counts
}

// ============================================================================
// Record helpers
// ============================================================================

/// The record currently open for a step: the last one that is Running, or a
/// pending skeleton entry to claim, or a fresh record appended for a revisit.
fn open_step_record(run: &mut cadence_types::PipelineRun, step: &Step, input_context: String) -> u32 {
    if let Some(record) = run
        .step_runs
        .iter_mut()
        .rev()
        .find(|r| r.step_id == step.id && r.status == StepRunStatus::Running)
    {
        record.attempts += 1;
        record.input_context = input_context;
        return record.attempts;
    }
    if let Some(record) = run
        .step_runs
        .iter_mut()
        .find(|r| r.step_id == step.id && r.status == StepRunStatus::Pending)
    {
        record.status = StepRunStatus::Running;
        record.attempts = 1;
        record.input_context = input_context;
        record.started_at = Some(chrono::Utc::now());
        return 1;
    }
    let mut record = StepRun::pending(step);
    record.status = StepRunStatus::Running;
    record.attempts = 1;
    record.input_context = input_context;
    record.started_at = Some(chrono::Utc::now());
    run.step_runs.push(record);
    1
}

fn open_record_mut<'a>(
    run: &'a mut cadence_types::PipelineRun,
    step_id: &str,
) -> Option<&'a mut StepRun> {
    run.step_runs
        .iter_mut()
        .rev()
        .find(|r| r.step_id == step_id && r.status == StepRunStatus::Running)
}

async fn current_attempts(store: &Arc<dyn StateStore>, run_id: &str, step_id: &str) -> u32 {
    store
        .get_run(run_id)
        .await
        .and_then(|run| {
            run.step_runs
                .iter()
                .rev()
                .find(|r| r.step_id == step_id && r.status == StepRunStatus::Running)
                .map(|r| r.attempts)
        })
        .unwrap_or(0)
}

async fn fail_step(
    store: &Arc<dyn StateStore>,
    run_id: &str,
    step_id: &str,
    error: String,
) -> Result<()> {
    let step_id = step_id.to_string();
    store
        .update_run(
            run_id,
            Box::new(move |run| {
                let mut failed_name = None;
                if let Some(record) = open_record_mut(run, &step_id) {
                    failed_name = Some(record.step_name.clone());
                    record.status = StepRunStatus::Failed;
                    record.outcome = WorkflowOutcome::Fail;
                    record.error = Some(error.clone());
                    record.finished_at = Some(chrono::Utc::now());
                }
                if let Some(name) = failed_name {
                    run.push_log(format!("Step '{name}' failed: {error}"));
                }
            }),
        )
        .await?;
    Ok(())
}

/// Complete a step left Running by an approval suspension once every one of
/// its approvals is approved.
async fn finalize_resumed_step(store: &Arc<dyn StateStore>, run_id: &str) -> Result<()> {
    let Some(run) = store.get_run(run_id).await else {
        return Ok(());
    };
    let Some(record) = run
        .step_runs
        .iter()
        .rev()
        .find(|r| r.status == StepRunStatus::Running)
    else {
        return Ok(());
    };
    let step_id = record.step_id.clone();
    let all_approved = run
        .approvals
        .iter()
        .filter(|a| a.step_id == step_id)
        .all(|a| a.status == ApprovalStatus::Approved);
    let any = run.approvals.iter().any(|a| a.step_id == step_id);
    if !any || !all_approved {
        return Ok(());
    }
    store
        .update_run(
            run_id,
            Box::new(move |run| {
                let mut completed = None;
                if let Some(record) = open_record_mut(run, &step_id) {
                    completed = Some((record.step_name.clone(), record.outcome));
                    record.status = StepRunStatus::Completed;
                    record.finished_at = Some(chrono::Utc::now());
                }
                if let Some((name, outcome)) = completed {
                    run.push_log(format!(
                        "Step '{name}' completed ({}) after approval",
                        match outcome {
                            WorkflowOutcome::Pass => "pass",
                            WorkflowOutcome::Fail => "fail",
                            WorkflowOutcome::Neutral => "neutral",
                            WorkflowOutcome::Skipped => "skipped",
                        }
                    ));
                }
            }),
        )
        .await?;
    Ok(())
}

/// First manual gate on this step without an approved approval record.
async fn next_unapproved_manual_gate(
    store: &Arc<dyn StateStore>,
    run_id: &str,
    manual_gates: &[cadence_types::QualityGate],
    step_id: &str,
) -> Option<cadence_types::QualityGate> {
    if manual_gates.is_empty() {
        return None;
    }
    let run = store.get_run(run_id).await?;
    manual_gates
        .iter()
        .find(|gate| {
            !run.approvals.iter().any(|a| {
                a.step_id == step_id
                    && a.gate_id == gate.id
                    && a.status == ApprovalStatus::Approved
            })
        })
        .cloned()
}
