// End-to-end runtime scenarios with injected provider adapters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cadence_core::{
    AesGcmEncryptor, JsonStateStore, ManualClock, Result, SecureInputVault, StateStore,
};
use cadence_providers::{
    CredentialResolver, Credentials, InvokeParams, ProviderAdapter, ProviderEvent,
    ProviderOAuthStatus, ProviderRegistry, ProviderStream,
};
use cadence_types::{
    ApprovalStatus, GateKind, Link, LinkCondition, OutputFormat, Pipeline, PipelineRun,
    QualityGate, RunMode, RunStatus, Schedule, Step, StepRole, StepRunStatus, WorkflowOutcome,
    MASK_SENTINEL,
};

use crate::executor::RunEnvironment;
use crate::queue::{QueueOutcome, RunQueue};
use crate::recovery::recover_interrupted_runs;
use crate::scheduler::Scheduler;

// ============================================================================
// Test doubles
// ============================================================================

/// Replays scripted event sequences, one per invocation, then a default.
struct ScriptedAdapter {
    id: String,
    scripts: std::sync::Mutex<VecDeque<Vec<ProviderEvent>>>,
    fallback: Vec<ProviderEvent>,
}

impl ScriptedAdapter {
    fn new(id: &str, scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            id: id.to_string(),
            scripts: std::sync::Mutex::new(scripts.into()),
            fallback: vec![pass_chunk("ok")],
        }
    }
}

fn pass_chunk(text: &str) -> ProviderEvent {
    ProviderEvent::Chunk {
        text: format!("{text}\nWORKFLOW_STATUS: PASS"),
        meta: json!({"type": "assistant"}),
    }
}

fn fail_chunk(text: &str) -> ProviderEvent {
    ProviderEvent::Chunk {
        text: format!("{text}\nWORKFLOW_STATUS: FAIL"),
        meta: json!({"type": "assistant"}),
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        _credentials: &Credentials,
        _prompt: &str,
        _params: &InvokeParams,
        _cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        let events = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

/// Sleeps before yielding so cancellation and pause can land mid-step. The
/// sleep races the cancellation token, like a real subprocess wait.
struct SlowAdapter {
    id: String,
    delay: Duration,
}

#[async_trait]
impl ProviderAdapter for SlowAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        _credentials: &Credentials,
        _prompt: &str,
        _params: &InvokeParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        let delay = self.delay;
        let stream = async_stream_like(delay, cancel);
        Ok(stream)
    }
}

fn async_stream_like(delay: Duration, cancel: CancellationToken) -> ProviderStream {
    Box::pin(futures::stream::unfold(
        (false, delay, cancel),
        |(done, delay, cancel)| async move {
            if done {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(delay) => {
                    Some((Ok(pass_chunk("slow ok")), (true, delay, cancel)))
                }
            }
        },
    ))
}

struct StaticResolver;

#[async_trait]
impl CredentialResolver for StaticResolver {
    async fn resolve(&self, _provider_id: &str) -> Result<Credentials> {
        Ok(Credentials {
            api_key: None,
            oauth_available: true,
            mode: Default::default(),
        })
    }

    async fn status(&self, _provider_id: &str, _deep: bool) -> Result<ProviderOAuthStatus> {
        Ok(ProviderOAuthStatus {
            logged_in: true,
            can_use_api: false,
            can_use_cli: true,
            account: None,
        })
    }
}

// ============================================================================
// Builders
// ============================================================================

async fn build_env(
    dir: &std::path::Path,
    adapter: Arc<dyn ProviderAdapter>,
) -> (Arc<RunEnvironment>, RunQueue) {
    let store = Arc::new(JsonStateStore::new(dir).await.unwrap());
    let encryptor = Arc::new(AesGcmEncryptor::from_salt(&[5u8; 32]).unwrap());
    let vault = Arc::new(
        SecureInputVault::new(store.secure_inputs_dir(), encryptor).unwrap(),
    );
    let providers = ProviderRegistry::new();
    providers.register(adapter).await;
    let env = Arc::new(RunEnvironment {
        store,
        providers,
        credentials: Arc::new(StaticResolver),
        vault,
    });
    let queue = RunQueue::new(env.clone());
    (env, queue)
}

fn step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        role: StepRole::Executor,
        prompt: "echo".to_string(),
        provider_id: "claude".to_string(),
        model: "sonnet".to_string(),
        reasoning_effort: None,
        fast_mode: false,
        wide_context: false,
        context_window_tokens: None,
        context_template: "Task:\n{{task}}".to_string(),
        enable_delegation: false,
        delegation_count: 1,
        store_isolated: false,
        store_shared: false,
        mcp_server_ids: Vec::new(),
        output_format: OutputFormat::Markdown,
        required_output_fields: Vec::new(),
        required_output_files: Vec::new(),
    }
}

fn link(src: &str, dst: &str, condition: LinkCondition) -> Link {
    Link {
        id: format!("{src}->{dst}"),
        source_step_id: src.to_string(),
        target_step_id: dst.to_string(),
        condition,
    }
}

async fn create_pipeline(env: &Arc<RunEnvironment>, mut pipeline: Pipeline) -> Pipeline {
    pipeline.normalize();
    env.store.create_pipeline(pipeline).await.unwrap()
}

async fn wait_until(
    store: &Arc<dyn StateStore>,
    run_id: &str,
    what: &str,
    predicate: impl Fn(&PipelineRun) -> bool,
) -> PipelineRun {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(run) = store.get_run(run_id).await {
                if predicate(&run) {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn launch(queue: &RunQueue, pipeline_id: &str, task: &str) -> PipelineRun {
    match queue
        .queue_run(pipeline_id, task.to_string(), HashMap::new(), false, RunMode::Smart)
        .await
        .unwrap()
    {
        QueueOutcome::Launched(run) => run,
        QueueOutcome::Rejected(plan) => panic!("unexpected rejection: {:?}", plan.checks),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn happy_path_single_step_completes() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(
        "claude",
        vec![vec![
            ProviderEvent::Chunk {
                text: "ok".to_string(),
                meta: json!({"type": "assistant"}),
            },
            ProviderEvent::FinalStatus {
                status: "PASS".to_string(),
            },
        ]],
    ));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("echo");
    pipeline.steps.push(step("s1"));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "hello").await;
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;

    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.finished_at.is_some());
    let record = &done.step_runs[0];
    assert_eq!(record.status, StepRunStatus::Completed);
    assert_eq!(record.outcome, WorkflowOutcome::Pass);
    assert!(record.output.contains("ok"));
}

#[tokio::test]
async fn conditional_branch_takes_on_fail_edge() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(
        "claude",
        vec![
            vec![fail_chunk("a broke")],
            vec![pass_chunk("c fixed it")],
        ],
    ));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("branchy");
    pipeline.steps.push(step("a"));
    pipeline.steps.push(step("b"));
    pipeline.steps.push(step("c"));
    pipeline.links.push(link("a", "b", LinkCondition::OnPass));
    pipeline.links.push(link("a", "c", LinkCondition::OnFail));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;

    assert_eq!(done.status, RunStatus::Completed);
    let by_step = |id: &str| done.step_runs.iter().find(|r| r.step_id == id).unwrap();
    assert_eq!(by_step("a").status, StepRunStatus::Completed);
    assert_eq!(by_step("a").outcome, WorkflowOutcome::Fail);
    assert_eq!(by_step("c").status, StepRunStatus::Completed);
    assert_eq!(by_step("b").status, StepRunStatus::Skipped);
}

#[tokio::test]
async fn cancellation_mid_stream_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(SlowAdapter {
        id: "claude".to_string(),
        delay: Duration::from_secs(5),
    });
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("slow");
    pipeline.steps.push(step("s1"));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    wait_until(&env.store, &run.id, "run to start", |r| {
        r.status == RunStatus::Running
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let cancelled = queue.cancel_run(&run.id, "Stopped by user").await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());
    assert!(cancelled.logs.iter().any(|l| l.contains("Stopped by user")));

    // The worker unwinds promptly instead of waiting out the 5s stream.
    tokio::time::timeout(Duration::from_secs(3), async {
        while queue.has_controller(&run.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller was not removed");
    assert!(started.elapsed() < Duration::from_secs(3));

    // Idempotent: cancelling a terminal run is a no-op.
    let again = queue.cancel_run(&run.id, "Stopped by user").await.unwrap();
    assert_eq!(again.status, RunStatus::Cancelled);
    assert_eq!(again.finished_at, cancelled.finished_at);
}

#[tokio::test]
async fn preflight_rejects_missing_inputs_without_creating_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("needs key");
    let mut s = step("s1");
    s.prompt = "Deploy with {{API_KEY}}".to_string();
    pipeline.steps.push(s);
    let pipeline = create_pipeline(&env, pipeline).await;

    let outcome = queue
        .queue_run(&pipeline.id, "go".to_string(), HashMap::new(), false, RunMode::Smart)
        .await
        .unwrap();
    let QueueOutcome::Rejected(plan) = outcome else {
        panic!("expected preflight rejection");
    };
    assert!(plan
        .failed_checks()
        .iter()
        .any(|c| c.id == "inputs.API_KEY"));
    assert!(env.store.list_runs(None).await.is_empty());
}

#[tokio::test]
async fn sensitive_inputs_are_masked_on_the_record_and_merged_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("deploy");
    let mut s = step("s1");
    s.prompt = "Deploy using {{API_KEY}}".to_string();
    s.context_template = "Task:\n{{task}}\nKey: {{API_KEY}}".to_string();
    pipeline.steps.push(s);
    let pipeline = create_pipeline(&env, pipeline).await;

    let mut inputs = HashMap::new();
    inputs.insert("API_KEY".to_string(), "sk-live-very-secret".to_string());
    let outcome = queue
        .queue_run(&pipeline.id, "go".to_string(), inputs, true, RunMode::Smart)
        .await
        .unwrap();
    let QueueOutcome::Launched(run) = outcome else {
        panic!("expected launch");
    };

    assert_eq!(run.inputs.get("API_KEY").unwrap(), MASK_SENTINEL);
    assert_eq!(
        env.vault.get(&pipeline.id).await.unwrap().get("API_KEY").unwrap(),
        "sk-live-very-secret"
    );

    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    let record = &done.step_runs[0];
    assert!(!record.input_context.contains("sk-live-very-secret"));
    assert!(record.input_context.contains(MASK_SENTINEL));
}

#[tokio::test]
async fn manual_approval_suspends_then_resumes_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("gated");
    pipeline.steps.push(step("s1"));
    pipeline.quality_gates.push(QualityGate {
        id: "g1".to_string(),
        name: "human check".to_string(),
        target_step_id: "s1".to_string(),
        kind: GateKind::ManualApproval,
        blocking: true,
        pattern: None,
        pattern_flags: None,
        json_path: None,
        artifact_path: None,
        message: None,
    });
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let waiting = wait_until(&env.store, &run.id, "awaiting approval", |r| {
        r.status == RunStatus::AwaitingApproval
    })
    .await;
    assert_eq!(waiting.approvals.len(), 1);

    // The worker detaches while a human decides.
    tokio::time::timeout(Duration::from_secs(3), async {
        while queue.has_controller(&run.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller not removed while awaiting approval");

    let approval_id = waiting.approvals[0].id.clone();
    let resumed = queue
        .resolve_approval(&run.id, &approval_id, true, Some("looks good".to_string()))
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Running);

    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.approvals[0].status, ApprovalStatus::Approved);
    assert_eq!(done.step_runs[0].status, StepRunStatus::Completed);

    // Resolving again conflicts.
    assert!(queue
        .resolve_approval(&run.id, &approval_id, true, None)
        .await
        .is_err());
}

#[tokio::test]
async fn rejected_approval_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("gated");
    pipeline.steps.push(step("s1"));
    pipeline.quality_gates.push(QualityGate {
        id: "g1".to_string(),
        name: "human check".to_string(),
        target_step_id: "s1".to_string(),
        kind: GateKind::ManualApproval,
        blocking: true,
        pattern: None,
        pattern_flags: None,
        json_path: None,
        artifact_path: None,
        message: None,
    });
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let waiting = wait_until(&env.store, &run.id, "awaiting approval", |r| {
        r.status == RunStatus::AwaitingApproval
    })
    .await;
    let failed = queue
        .resolve_approval(&run.id, &waiting.approvals[0].id, false, None)
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.finished_at.is_some());
}

#[tokio::test]
async fn step_budget_exhaustion_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("looper");
    pipeline.steps.push(step("a"));
    pipeline.links.push(link("a", "a", LinkCondition::Always));
    pipeline.settings.max_step_executions = 4;
    pipeline.settings.max_loops = 12;
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Failed);
    assert!(done
        .logs
        .iter()
        .any(|l| l.contains("step_budget_exhausted")));
    let dispatches: u32 = done.step_runs.iter().map(|r| r.attempts).sum();
    assert!(dispatches <= 4);
}

#[tokio::test(start_paused = true)]
async fn transient_provider_errors_retry_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new(
        "claude",
        vec![
            vec![ProviderEvent::Error {
                message: "transient: codex exited 1 with no output".to_string(),
            }],
            vec![pass_chunk("second time lucky")],
        ],
    ));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("flaky");
    pipeline.steps.push(step("s1"));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.step_runs[0].attempts, 2);
    assert!(done.logs.iter().any(|l| l.contains("retrying")));
}

#[tokio::test]
async fn orchestrator_fallback_routes_disconnected_steps() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("supervised");
    let mut orch = step("orch");
    orch.role = StepRole::Orchestrator;
    pipeline.steps.push(orch);
    pipeline.steps.push(step("exec"));
    pipeline.links.push(link("orch", "exec", LinkCondition::Always));
    pipeline.settings.max_loops = 2;
    pipeline.settings.max_step_executions = 8;
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done
        .logs
        .iter()
        .any(|l| l.contains("disconnected_fallback")));
}

#[tokio::test]
async fn pause_suspends_and_resume_reattaches() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(SlowAdapter {
        id: "claude".to_string(),
        delay: Duration::from_millis(150),
    });
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("two step");
    pipeline.steps.push(step("a"));
    pipeline.steps.push(step("b"));
    pipeline.links.push(link("a", "b", LinkCondition::Always));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = launch(&queue, &pipeline.id, "go").await;
    wait_until(&env.store, &run.id, "run to start", |r| {
        r.status == RunStatus::Running
    })
    .await;
    let paused = queue.pause_run(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);

    // Worker finishes the in-flight step, then detaches.
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.has_controller(&run.id).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller not removed after pause");

    let resumed = queue.resume_run(&run.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.logs.iter().any(|l| l.contains("Run paused")));
    assert!(done.logs.iter().any(|l| l.contains("Run resumed")));
    assert!(done.logs.iter().any(|l| l.contains("Worker re-attached")));
}

#[tokio::test]
async fn recovery_requeues_interrupted_runs() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("interrupted");
    pipeline.steps.push(step("s1"));
    let pipeline = create_pipeline(&env, pipeline).await;

    // A run that was mid-flight when the process died.
    let run = PipelineRun::new(pipeline.id.clone(), pipeline.name.clone(), "go", HashMap::new());
    let run = env.store.create_run(run).await.unwrap();
    env.store
        .update_run(
            &run.id,
            Box::new(|run| run.set_status(RunStatus::Running)),
        )
        .await
        .unwrap();

    let requeued = recover_interrupted_runs(&queue).await.unwrap();
    assert_eq!(requeued, 1);

    let done = wait_until(&env.store, &run.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done
        .logs
        .iter()
        .any(|l| l.contains("Recovered after restart")));
}

#[tokio::test]
async fn recovery_cancels_orphan_runs() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let run = PipelineRun::new("ghost", "ghost", "go", HashMap::new());
    let run = env.store.create_run(run).await.unwrap();

    recover_interrupted_runs(&queue).await.unwrap();
    let after = env.store.get_run(&run.id).await.unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(after
        .logs
        .iter()
        .any(|l| l.contains("pipeline_no_longer_exists")));
}

#[tokio::test]
async fn recovery_leaves_awaiting_approval_runs_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = Pipeline::new("waiting");
    pipeline.steps.push(step("s1"));
    let pipeline = create_pipeline(&env, pipeline).await;

    let run = PipelineRun::new(pipeline.id.clone(), pipeline.name.clone(), "go", HashMap::new());
    let run = env.store.create_run(run).await.unwrap();
    env.store
        .update_run(
            &run.id,
            Box::new(|run| {
                run.set_status(RunStatus::Running);
                run.set_status(RunStatus::AwaitingApproval);
            }),
        )
        .await
        .unwrap();

    recover_interrupted_runs(&queue).await.unwrap();
    recover_interrupted_runs(&queue).await.unwrap();
    let after = env.store.get_run(&run.id).await.unwrap();
    assert_eq!(after.status, RunStatus::AwaitingApproval);
    // The recovery note is appended exactly once.
    let notes = after
        .logs
        .iter()
        .filter(|l| l.contains("awaiting action"))
        .count();
    assert_eq!(notes, 1);
    assert!(!queue.has_controller(&run.id).await);
}

// ============================================================================
// Scheduler scenarios
// ============================================================================

fn scheduled_pipeline(name: &str, cron: &str, tz: &str) -> Pipeline {
    let mut pipeline = Pipeline::new(name);
    pipeline.steps.push(step("s1"));
    pipeline.schedule = Some(Schedule {
        enabled: true,
        cron: cron.to_string(),
        timezone: tz.to_string(),
        task_override: None,
        run_mode: RunMode::Smart,
        inputs: HashMap::new(),
    });
    pipeline
}

#[tokio::test]
async fn scheduler_catch_up_coalesces_missed_minutes() {
    use chrono::TimeZone;
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let pipeline = create_pipeline(&env, scheduled_pipeline("minutely", "* * * * *", "UTC")).await;

    let clock = Arc::new(ManualClock::at(
        chrono::Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 7).unwrap(),
    ));
    let scheduler = Scheduler::new(queue.clone(), clock.clone(), 5);

    // Process was "down" for the preceding minutes; one tick coalesces them
    // into a single launch and advances the marker to the current minute.
    scheduler.tick().await;
    let runs = env.store.list_runs(None).await;
    assert_eq!(runs.len(), 1);
    let markers = env.store.load_scheduler_markers().await;
    assert_eq!(
        markers.get(&pipeline.id).unwrap(),
        "2025-06-02T14:30|* * * * *|UTC"
    );

    // A restarted scheduler at the same minute does not fire again.
    let fresh = Scheduler::new(queue.clone(), clock.clone(), 5);
    fresh.tick().await;
    assert_eq!(env.store.list_runs(None).await.len(), 1);
}

#[tokio::test]
async fn scheduler_fires_once_per_matching_minute() {
    use chrono::TimeZone;
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let pipeline = create_pipeline(&env, scheduled_pipeline("minutely", "* * * * *", "UTC")).await;

    let clock = Arc::new(ManualClock::at(
        chrono::Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(queue.clone(), clock.clone(), 0);

    scheduler.tick().await;
    scheduler.tick().await;
    assert_eq!(env.store.list_runs(None).await.len(), 1);

    // Wait out the first run so the pipeline is idle again.
    let first = env.store.list_runs(None).await[0].clone();
    wait_until(&env.store, &first.id, "terminal status", |r| {
        r.status.is_terminal()
    })
    .await;

    clock.advance(chrono::Duration::minutes(1));
    scheduler.tick().await;
    assert_eq!(env.store.list_runs(None).await.len(), 2);

    let markers = env.store.load_scheduler_markers().await;
    assert_eq!(
        markers.get(&pipeline.id).unwrap(),
        "2025-06-02T14:31|* * * * *|UTC"
    );
}

#[tokio::test]
async fn scheduler_stores_sentinels_for_invalid_schedules() {
    use chrono::TimeZone;
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let bad_cron =
        create_pipeline(&env, scheduled_pipeline("bad cron", "not a cron", "UTC")).await;
    let bad_tz =
        create_pipeline(&env, scheduled_pipeline("bad tz", "* * * * *", "Mars/Olympus")).await;

    let clock = Arc::new(ManualClock::at(
        chrono::Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(queue.clone(), clock, 0);
    scheduler.tick().await;

    let markers = env.store.load_scheduler_markers().await;
    assert_eq!(
        markers.get(&bad_cron.id).unwrap(),
        "invalid-cron:not a cron"
    );
    assert_eq!(
        markers.get(&bad_tz.id).unwrap(),
        "invalid-timezone:Mars/Olympus"
    );
    assert!(env.store.list_runs(None).await.is_empty());
}

#[tokio::test]
async fn scheduler_skips_when_preflight_fails_but_advances_marker() {
    use chrono::TimeZone;
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let mut pipeline = scheduled_pipeline("needs key", "* * * * *", "UTC");
    pipeline.steps[0].prompt = "Use {{API_KEY}}".to_string();
    let pipeline = create_pipeline(&env, pipeline).await;

    let clock = Arc::new(ManualClock::at(
        chrono::Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(queue.clone(), clock, 0);
    scheduler.tick().await;

    assert!(env.store.list_runs(None).await.is_empty());
    let markers = env.store.load_scheduler_markers().await;
    assert_eq!(
        markers.get(&pipeline.id).unwrap(),
        "2025-06-02T14:30|* * * * *|UTC"
    );
}

#[tokio::test]
async fn scheduler_markers_never_regress() {
    use chrono::TimeZone;
    let dir = tempfile::tempdir().unwrap();
    let adapter = Arc::new(ScriptedAdapter::new("claude", Vec::new()));
    let (env, queue) = build_env(dir.path(), adapter).await;

    let pipeline = create_pipeline(&env, scheduled_pipeline("minutely", "* * * * *", "UTC")).await;

    let mut markers = HashMap::new();
    markers.insert(
        pipeline.id.clone(),
        "2025-06-02T15:00|* * * * *|UTC".to_string(),
    );
    env.store.save_scheduler_markers(markers).await.unwrap();

    // Clock is behind the stored marker; nothing fires, nothing regresses.
    let clock = Arc::new(ManualClock::at(
        chrono::Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap(),
    ));
    let scheduler = Scheduler::new(queue.clone(), clock, 5);
    scheduler.tick().await;

    assert!(env.store.list_runs(None).await.is_empty());
    let markers = env.store.load_scheduler_markers().await;
    assert_eq!(
        markers.get(&pipeline.id).unwrap(),
        "2025-06-02T15:00|* * * * *|UTC"
    );
}
