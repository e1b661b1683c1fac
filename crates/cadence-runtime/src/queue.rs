// Run queue & controller registry
// Admission (preflight gate), secure input handling, worker spawn, and the
// at-most-one-controller-per-run invariant. Cancellation is re-entrant and
// idempotent; every worker exit path removes its registry entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cadence_core::preflight::{evaluate, PreflightContext};
use cadence_core::vault::{mask, merge, pick_sensitive};
use cadence_core::{CadenceError, CredentialHealth, Result, SmartRunPlan};
use cadence_types::{
    ApprovalStatus, Pipeline, PipelineRun, RunMode, RunStatus,
};

use crate::executor::{execute_run, RunEnvironment};

/// Result of an admission attempt.
#[derive(Debug)]
pub enum QueueOutcome {
    Launched(PipelineRun),
    /// Preflight had failing checks; no run record was created.
    Rejected(SmartRunPlan),
}

struct QueueInner {
    env: Arc<RunEnvironment>,
    controllers: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct RunQueue {
    inner: Arc<QueueInner>,
}

impl RunQueue {
    pub fn new(env: Arc<RunEnvironment>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                env,
                controllers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn environment(&self) -> Arc<RunEnvironment> {
        self.inner.env.clone()
    }

    pub async fn active_run_count(&self) -> usize {
        self.inner.controllers.lock().await.len()
    }

    pub async fn has_controller(&self, run_id: &str) -> bool {
        self.inner.controllers.lock().await.contains_key(run_id)
    }

    /// Whether the pipeline has any non-terminal run.
    pub async fn has_active_run(&self, pipeline_id: &str) -> bool {
        self.inner
            .env
            .store
            .list_runs(None)
            .await
            .iter()
            .any(|r| r.pipeline_id == pipeline_id && !r.status.is_terminal())
    }

    /// Evaluate the smart run plan for a pipeline without launching anything.
    pub async fn smart_run_plan(
        &self,
        pipeline_id: &str,
        inputs: &HashMap<String, String>,
        run_mode: RunMode,
    ) -> Result<SmartRunPlan> {
        let env = &self.inner.env;
        let pipeline = env
            .store
            .get_pipeline(pipeline_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("pipeline {pipeline_id}")))?;
        self.build_plan(&pipeline, inputs, run_mode).await
    }

    async fn build_plan(
        &self,
        pipeline: &Pipeline,
        inputs: &HashMap<String, String>,
        run_mode: RunMode,
    ) -> Result<SmartRunPlan> {
        let env = &self.inner.env;
        let secure_keys = env.vault.keys(&pipeline.id).await.unwrap_or_default();

        let mut provider_ids: Vec<String> = pipeline
            .steps
            .iter()
            .map(|s| s.provider_id.clone())
            .collect();
        provider_ids.sort();
        provider_ids.dedup();
        let mut credentials = HashMap::new();
        for provider_id in provider_ids {
            if let Ok(status) = env.credentials.status(&provider_id, false).await {
                credentials.insert(
                    provider_id,
                    CredentialHealth {
                        can_use_api: status.can_use_api,
                        can_use_cli: status.can_use_cli,
                        logged_in: status.logged_in,
                    },
                );
            }
        }

        let mcp_servers = env.store.list_mcp_servers().await;
        Ok(evaluate(&PreflightContext {
            pipeline,
            inputs,
            secure_keys: &secure_keys,
            credentials: &credentials,
            mcp_servers: &mcp_servers,
            run_mode,
        }))
    }

    /// Admit and launch a run. Preflight failures reject without creating a
    /// run record.
    pub async fn queue_run(
        &self,
        pipeline_id: &str,
        task: String,
        raw_inputs: HashMap<String, String>,
        persist_sensitive: bool,
        run_mode: RunMode,
    ) -> Result<QueueOutcome> {
        let env = self.inner.env.clone();
        let pipeline = env
            .store
            .get_pipeline(pipeline_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("pipeline {pipeline_id}")))?;

        // Normalize: trim keys, drop empties.
        let inputs: HashMap<String, String> = raw_inputs
            .into_iter()
            .map(|(k, v)| (k.trim().to_string(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();

        let plan = self.build_plan(&pipeline, &inputs, run_mode).await?;
        if plan.has_failures() {
            return Ok(QueueOutcome::Rejected(plan));
        }

        // Sensitive handling: optionally persist, then merge the vault copy
        // in for runtime use and mask the persisted record.
        let sensitive = pick_sensitive(&inputs);
        if persist_sensitive && !sensitive.is_empty() {
            env.vault.upsert(&pipeline.id, &sensitive).await?;
        }
        let secure = env.vault.get(&pipeline.id).await.unwrap_or_default();
        let merged = merge(&inputs, &secure);

        let mut mask_keys: Vec<String> = sensitive.keys().cloned().collect();
        mask_keys.extend(secure.keys().cloned());
        mask_keys.sort();
        mask_keys.dedup();
        let masked = mask(&merged, &mask_keys);

        let mut run = PipelineRun::new(pipeline.id.clone(), pipeline.name.clone(), task, masked);
        run.push_log("Run queued");
        let run = env.store.create_run(run).await?;

        self.attach_worker(pipeline, run.clone(), merged, None).await;
        Ok(QueueOutcome::Launched(run))
    }

    /// Spawn a worker for a run unless one is already registered. Inserted
    /// after the store commit; removed in the worker's exit block.
    pub async fn attach_worker(
        &self,
        pipeline: Pipeline,
        run: PipelineRun,
        merged_inputs: HashMap<String, String>,
        note: Option<&str>,
    ) {
        let run_id = run.id.clone();
        let token = {
            let mut controllers = self.inner.controllers.lock().await;
            if controllers.contains_key(&run_id) {
                return;
            }
            let token = CancellationToken::new();
            controllers.insert(run_id.clone(), token.clone());
            token
        };

        if let Some(note) = note {
            let line = note.to_string();
            let _ = self
                .inner
                .env
                .store
                .update_run(&run_id, Box::new(move |run| run.push_log(line)))
                .await;
        }

        let queue = self.clone();
        let env = self.inner.env.clone();
        tokio::spawn(async move {
            let result = execute_run(env, pipeline, run_id.clone(), merged_inputs, token).await;
            queue.inner.controllers.lock().await.remove(&run_id);
            if let Err(err) = result {
                tracing::error!("run {run_id} worker error: {err}");
                let _ = queue.cancel_run(&run_id, "Unexpected run error").await;
            }
        });
    }

    pub async fn pause_run(&self, run_id: &str) -> Result<PipelineRun> {
        let store = &self.inner.env.store;
        let run = store
            .get_run(run_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(CadenceError::conflict(
                "run_not_running",
                format!("run is {}", run.status.as_str()),
            ));
        }
        store
            .update_run(
                run_id,
                Box::new(|run| {
                    run.set_status(RunStatus::Paused);
                    run.push_log("Run paused");
                }),
            )
            .await
    }

    pub async fn resume_run(&self, run_id: &str) -> Result<PipelineRun> {
        let env = self.inner.env.clone();
        let run = env
            .store
            .get_run(run_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Paused {
            return Err(CadenceError::conflict(
                "run_not_paused",
                format!("run is {}", run.status.as_str()),
            ));
        }
        let updated = env
            .store
            .update_run(
                run_id,
                Box::new(|run| {
                    run.set_status(RunStatus::Running);
                    run.push_log("Run resumed");
                }),
            )
            .await?;
        self.reattach_if_needed(&updated).await?;
        Ok(updated)
    }

    /// Idempotent: cancelling a terminal run is a no-op returning the run.
    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<PipelineRun> {
        let env = self.inner.env.clone();
        let run = env
            .store
            .get_run(run_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("run {run_id}")))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let reason = reason.to_string();
        let updated = env
            .store
            .update_run(
                run_id,
                Box::new(move |run| {
                    run.set_status(RunStatus::Cancelled);
                    run.push_log(format!("Run cancelled: {reason}"));
                }),
            )
            .await?;
        // Signal the worker (if any) and drop the registry entry; the worker
        // also removes it on exit, so removal here is idempotent.
        let mut controllers = self.inner.controllers.lock().await;
        if let Some(token) = controllers.remove(run_id) {
            token.cancel();
        }
        Ok(updated)
    }

    pub async fn resolve_approval(
        &self,
        run_id: &str,
        approval_id: &str,
        approve: bool,
        note: Option<String>,
    ) -> Result<PipelineRun> {
        let env = self.inner.env.clone();
        let run = env
            .store
            .get_run(run_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(CadenceError::conflict(
                "run_not_awaiting_approval",
                format!("run is {}", run.status.as_str()),
            ));
        }
        let approval = run
            .approvals
            .iter()
            .find(|a| a.id == approval_id)
            .ok_or_else(|| CadenceError::NotFound(format!("approval {approval_id}")))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(CadenceError::conflict(
                "approval_already_resolved",
                "approval was already resolved",
            ));
        }

        let approval_id = approval_id.to_string();
        let updated = env
            .store
            .update_run(
                run_id,
                Box::new(move |run| {
                    if let Some(approval) =
                        run.approvals.iter_mut().find(|a| a.id == approval_id)
                    {
                        approval.status = if approve {
                            ApprovalStatus::Approved
                        } else {
                            ApprovalStatus::Rejected
                        };
                        approval.note = note;
                    }
                    if approve {
                        run.set_status(RunStatus::Running);
                        run.push_log("Approval granted; resuming");
                    } else {
                        run.set_status(RunStatus::Failed);
                        run.push_log("Approval rejected; run failed");
                    }
                }),
            )
            .await?;

        if approve {
            self.reattach_if_needed(&updated).await?;
        }
        Ok(updated)
    }

    /// After resume or approval the run is back in `running`; if no
    /// controller is registered, attach a fresh worker with re-merged vault
    /// entries.
    async fn reattach_if_needed(&self, run: &PipelineRun) -> Result<()> {
        if self.has_controller(&run.id).await {
            return Ok(());
        }
        let env = self.inner.env.clone();
        let Some(pipeline) = env.store.get_pipeline(&run.pipeline_id).await else {
            self.cancel_run(&run.id, "pipeline_no_longer_exists").await?;
            return Ok(());
        };
        let secure = env.vault.get(&pipeline.id).await.unwrap_or_default();
        let merged = merge(&run.inputs, &secure);
        self.attach_worker(pipeline, run.clone(), merged, Some("Worker re-attached"))
            .await;
        Ok(())
    }
}
