// Startup recovery
// Re-queues runs that were in flight when the process died, preserves runs
// waiting on a human, and cancels orphans whose pipeline no longer exists.

use cadence_core::vault::merge;
use cadence_core::{resolution_order, Result, StateStore};
use cadence_types::{ApprovalStatus, RunStatus, StepRun, StepRunStatus};

use crate::queue::RunQueue;

const RECOVERY_REQUEUED: &str = "Recovered after restart; re-queued";
const RECOVERY_WAITING: &str = "Recovered after restart; still awaiting action";

/// Scan persisted runs after state load and bring the registry back into a
/// consistent shape. Returns the number of runs re-queued.
pub async fn recover_interrupted_runs(queue: &RunQueue) -> Result<usize> {
    let env = queue.environment();
    let runs = env.store.list_runs(None).await;
    let mut requeued = 0;

    for run in runs {
        if run.status.is_terminal() {
            continue;
        }
        let pipeline = env.store.get_pipeline(&run.pipeline_id).await;
        let Some(pipeline) = pipeline else {
            queue
                .cancel_run(&run.id, "pipeline_no_longer_exists")
                .await?;
            continue;
        };

        match run.status {
            RunStatus::Queued | RunStatus::Running => {
                let order = resolution_order(&pipeline.steps, &pipeline.links);
                let steps = pipeline.steps.clone();
                let updated = env
                    .store
                    .update_run(
                        &run.id,
                        Box::new(move |run| {
                            // Drop interrupted and skeleton records, then
                            // rebuild pending skeletons for unexecuted steps.
                            run.step_runs.retain(|r| {
                                matches!(
                                    r.status,
                                    StepRunStatus::Completed
                                        | StepRunStatus::Failed
                                        | StepRunStatus::Skipped
                                )
                            });
                            for step_id in &order {
                                let executed =
                                    run.step_runs.iter().any(|r| &r.step_id == step_id);
                                if executed {
                                    continue;
                                }
                                if let Some(step) = steps.iter().find(|s| &s.id == step_id) {
                                    run.step_runs.push(StepRun::pending(step));
                                }
                            }
                            run.approvals
                                .retain(|a| a.status != ApprovalStatus::Pending);
                            run.status = RunStatus::Queued;
                            run.finished_at = None;
                            run.push_log(RECOVERY_REQUEUED);
                        }),
                    )
                    .await?;

                let secure = env.vault.get(&pipeline.id).await.unwrap_or_default();
                let merged = merge(&updated.inputs, &secure);
                queue
                    .attach_worker(pipeline, updated, merged, None)
                    .await;
                requeued += 1;
            }
            RunStatus::Paused | RunStatus::AwaitingApproval => {
                // Needs human action; only annotate, and only once.
                let already_noted = run
                    .logs
                    .last()
                    .map(|l| l.ends_with(RECOVERY_WAITING))
                    .unwrap_or(false);
                if !already_noted {
                    env.store
                        .update_run(
                            &run.id,
                            Box::new(|run| run.push_log(RECOVERY_WAITING)),
                        )
                        .await?;
                }
            }
            _ => {}
        }
    }

    Ok(requeued)
}
