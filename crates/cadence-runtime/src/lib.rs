// Cadence runtime
// Run execution engine and its lifecycle machinery: step runner, executor,
// run queue with controller registry, startup recovery, and the cron
// scheduler.

pub mod executor;
pub mod gates;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod step_runner;

#[cfg(test)]
mod scenario_tests;

pub use executor::{execute_run, RunEnvironment, WorkerExit, STEP_RETRY_CAP};
pub use queue::{QueueOutcome, RunQueue};
pub use recovery::recover_interrupted_runs;
pub use scheduler::{Scheduler, SCHEDULER_TICK};
