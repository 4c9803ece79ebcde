//! The per-process worker loop.
//!
//! A worker recovers stuck claims, then repeatedly claims one ready job
//! at a time and dispatches it to one of `parallel` execution slots.
//! Claiming stops when the time budget runs out, when a shutdown signal
//! arrives, or when nothing claimable remains and no Waiting job can
//! still progress; in-flight jobs always drain naturally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use super::args::{build_argv, split_template, ArgError, ArgMode};
use super::executor::{record_outcome, run_job};
use crate::core::deadline::{AdmissionFilter, Budget};
use crate::core::types::JobOutcome;
use crate::storage::{ClaimOutcome, JobStore, StoreError};

/// Pause between claim attempts when only Waiting jobs remain.
pub const DEFAULT_DEP_WAIT_INTERVAL: u64 = 30;

/// Worker configuration, one-to-one with the CLI flags.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Shell-syntax command template run for every job.
    pub command: String,
    pub arg_mode: ArgMode,
    /// Number of concurrent execution slots.
    pub parallel: usize,
    /// Soft deadline for claim admission, seconds.
    pub max_runtime: u64,
    /// Headroom left so in-flight jobs can commit before the host
    /// scheduler's hard kill, seconds.
    pub margin_time: u64,
    pub speed_factor: f64,
    pub smart_scheduling: bool,
    /// Seconds to sleep when claiming returns nothing but Waiting jobs
    /// remain.
    pub dep_wait_interval: u64,
}

impl WorkerOptions {
    /// Options with the documented defaults for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arg_mode: ArgMode::Positional,
            parallel: 1,
            max_runtime: 86_400,
            margin_time: 0,
            speed_factor: 1.0,
            smart_scheduling: true,
            dep_wait_interval: DEFAULT_DEP_WAIT_INTERVAL,
        }
    }
}

/// Totals reported when a worker exits cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub failed: u64,
}

/// Errors that terminate a worker. Per-job failures are not errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Args(#[from] ArgError),

    /// An execution slot panicked; treated as fatal.
    #[error("execution slot failed: {0}")]
    Slot(String),
}

/// One worker process over a shared store.
pub struct Worker {
    store: Arc<JobStore>,
    options: WorkerOptions,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(store: Arc<JobStore>, options: WorkerOptions) -> Self {
        Self {
            store,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install an external shutdown flag (set from a signal handler).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the worker until no more work is admissible, then drain.
    pub async fn run(&self) -> Result<WorkerSummary, WorkerError> {
        let base_argv = split_template(&self.options.command)?;

        let recovered = self.store.recover_stuck().await?;
        if recovered > 0 {
            warn!("recovered {} stuck running job(s) back to pending", recovered);
        }

        let budget = Budget::start(self.options.max_runtime, self.options.margin_time);
        let mut slots: JoinSet<Result<bool, StoreError>> = JoinSet::new();
        let mut summary = WorkerSummary::default();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested; no further claims");
                break;
            }
            if budget.exhausted() {
                info!("time budget exhausted; no further claims");
                break;
            }

            if slots.len() >= self.options.parallel {
                if let Some(result) = slots.join_next().await {
                    tally(result, &mut summary)?;
                }
                continue;
            }

            let filter = self.options.smart_scheduling.then(|| AdmissionFilter {
                budget_seconds: budget.remaining(),
                speed_factor: self.options.speed_factor,
            });

            match self.store.try_claim(filter.as_ref()).await {
                Ok(ClaimOutcome::Claimed(job)) => {
                    let argv = build_argv(&base_argv, self.options.arg_mode, &job.params);
                    let store = Arc::clone(&self.store);
                    slots.spawn(async move {
                        let report = run_job(&job.id, &argv).await;
                        record_outcome(&store, &job.id, &report).await?;
                        Ok(report.outcome == JobOutcome::Done)
                    });
                }
                Ok(ClaimOutcome::Idle { more_possible: true }) => {
                    // Predecessors are still in flight, here or on another
                    // node. A finishing slot may unblock work sooner than
                    // the interval elapses.
                    if slots.is_empty() {
                        sleep(Duration::from_secs(self.options.dep_wait_interval)).await;
                    } else {
                        tokio::select! {
                            result = slots.join_next() => {
                                if let Some(result) = result {
                                    tally(result, &mut summary)?;
                                }
                            }
                            _ = sleep(Duration::from_secs(self.options.dep_wait_interval)) => {}
                        }
                    }
                }
                Ok(ClaimOutcome::Idle { more_possible: false }) => {
                    info!("no runnable jobs remain; finishing up");
                    break;
                }
                Err(StoreError::LockTimeout) => {
                    // One contended attempt; the next claim retries.
                    warn!("claim attempt timed out on the store lock; retrying");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(result) = slots.join_next().await {
            tally(result, &mut summary)?;
        }

        info!(
            "worker finished: {} completed, {} failed",
            summary.completed, summary.failed
        );
        Ok(summary)
    }
}

fn tally(
    result: Result<Result<bool, StoreError>, tokio::task::JoinError>,
    summary: &mut WorkerSummary,
) -> Result<(), WorkerError> {
    match result {
        Ok(Ok(true)) => summary.completed += 1,
        Ok(Ok(false)) => summary.failed += 1,
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(WorkerError::Slot(e.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::NewJob;
    use crate::core::types::{JobId, JobStatus};

    fn job(id: &str) -> NewJob {
        NewJob::pending(JobId::new(id))
    }

    fn deps(ids: &[&str]) -> Vec<JobId> {
        ids.iter().map(|s| JobId::new(*s)).collect()
    }

    async fn store_with(jobs: Vec<NewJob>, params: &[&str]) -> Arc<JobStore> {
        let store = JobStore::in_memory().await.unwrap();
        let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
        store.initialize(&params).await.unwrap();
        store.add_jobs(&jobs).await.unwrap();
        Arc::new(store)
    }

    fn quick(mut options: WorkerOptions) -> WorkerOptions {
        options.dep_wait_interval = 0;
        options
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_order() {
        let store = store_with(
            vec![
                job("a"),
                job("b").with_depends_on(deps(&["a"])),
                job("c").with_depends_on(deps(&["b"])),
            ],
            &[],
        )
        .await;

        let worker = Worker::new(Arc::clone(&store), quick(WorkerOptions::new("true")));
        let summary = worker.run().await.unwrap();
        assert_eq!(summary, WorkerSummary { completed: 3, failed: 0 });

        let a = store.get(&JobId::new("a")).await.unwrap();
        let b = store.get(&JobId::new("b")).await.unwrap();
        let c = store.get(&JobId::new("c")).await.unwrap();
        for row in [&a, &b, &c] {
            assert_eq!(row.status, JobStatus::Done);
            assert!(row.elapsed_time.is_some());
        }
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
        assert!(c.started_at.unwrap() >= b.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_failing_root_blocks_children_and_worker_exits() {
        // The command is `sh -c <script param>`: the root fails, the
        // children would succeed if they ever ran.
        let store = store_with(
            vec![
                job("root").with_param("script", "exit 1"),
                job("child1")
                    .with_depends_on(deps(&["root"]))
                    .with_param("script", "exit 0"),
                job("child2")
                    .with_depends_on(deps(&["root"]))
                    .with_param("script", "exit 0"),
            ],
            &["script"],
        )
        .await;

        let worker = Worker::new(Arc::clone(&store), quick(WorkerOptions::new("sh -c")));
        let summary = worker.run().await.unwrap();
        assert_eq!(summary, WorkerSummary { completed: 0, failed: 1 });

        assert_eq!(
            store.get(&JobId::new("root")).await.unwrap().status,
            JobStatus::Error
        );
        for id in ["child1", "child2"] {
            assert_eq!(
                store.get(&JobId::new(id)).await.unwrap().status,
                JobStatus::Pending
            );
        }
    }

    #[tokio::test]
    async fn test_deadline_filter_leaves_oversized_job_pending() {
        let store = store_with(vec![job("huge").with_estimate(2.0)], &[]).await;

        let mut options = quick(WorkerOptions::new("true"));
        options.max_runtime = 3600;
        let worker = Worker::new(Arc::clone(&store), options);
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary::default());
        assert_eq!(
            store.get(&JobId::new("huge")).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_smart_scheduling_off_claims_oversized_job() {
        let store = store_with(vec![job("huge").with_estimate(2.0)], &[]).await;

        let mut options = quick(WorkerOptions::new("true"));
        options.max_runtime = 3600;
        options.smart_scheduling = false;
        let worker = Worker::new(Arc::clone(&store), options);
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary { completed: 1, failed: 0 });
        assert_eq!(
            store.get(&JobId::new("huge")).await.unwrap().status,
            JobStatus::Done
        );
    }

    #[tokio::test]
    async fn test_exhausted_budget_claims_nothing() {
        let store = store_with(vec![job("a")], &[]).await;

        let mut options = quick(WorkerOptions::new("true"));
        options.max_runtime = 0;
        let worker = Worker::new(Arc::clone(&store), options);
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary::default());
        assert_eq!(
            store.get(&JobId::new("a")).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_recovers_stuck_rows_at_startup() {
        let store = store_with(vec![job("stuck"), job("fresh")], &[]).await;

        // Simulate a killed worker: claim but never finish.
        match store.try_claim(None).await.unwrap() {
            ClaimOutcome::Claimed(row) => assert_eq!(row.id.as_str(), "fresh"),
            other => panic!("expected claim, got {:?}", other),
        }

        let worker = Worker::new(Arc::clone(&store), quick(WorkerOptions::new("true")));
        let summary = worker.run().await.unwrap();

        // Both rows were pending again after recovery and both ran.
        assert_eq!(summary, WorkerSummary { completed: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_parallel_slots_complete_everything_once() {
        let jobs: Vec<NewJob> = (0..8).map(|i| job(&format!("job_{:02}", i))).collect();
        let store = store_with(jobs, &[]).await;

        let mut options = quick(WorkerOptions::new("true"));
        options.parallel = 3;
        let worker = Worker::new(Arc::clone(&store), options);
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary { completed: 8, failed: 0 });
        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.done, 8);
        assert_eq!(snap.running, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flag_stops_claiming() {
        let store = store_with(vec![job("a"), job("b")], &[]).await;

        let shutdown = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(Arc::clone(&store), quick(WorkerOptions::new("true")))
            .with_shutdown(Arc::clone(&shutdown));
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary::default());
        let snap = store.snapshot().await.unwrap();
        assert_eq!(snap.pending, 2);
    }

    #[tokio::test]
    async fn test_bad_command_template_is_fatal() {
        let store = store_with(vec![job("a")], &[]).await;
        let worker = Worker::new(store, quick(WorkerOptions::new("echo \"unterminated")));
        assert!(matches!(worker.run().await, Err(WorkerError::Args(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_job_error_and_continues() {
        let store = store_with(vec![job("a"), job("b")], &[]).await;
        let worker = Worker::new(
            Arc::clone(&store),
            quick(WorkerOptions::new("definitely_not_a_real_binary_0451")),
        );
        let summary = worker.run().await.unwrap();

        assert_eq!(summary, WorkerSummary { completed: 0, failed: 2 });
        for id in ["a", "b"] {
            let row = store.get(&JobId::new(id)).await.unwrap();
            assert_eq!(row.status, JobStatus::Error);
            assert!(row.error_message.unwrap().starts_with("spawn failed:"));
        }
    }
}
