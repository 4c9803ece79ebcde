//! Running one claimed job to completion.
//!
//! Spawns the subprocess argv-style (no shell), streams its output line
//! by line prefixed with the job id, keeps a bounded tail of stderr for
//! the error message, and commits the terminal status back to the store
//! with backoff on contention.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::core::types::{JobId, JobOutcome};
use crate::storage::{JobStore, StoreError};

/// How many trailing stderr lines feed the recorded error message.
const STDERR_TAIL_LINES: usize = 20;

/// Backoff schedule for committing a terminal status, roughly a minute
/// end to end. A worker that cannot commit after this aborts and leaves
/// the row in `running` for the next startup sweep to recover.
const FINISH_BACKOFF: [u64; 6] = [1, 2, 4, 8, 16, 30];

/// What happened when a job was executed.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: JobOutcome,
    /// Wall-clock seconds from spawn to exit.
    pub elapsed_secs: f64,
    pub error_message: Option<String>,
}

/// Execute the argv for one claimed job and report the outcome.
///
/// Spawn failures and nonzero exits are reported, not returned as
/// errors: a job that cannot run is an `error` row, and the worker moves
/// on to the next job.
pub async fn run_job(id: &JobId, argv: &[String]) -> ExecutionReport {
    let start = Instant::now();

    info!("job {} starting: {}", id, argv.join(" "));

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("job {} spawn failed: {}", id, e);
            return ExecutionReport {
                outcome: JobOutcome::Error,
                elapsed_secs: start.elapsed().as_secs_f64(),
                error_message: Some(format!("spawn failed: {}", e)),
            };
        }
    };

    // Stream both pipes concurrently; the stderr reader also keeps the
    // tail for the error message.
    let stdout_task = child.stdout.take().map(|stdout| {
        let id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("job {} stdout: {}", id, line);
            }
        })
    });

    let stderr_task = child.stderr.take().map(|stderr| {
        let id = id.clone();
        tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("job {} stderr: {}", id, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        })
    });

    let status = child.wait().await;

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    let stderr_tail: Vec<String> = match stderr_task {
        Some(task) => task.await.map(Vec::from).unwrap_or_default(),
        None => Vec::new(),
    };

    let elapsed_secs = start.elapsed().as_secs_f64();

    let (outcome, error_message) = match status {
        Ok(status) if status.success() => (JobOutcome::Done, None),
        Ok(status) => {
            let descriptor = match status.code() {
                Some(code) => format!("process exited with code {}", code),
                None => "process terminated by signal".to_string(),
            };
            let message = if stderr_tail.is_empty() {
                descriptor
            } else {
                format!("{}\n{}", descriptor, stderr_tail.join("\n"))
            };
            (JobOutcome::Error, Some(message))
        }
        Err(e) => (
            JobOutcome::Error,
            Some(format!("wait failed: {}", e)),
        ),
    };

    match outcome {
        JobOutcome::Done => {
            info!("job {} done in {:.2}s", id, elapsed_secs)
        }
        JobOutcome::Error => warn!(
            "job {} failed in {:.2}s: {}",
            id,
            elapsed_secs,
            error_message.as_deref().unwrap_or("unknown")
        ),
    }

    ExecutionReport {
        outcome,
        elapsed_secs,
        error_message,
    }
}

/// Commit a terminal status, retrying contention with exponential
/// backoff. A persistent store failure is returned to abort the worker;
/// the row stays `running` and a later startup sweep recovers it.
pub async fn record_outcome(
    store: &JobStore,
    id: &JobId,
    report: &ExecutionReport,
) -> Result<(), StoreError> {
    let mut last_err = None;

    for (attempt, delay) in FINISH_BACKOFF.iter().enumerate() {
        match store
            .finish(
                id,
                report.outcome,
                report.elapsed_secs,
                report.error_message.as_deref(),
            )
            .await
        {
            Ok(()) => return Ok(()),
            Err(e @ StoreError::LockTimeout) | Err(e @ StoreError::Database(_)) => {
                warn!(
                    "job {}: finish attempt {} failed ({}), retrying in {}s",
                    id,
                    attempt + 1,
                    e,
                    delay
                );
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(*delay)).await;
            }
            Err(e) => return Err(e),
        }
    }

    // One last try after the full backoff window.
    match store
        .finish(
            id,
            report.outcome,
            report.elapsed_secs,
            report.error_message.as_deref(),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => Err(last_err.unwrap_or(e)),
    }
}
