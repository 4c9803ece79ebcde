//! Read-only progress snapshot for operators.
//!
//! Counts every row by status, with pending sub-classified by readiness.
//! Reads go through the same WAL-enabled pool and never block writers.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use sqlx::Row;

use super::store::JobStore;
use super::StoreError;
use crate::core::job::parse_depends_on;
use crate::core::resolver;
use crate::core::types::{JobId, JobStatus, Readiness};

/// Aggregate job counts at one point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    /// Pending jobs whose predecessors are all done.
    pub pending_ready: u64,
    /// Pending jobs waiting on a pending or running predecessor.
    pub pending_waiting: u64,
    /// Pending jobs that can never run (an upstream job failed).
    pub pending_blocked: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total:   {}", self.total)?;
        writeln!(f, "Running: {}", self.running)?;
        writeln!(f, "Done:    {}", self.done)?;
        writeln!(f, "Error:   {}", self.error)?;
        writeln!(
            f,
            "Pending: {} (ready {}, waiting {}, blocked {})",
            self.pending, self.pending_ready, self.pending_waiting, self.pending_blocked
        )
    }
}

impl JobStore {
    /// Build a snapshot of the current job population.
    pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        if !self.is_initialized().await? {
            return Err(StoreError::Uninitialized);
        }

        let rows = sqlx::query(
            "SELECT JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STATUS, JOBSCHEDULER_DEPENDS_ON FROM jobs",
        )
        .fetch_all(self.pool())
        .await?;

        let mut statuses: HashMap<JobId, JobStatus> = HashMap::with_capacity(rows.len());
        let mut pending: Vec<(JobId, Vec<JobId>)> = Vec::new();
        let mut snapshot = Snapshot::default();

        for row in &rows {
            let id: String = row.try_get(0)?;
            let text: String = row.try_get(1)?;
            let status = JobStatus::parse(&text).ok_or_else(|| {
                StoreError::Corrupt(format!("job '{}' has unknown status '{}'", id, text))
            })?;

            snapshot.total += 1;
            match status {
                JobStatus::Pending => {
                    snapshot.pending += 1;
                    let deps: Option<String> = row.try_get(2)?;
                    pending.push((
                        JobId::new(id.clone()),
                        deps.as_deref().map(parse_depends_on).unwrap_or_default(),
                    ));
                }
                JobStatus::Running => snapshot.running += 1,
                JobStatus::Done => snapshot.done += 1,
                JobStatus::Error => snapshot.error += 1,
            }
            statuses.insert(JobId::new(id), status);
        }

        let classes = resolver::classify_pending(&pending, &statuses);
        for class in classes.values() {
            match class {
                Readiness::Ready => snapshot.pending_ready += 1,
                Readiness::Waiting => snapshot.pending_waiting += 1,
                Readiness::Blocked => snapshot.pending_blocked += 1,
            }
        }

        Ok(snapshot)
    }
}
