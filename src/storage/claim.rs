//! Select-and-claim of one ready job under multi-worker contention.
//!
//! The whole scan runs inside one `BEGIN IMMEDIATE` transaction: the
//! second of two racing workers serializes behind the first and re-reads
//! a candidate set in which the already-claimed job is no longer
//! `pending`. The store's busy timeout absorbs the contention window; no
//! advisory locks, tokens, or leases are involved.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::store::{decode_row, format_ts, JobStore};
use super::StoreError;
use crate::core::deadline::AdmissionFilter;
use crate::core::job::JobRow;
use crate::core::resolver;
use crate::core::types::{JobId, JobStatus, Readiness};

/// Result of one claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// A job was transitioned to `running` and belongs to this worker.
    Claimed(JobRow),
    /// Nothing claimable right now. `more_possible` is true when at
    /// least one Waiting candidate remained, i.e. the picture can still
    /// change as predecessors finish.
    Idle { more_possible: bool },
}

impl JobStore {
    /// Claim the highest-priority ready pending job, if any.
    ///
    /// Candidates are scanned in `(priority DESC, job_id ASC)` order so
    /// identical workloads claim in identical order. With `filter` set,
    /// smart scheduling skips any candidate whose scaled estimate does
    /// not fit the remaining budget; deadline-skipped jobs do not count
    /// toward `more_possible`.
    pub async fn try_claim(
        &self,
        filter: Option<&AdmissionFilter>,
    ) -> Result<ClaimOutcome, StoreError> {
        let user_cols = self.user_columns().await?;

        let mut conn = self.pool().acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = claim_locked(&mut conn, &user_cols, filter).await;

        match result {
            Ok(ClaimOutcome::Claimed(job)) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(ClaimOutcome::Claimed(job))
            }
            Ok(idle) => {
                // Read-only scan; nothing to keep.
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Ok(idle)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }
}

async fn claim_locked(
    conn: &mut SqliteConnection,
    user_cols: &[String],
    filter: Option<&AdmissionFilter>,
) -> Result<ClaimOutcome, StoreError> {
    // Point-in-time status view for readiness checks. The write lock is
    // already held, so this cannot shift under the scan.
    let status_rows =
        sqlx::query("SELECT JOBSCHEDULER_JOB_ID, JOBSCHEDULER_STATUS FROM jobs")
            .fetch_all(&mut *conn)
            .await?;

    let mut statuses: HashMap<JobId, JobStatus> = HashMap::with_capacity(status_rows.len());
    for row in &status_rows {
        let id: String = row.try_get(0)?;
        let text: String = row.try_get(1)?;
        let status = JobStatus::parse(&text).ok_or_else(|| {
            StoreError::Corrupt(format!("job '{}' has unknown status '{}'", id, text))
        })?;
        statuses.insert(JobId::new(id), status);
    }

    let rows = sqlx::query(
        "SELECT * FROM jobs WHERE JOBSCHEDULER_STATUS = 'pending' \
         ORDER BY JOBSCHEDULER_PRIORITY DESC, JOBSCHEDULER_JOB_ID ASC",
    )
    .fetch_all(&mut *conn)
    .await?;

    let candidates: Vec<JobRow> = rows
        .iter()
        .map(|row| decode_row(row, user_cols))
        .collect::<Result<_, _>>()?;

    let pending_edges: Vec<(JobId, Vec<JobId>)> = candidates
        .iter()
        .map(|job| (job.id.clone(), job.depends_on.clone()))
        .collect();
    let classes = resolver::classify_pending(&pending_edges, &statuses);

    let mut waiting = 0usize;

    for mut job in candidates {
        match classes[&job.id] {
            Readiness::Blocked => continue,
            Readiness::Waiting => {
                waiting += 1;
                continue;
            }
            Readiness::Ready => {}
        }

        if let Some(filter) = filter {
            if !filter.admits(job.estimate_time) {
                continue;
            }
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = 'running', \
             JOBSCHEDULER_STARTED_AT = ? WHERE JOBSCHEDULER_JOB_ID = ?",
        )
        .bind(format_ts(now))
        .bind(job.id.as_str())
        .execute(&mut *conn)
        .await?;

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        return Ok(ClaimOutcome::Claimed(job));
    }

    Ok(ClaimOutcome::Idle {
        more_possible: waiting > 0,
    })
}
