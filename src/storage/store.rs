//! Store implementation: connection discipline, schema management, and
//! atomic state transitions.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;

use super::{StoreError, RESERVED_COLUMNS, RESERVED_PREFIX};
use crate::core::job::{format_depends_on, parse_depends_on, JobRow, NewJob};
use crate::core::types::{JobId, JobOutcome, JobStatus};

/// Handle to the shared jobs database.
///
/// Every pooled connection is configured with WAL journaling, a 30 s busy
/// timeout, and `synchronous=NORMAL`; SQLite pragmas are per connection,
/// not per file, so they are part of the connect options and reapplied on
/// each new connection.
#[derive(Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

/// Lock contention window absorbed inside SQLite before an operation
/// fails with [`StoreError::LockTimeout`].
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

impl JobStore {
    /// Open an existing database file. Fails if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::NotFound(format!(
                "database file: {}",
                path.display()
            )));
        }
        Self::connect(path, false).await
    }

    /// Open a database file, creating it if missing.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect(path.as_ref(), true).await
    }

    /// An in-memory store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    async fn connect(path: &Path, create: bool) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `jobs` table if absent: the reserved columns plus the
    /// given user param columns, with the status/priority index the claim
    /// scan relies on.
    pub async fn initialize(&self, param_columns: &[String]) -> Result<(), StoreError> {
        for col in param_columns {
            validate_column_name(col)?;
        }

        let mut columns = vec![
            r#""JOBSCHEDULER_JOB_ID" TEXT PRIMARY KEY"#.to_string(),
            r#""JOBSCHEDULER_STATUS" TEXT NOT NULL DEFAULT 'pending'"#.to_string(),
            r#""JOBSCHEDULER_PRIORITY" INTEGER NOT NULL DEFAULT 0"#.to_string(),
            r#""JOBSCHEDULER_ESTIMATE_TIME" REAL NOT NULL DEFAULT 0"#.to_string(),
            r#""JOBSCHEDULER_ELAPSED_TIME" REAL"#.to_string(),
            r#""JOBSCHEDULER_DEPENDS_ON" TEXT"#.to_string(),
            r#""JOBSCHEDULER_CREATED_AT" TEXT"#.to_string(),
            r#""JOBSCHEDULER_STARTED_AT" TEXT"#.to_string(),
            r#""JOBSCHEDULER_FINISHED_AT" TEXT"#.to_string(),
            r#""JOBSCHEDULER_ERROR_MESSAGE" TEXT"#.to_string(),
        ];
        for col in param_columns {
            columns.push(format!(r#""{}" TEXT"#, col));
        }

        let create_sql = format!("CREATE TABLE IF NOT EXISTS jobs ({})", columns.join(", "));
        sqlx::query(&create_sql).execute(&self.pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_status_priority \
             ON jobs(JOBSCHEDULER_STATUS, JOBSCHEDULER_PRIORITY DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_status_estimate \
             ON jobs(JOBSCHEDULER_STATUS, JOBSCHEDULER_ESTIMATE_TIME)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether the `jobs` table exists.
    pub async fn is_initialized(&self) -> Result<bool, StoreError> {
        let row =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'jobs'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// User param columns in schema order. The set is fixed for the life
    /// of the store.
    pub async fn user_columns(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("PRAGMA table_info(jobs)")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::Uninitialized);
        }
        let mut columns = Vec::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            if !name.starts_with(RESERVED_PREFIX) {
                columns.push(name);
            }
        }
        Ok(columns)
    }

    /// All job ids currently in the store.
    pub async fn all_ids(&self) -> Result<HashSet<JobId>, StoreError> {
        let rows = sqlx::query("SELECT JOBSCHEDULER_JOB_ID FROM jobs")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(JobId::new(row.try_get::<String, _>(0)?)))
            .collect()
    }

    /// Insert a batch of new jobs atomically.
    ///
    /// Fails with `SchemaMismatch` if any row's param columns differ from
    /// the existing table, and with `Integrity` on a duplicate job id; in
    /// both cases the table is left unchanged.
    pub async fn add_jobs(&self, jobs: &[NewJob]) -> Result<u64, StoreError> {
        let table_params = self.user_columns().await?;
        let table_set: HashSet<&str> = table_params.iter().map(String::as_str).collect();

        for job in jobs {
            let row_set: HashSet<&str> = job.params.iter().map(|(k, _)| k.as_str()).collect();
            if row_set != table_set {
                let missing: Vec<&str> = table_set.difference(&row_set).copied().collect();
                let extra: Vec<&str> = row_set.difference(&table_set).copied().collect();
                return Err(StoreError::SchemaMismatch(format!(
                    "job '{}': missing columns {:?}, unexpected columns {:?}",
                    job.id, missing, extra
                )));
            }
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let mut inserted = 0u64;
        for job in jobs {
            let mut columns: Vec<String> = RESERVED_COLUMNS
                .iter()
                .map(|c| format!(r#""{}""#, c))
                .collect();
            for (name, _) in &job.params {
                columns.push(format!(r#""{}""#, name));
            }
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO jobs ({}) VALUES ({})",
                columns.join(", "),
                placeholders
            );

            let created = job.created_at.unwrap_or_else(Utc::now);
            let mut query = sqlx::query(&sql)
                .bind(job.id.as_str())
                .bind(job.status.as_str())
                .bind(job.priority)
                .bind(job.estimate_time)
                .bind(job.elapsed_time)
                .bind(format_depends_on(&job.depends_on))
                .bind(format_ts(created))
                .bind(job.started_at.map(format_ts))
                .bind(job.finished_at.map(format_ts))
                .bind(job.error_message.as_deref());
            for (_, value) in &job.params {
                query = query.bind(value.as_deref());
            }

            match query.execute(&mut *conn).await {
                Ok(_) => inserted += 1,
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(StoreError::Integrity(format!(
                        "duplicate job id: '{}'",
                        job.id
                    )));
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e.into());
                }
            }
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok(inserted)
    }

    /// Fetch a single job by id.
    pub async fn get(&self, id: &JobId) -> Result<JobRow, StoreError> {
        let user_cols = self.user_columns().await?;
        let row = sqlx::query("SELECT * FROM jobs WHERE JOBSCHEDULER_JOB_ID = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        decode_row(&row, &user_cols)
    }

    /// List jobs, optionally filtered by status, ordered by job id.
    pub async fn list(&self, filter: Option<JobStatus>) -> Result<Vec<JobRow>, StoreError> {
        let user_cols = self.user_columns().await?;
        let rows = match filter {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE JOBSCHEDULER_STATUS = ? \
                     ORDER BY JOBSCHEDULER_JOB_ID",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY JOBSCHEDULER_JOB_ID")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(|row| decode_row(row, &user_cols)).collect()
    }

    /// Bulk-reset matching rows to `pending`, clearing the execution
    /// bookkeeping fields. Returns the number of rows changed.
    pub async fn reset(&self, filter: Option<JobStatus>) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = match filter {
            Some(status) => {
                sqlx::query(
                    "UPDATE jobs SET JOBSCHEDULER_STATUS = 'pending', \
                     JOBSCHEDULER_STARTED_AT = NULL, JOBSCHEDULER_FINISHED_AT = NULL, \
                     JOBSCHEDULER_ELAPSED_TIME = NULL, JOBSCHEDULER_ERROR_MESSAGE = NULL \
                     WHERE JOBSCHEDULER_STATUS = ?",
                )
                .bind(status.as_str())
                .execute(&mut *conn)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE jobs SET JOBSCHEDULER_STATUS = 'pending', \
                     JOBSCHEDULER_STARTED_AT = NULL, JOBSCHEDULER_FINISHED_AT = NULL, \
                     JOBSCHEDULER_ELAPSED_TIME = NULL, JOBSCHEDULER_ERROR_MESSAGE = NULL",
                )
                .execute(&mut *conn)
                .await
            }
        };

        match result {
            Ok(done) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e.into())
            }
        }
    }

    /// Reset rows stuck in `running` back to `pending`. Run at worker
    /// startup to heal claims abandoned by a killed worker.
    pub async fn recover_stuck(&self) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = 'pending', \
             JOBSCHEDULER_STARTED_AT = NULL \
             WHERE JOBSCHEDULER_STATUS = 'running'",
        )
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e.into())
            }
        }
    }

    /// Record the terminal status of a job.
    ///
    /// The update is unconditional by id: if a racing startup recovery
    /// reset the row to `pending` mid-flight, this commit still lands the
    /// terminal state.
    pub async fn finish(
        &self,
        id: &JobId,
        outcome: JobOutcome,
        elapsed_secs: f64,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = sqlx::query(
            "UPDATE jobs SET JOBSCHEDULER_STATUS = ?, JOBSCHEDULER_ELAPSED_TIME = ?, \
             JOBSCHEDULER_FINISHED_AT = ?, JOBSCHEDULER_ERROR_MESSAGE = ? \
             WHERE JOBSCHEDULER_JOB_ID = ?",
        )
        .bind(outcome.status().as_str())
        .bind(elapsed_secs)
        .bind(format_ts(Utc::now()))
        .bind(error_message)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(StoreError::NotFound(id.to_string()))
            }
            Ok(_) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e.into())
            }
        }
    }
}

/// Only plain identifier characters are allowed in user column names;
/// everything else would need quoting games in generated SQL.
fn validate_column_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && !name.starts_with(RESERVED_PREFIX) {
        Ok(())
    } else {
        Err(StoreError::InvalidColumn(name.to_string()))
    }
}

/// Timestamps are stored as ISO-8601 UTC text.
pub(crate) fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and the bare
/// `YYYY-MM-DD HH:MM:SS` form SQLite's `datetime('now')` produces.
pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Materialize a [`JobRow`] from a `SELECT *` row, given the user param
/// columns in schema order.
pub(crate) fn decode_row(row: &SqliteRow, user_cols: &[String]) -> Result<JobRow, StoreError> {
    let id: String = row.try_get("JOBSCHEDULER_JOB_ID")?;
    let status_text: String = row.try_get("JOBSCHEDULER_STATUS")?;
    let status = JobStatus::parse(&status_text).ok_or_else(|| {
        StoreError::Corrupt(format!("job '{}' has unknown status '{}'", id, status_text))
    })?;

    let depends_on: Option<String> = row.try_get("JOBSCHEDULER_DEPENDS_ON")?;
    let created_at: Option<String> = row.try_get("JOBSCHEDULER_CREATED_AT")?;
    let started_at: Option<String> = row.try_get("JOBSCHEDULER_STARTED_AT")?;
    let finished_at: Option<String> = row.try_get("JOBSCHEDULER_FINISHED_AT")?;

    let mut params = Vec::with_capacity(user_cols.len());
    for col in user_cols {
        let value: Option<String> = row.try_get(col.as_str())?;
        params.push((col.clone(), value));
    }

    Ok(JobRow {
        id: JobId::new(id),
        status,
        priority: row.try_get("JOBSCHEDULER_PRIORITY")?,
        estimate_time: row.try_get("JOBSCHEDULER_ESTIMATE_TIME")?,
        elapsed_time: row.try_get("JOBSCHEDULER_ELAPSED_TIME")?,
        depends_on: depends_on.as_deref().map(parse_depends_on).unwrap_or_default(),
        created_at: created_at.as_deref().and_then(parse_ts),
        started_at: started_at.as_deref().and_then(parse_ts),
        finished_at: finished_at.as_deref().and_then(parse_ts),
        error_message: row.try_get("JOBSCHEDULER_ERROR_MESSAGE")?,
        params,
    })
}
