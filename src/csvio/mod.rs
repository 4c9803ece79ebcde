//! CSV import and export.
//!
//! The CSV side of the store contract: a UTF-8 file with a header row,
//! reserved columns recognized by the `JOBSCHEDULER_` prefix, every
//! other column a user param. Import validates the dependency graph
//! before anything is written; export emits params first and reserved
//! columns last so the file round-trips.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::graph::{self, GraphError};
use crate::core::job::{format_depends_on, parse_depends_on, NewJob};
use crate::core::types::{JobId, JobStatus};
use crate::storage::{format_ts, parse_ts, JobStore, StoreError, RESERVED_COLUMNS, RESERVED_PREFIX};

/// Errors while moving jobs between CSV files and the store.
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot read CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A `JOBSCHEDULER_`-prefixed header that is not a known reserved
    /// column.
    #[error("unknown reserved column in header: '{0}'")]
    UnknownReservedColumn(String),

    /// The same header appears twice.
    #[error("duplicate column in header: '{0}'")]
    DuplicateColumn(String),

    /// A cell that cannot be parsed into its reserved column's type.
    #[error("job '{job}': invalid value '{value}' for {column}")]
    InvalidValue {
        job: String,
        column: &'static str,
        value: String,
    },
}

/// `foo.csv ↔ foo.db` filename symmetry.
pub fn default_db_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("db")
}

/// Inverse of [`default_db_path`].
pub fn default_csv_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("csv")
}

/// Import a CSV file into a (possibly new) database.
///
/// Creates the schema from the CSV's user columns if the store has none
/// yet. The whole batch is validated (graph, values) before any row is
/// written, and the insert itself is atomic.
pub async fn import(csv_path: &Path, db_path: &Path) -> Result<usize, CsvError> {
    let (user_columns, jobs) = read_jobs(csv_path)?;

    let store = JobStore::create(db_path).await?;
    let result = import_into(&store, &user_columns, &jobs).await;
    store.close().await;
    result
}

/// Add jobs from a CSV file to an existing, initialized database.
///
/// The CSV's param columns must match the store schema exactly;
/// duplicate job ids refuse the whole batch.
pub async fn add(csv_path: &Path, db_path: &Path) -> Result<usize, CsvError> {
    let (_, jobs) = read_jobs(csv_path)?;

    let store = JobStore::open(db_path).await?;
    let result = add_into(&store, &jobs).await;
    store.close().await;
    result
}

async fn import_into(
    store: &JobStore,
    user_columns: &[String],
    jobs: &[NewJob],
) -> Result<usize, CsvError> {
    store.initialize(user_columns).await?;
    validate_batch(store, jobs).await?;
    let inserted = store.add_jobs(jobs).await?;
    Ok(inserted as usize)
}

async fn add_into(store: &JobStore, jobs: &[NewJob]) -> Result<usize, CsvError> {
    if !store.is_initialized().await? {
        return Err(StoreError::Uninitialized.into());
    }
    validate_batch(store, jobs).await?;
    let inserted = store.add_jobs(jobs).await?;
    Ok(inserted as usize)
}

async fn validate_batch(store: &JobStore, jobs: &[NewJob]) -> Result<(), CsvError> {
    let existing: HashSet<JobId> = if store.is_initialized().await? {
        store.all_ids().await?
    } else {
        HashSet::new()
    };
    let batch: Vec<(JobId, Vec<JobId>)> = jobs
        .iter()
        .map(|job| (job.id.clone(), job.depends_on.clone()))
        .collect();
    graph::validate(&batch, &existing)?;
    Ok(())
}

/// Export the store to a CSV file, optionally filtered by status.
/// Columns are user params (schema order) first, reserved columns last.
pub async fn export(
    db_path: &Path,
    csv_path: &Path,
    filter: Option<JobStatus>,
) -> Result<usize, CsvError> {
    let store = JobStore::open(db_path).await?;
    let result = export_from(&store, csv_path, filter).await;
    store.close().await;
    result
}

async fn export_from(
    store: &JobStore,
    csv_path: &Path,
    filter: Option<JobStatus>,
) -> Result<usize, CsvError> {
    let user_columns = store.user_columns().await?;
    let jobs = store.list(filter).await?;

    let mut writer = csv::Writer::from_path(csv_path)?;

    let mut header: Vec<&str> = user_columns.iter().map(String::as_str).collect();
    header.extend(RESERVED_COLUMNS);
    writer.write_record(&header)?;

    for job in &jobs {
        let mut record: Vec<String> = job
            .params
            .iter()
            .map(|(_, value)| value.clone().unwrap_or_default())
            .collect();
        record.push(job.id.to_string());
        record.push(job.status.as_str().to_string());
        record.push(job.priority.to_string());
        record.push(job.estimate_time.to_string());
        record.push(
            job.elapsed_time
                .map(|v| v.to_string())
                .unwrap_or_default(),
        );
        record.push(format_depends_on(&job.depends_on));
        record.push(job.created_at.map(format_ts).unwrap_or_default());
        record.push(job.started_at.map(format_ts).unwrap_or_default());
        record.push(job.finished_at.map(format_ts).unwrap_or_default());
        record.push(job.error_message.clone().unwrap_or_default());
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(jobs.len())
}

/// Read a CSV file into `(user_columns, jobs)`.
fn read_jobs(csv_path: &Path) -> Result<(Vec<String>, Vec<NewJob>), CsvError> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut seen = HashSet::new();
    for header in &headers {
        if !seen.insert(header.as_str()) {
            return Err(CsvError::DuplicateColumn(header.clone()));
        }
        if header.starts_with(RESERVED_PREFIX) && !RESERVED_COLUMNS.contains(&header.as_str()) {
            return Err(CsvError::UnknownReservedColumn(header.clone()));
        }
    }

    let user_columns: Vec<String> = headers
        .iter()
        .filter(|h| !h.starts_with(RESERVED_PREFIX))
        .cloned()
        .collect();

    let mut jobs = Vec::new();
    for (ordinal, record) in reader.records().enumerate() {
        let record = record?;
        let cell = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|h| h.as_str() == name)
                .and_then(|i| record.get(i))
                .filter(|v| !v.is_empty())
        };

        let id = match cell("JOBSCHEDULER_JOB_ID") {
            Some(value) => JobId::new(value),
            None => JobId::new(format!("job_{:08}", ordinal)),
        };

        let mut job = NewJob::pending(id.clone());

        if let Some(value) = cell("JOBSCHEDULER_STATUS") {
            job.status = JobStatus::parse(value).ok_or_else(|| CsvError::InvalidValue {
                job: id.to_string(),
                column: "JOBSCHEDULER_STATUS",
                value: value.to_string(),
            })?;
        }
        if let Some(value) = cell("JOBSCHEDULER_PRIORITY") {
            job.priority = value.parse().map_err(|_| CsvError::InvalidValue {
                job: id.to_string(),
                column: "JOBSCHEDULER_PRIORITY",
                value: value.to_string(),
            })?;
        }
        if let Some(value) = cell("JOBSCHEDULER_ESTIMATE_TIME") {
            job.estimate_time = value.parse().map_err(|_| CsvError::InvalidValue {
                job: id.to_string(),
                column: "JOBSCHEDULER_ESTIMATE_TIME",
                value: value.to_string(),
            })?;
        }
        if let Some(value) = cell("JOBSCHEDULER_ELAPSED_TIME") {
            job.elapsed_time = Some(value.parse().map_err(|_| CsvError::InvalidValue {
                job: id.to_string(),
                column: "JOBSCHEDULER_ELAPSED_TIME",
                value: value.to_string(),
            })?);
        }
        if let Some(value) = cell("JOBSCHEDULER_DEPENDS_ON") {
            job.depends_on = parse_depends_on(value);
        }
        for (column, field) in [
            ("JOBSCHEDULER_CREATED_AT", &mut job.created_at),
            ("JOBSCHEDULER_STARTED_AT", &mut job.started_at),
            ("JOBSCHEDULER_FINISHED_AT", &mut job.finished_at),
        ] {
            if let Some(value) = cell(column) {
                *field = Some(parse_ts(value).ok_or_else(|| CsvError::InvalidValue {
                    job: id.to_string(),
                    column,
                    value: value.to_string(),
                })?);
            }
        }
        if let Some(value) = cell("JOBSCHEDULER_ERROR_MESSAGE") {
            job.error_message = Some(value.to_string());
        }

        // User param cells keep empty strings: they are positional
        // placeholders, not missing values.
        for column in &user_columns {
            let index = headers
                .iter()
                .position(|h| h == column)
                .expect("user column comes from the header");
            let value = record.get(index).unwrap_or_default();
            job.params.push((column.clone(), Some(value.to_string())));
        }

        jobs.push(job);
    }

    Ok((user_columns, jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_paths_are_symmetric() {
        let csv = Path::new("runs/sweep.csv");
        let db = default_db_path(csv);
        assert_eq!(db, Path::new("runs/sweep.db"));
        assert_eq!(default_csv_path(&db), csv);
    }

    #[tokio::test]
    async fn test_import_creates_schema_and_rows() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "alpha,beta,JOBSCHEDULER_PRIORITY\n0.5,x,3\n0.9,y,1\n",
        );
        let db = default_db_path(&csv);

        let imported = import(&csv, &db).await.unwrap();
        assert_eq!(imported, 2);

        let store = JobStore::open(&db).await.unwrap();
        assert_eq!(store.user_columns().await.unwrap(), vec!["alpha", "beta"]);

        let job = store.get(&JobId::new("job_00000000")).await.unwrap();
        assert_eq!(job.priority, 3);
        assert_eq!(
            job.params,
            vec![
                ("alpha".to_string(), Some("0.5".to_string())),
                ("beta".to_string(), Some("x".to_string())),
            ]
        );
        store.close().await;
    }

    #[tokio::test]
    async fn test_import_respects_provided_ids_and_deps() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "JOBSCHEDULER_JOB_ID,JOBSCHEDULER_DEPENDS_ON,val\n\
             a,,1\nb,a,2\nc,a b,3\n",
        );
        let db = default_db_path(&csv);
        import(&csv, &db).await.unwrap();

        let store = JobStore::open(&db).await.unwrap();
        let c = store.get(&JobId::new("c")).await.unwrap();
        assert_eq!(c.depends_on, vec![JobId::new("a"), JobId::new("b")]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_import_rejects_missing_dependency() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "JOBSCHEDULER_JOB_ID,JOBSCHEDULER_DEPENDS_ON\na,ghost\n",
        );
        let db = default_db_path(&csv);
        let err = import(&csv, &db).await.unwrap_err();
        assert!(matches!(err, CsvError::Graph(GraphError::MissingDependency { .. })));
    }

    #[tokio::test]
    async fn test_import_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "JOBSCHEDULER_JOB_ID,JOBSCHEDULER_DEPENDS_ON\na,b\nb,a\n",
        );
        let db = default_db_path(&csv);
        let err = import(&csv, &db).await.unwrap_err();
        assert!(matches!(err, CsvError::Graph(GraphError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_reserved_column() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "jobs.csv", "JOBSCHEDULER_FROBNICATE\nx\n");
        let db = default_db_path(&csv);
        let err = import(&csv, &db).await.unwrap_err();
        assert!(matches!(err, CsvError::UnknownReservedColumn(_)));
    }

    #[tokio::test]
    async fn test_add_requires_matching_schema() {
        let dir = TempDir::new().unwrap();
        let base = write_csv(&dir, "base.csv", "alpha\n1\n");
        let db = default_db_path(&base);
        import(&base, &db).await.unwrap();

        let extra = write_csv(
            &dir,
            "extra.csv",
            "JOBSCHEDULER_JOB_ID,beta\nnew_job,2\n",
        );
        let err = add(&extra, &db).await.unwrap_err();
        assert!(matches!(err, CsvError::Store(StoreError::SchemaMismatch(_))));
    }

    #[tokio::test]
    async fn test_add_refuses_duplicate_ids_atomically() {
        let dir = TempDir::new().unwrap();
        let base = write_csv(&dir, "base.csv", "JOBSCHEDULER_JOB_ID,v\na,1\n");
        let db = default_db_path(&base);
        import(&base, &db).await.unwrap();

        let dup = write_csv(&dir, "dup.csv", "JOBSCHEDULER_JOB_ID,v\nb,2\na,3\n");
        let err = add(&dup, &db).await.unwrap_err();
        assert!(matches!(err, CsvError::Store(StoreError::Integrity(_))));

        let store = JobStore::open(&db).await.unwrap();
        assert!(matches!(
            store.get(&JobId::new("b")).await,
            Err(StoreError::NotFound(_))
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_add_may_depend_on_existing_jobs() {
        let dir = TempDir::new().unwrap();
        let base = write_csv(&dir, "base.csv", "JOBSCHEDULER_JOB_ID,v\nfirst,1\n");
        let db = default_db_path(&base);
        import(&base, &db).await.unwrap();

        let more = write_csv(
            &dir,
            "more.csv",
            "JOBSCHEDULER_JOB_ID,JOBSCHEDULER_DEPENDS_ON,v\nsecond,first,2\n",
        );
        assert_eq!(add(&more, &db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_export_orders_params_first_reserved_last() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "jobs.csv", "alpha,JOBSCHEDULER_PRIORITY,beta\nx,2,y\n");
        let db = default_db_path(&csv);
        import(&csv, &db).await.unwrap();

        let out = dir.path().join("out.csv");
        let exported = export(&db, &out, None).await.unwrap();
        assert_eq!(exported, 1);

        let mut reader = csv::Reader::from_path(&out).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(&headers[..2], &["alpha", "beta"]);
        assert_eq!(headers[2], "JOBSCHEDULER_JOB_ID");
        assert_eq!(*headers.last().unwrap(), "JOBSCHEDULER_ERROR_MESSAGE");
    }

    #[tokio::test]
    async fn test_export_status_filter() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "JOBSCHEDULER_JOB_ID,JOBSCHEDULER_STATUS,v\na,done,1\nb,pending,2\n",
        );
        let db = default_db_path(&csv);
        import(&csv, &db).await.unwrap();

        let out = dir.path().join("done.csv");
        assert_eq!(export(&db, &out, Some(JobStatus::Done)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_values() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "jobs.csv",
            "alpha,beta,JOBSCHEDULER_JOB_ID,JOBSCHEDULER_PRIORITY,JOBSCHEDULER_ESTIMATE_TIME,JOBSCHEDULER_DEPENDS_ON\n\
             0.25,two words,j1,7,1.5,\n\
             ,empty kept,j2,0,0,j1\n",
        );
        let db = default_db_path(&csv);
        import(&csv, &db).await.unwrap();

        let out = dir.path().join("out.csv");
        export(&db, &out, None).await.unwrap();

        // Re-import the exported file into a second store.
        let db2 = dir.path().join("second.db");
        import(&out, &db2).await.unwrap();

        let store = JobStore::open(&db2).await.unwrap();
        let j1 = store.get(&JobId::new("j1")).await.unwrap();
        assert_eq!(j1.priority, 7);
        assert_eq!(j1.estimate_time, 1.5);
        assert_eq!(
            j1.params,
            vec![
                ("alpha".to_string(), Some("0.25".to_string())),
                ("beta".to_string(), Some("two words".to_string())),
            ]
        );
        let j2 = store.get(&JobId::new("j2")).await.unwrap();
        assert_eq!(j2.depends_on, vec![JobId::new("j1")]);
        assert_eq!(
            j2.params,
            vec![
                ("alpha".to_string(), Some("".to_string())),
                ("beta".to_string(), Some("empty kept".to_string())),
            ]
        );
        store.close().await;
    }
}
