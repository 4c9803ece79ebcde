//! Common test utilities shared across integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use drover::{JobId, JobStore, NewJob};

/// Create a file-backed store seeded with the given jobs.
///
/// Workers coordinate through the file, so integration tests use a real
/// database on disk rather than the in-memory store.
pub async fn seeded_store(path: &Path, params: &[&str], jobs: Vec<NewJob>) -> Arc<JobStore> {
    let store = JobStore::create(path).await.unwrap();
    let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
    store.initialize(&params).await.unwrap();
    store.add_jobs(&jobs).await.unwrap();
    Arc::new(store)
}

/// Shorthand for a fresh pending job.
pub fn job(id: &str) -> NewJob {
    NewJob::pending(JobId::new(id))
}

/// Shorthand for a dependency list.
pub fn deps(ids: &[&str]) -> Vec<JobId> {
    ids.iter().map(|s| JobId::new(*s)).collect()
}

/// A command template that appends its first positional argument to the
/// given log file, one line per execution.
pub fn logging_template(log: &Path) -> String {
    format!(r#"sh -c "echo $0 >> {}""#, log.display())
}

/// Read the execution log written by [`logging_template`].
pub fn read_log(log: &Path) -> Vec<String> {
    match std::fs::read_to_string(log) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}

/// Path helper for per-test artifacts.
pub fn artifact(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}
