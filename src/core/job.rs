//! Job rows and their construction.
//!
//! A job is one row in the shared `jobs` table: the reserved bookkeeping
//! columns plus an ordered set of user parameter columns. Predecessors are
//! carried as parsed [`JobId`] sets; the serialized whitespace-separated
//! form only exists at the store and CSV boundaries.

use chrono::{DateTime, Utc};

use super::types::{JobId, JobStatus};

/// A fully materialized job row as read from the store.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: JobId,
    pub status: JobStatus,
    /// Larger runs first.
    pub priority: i64,
    /// Estimated runtime in hours. Zero means unknown.
    pub estimate_time: f64,
    /// Wall-clock seconds of the last execution, set on terminal transition.
    pub elapsed_time: Option<f64>,
    /// Predecessor job ids. All must exist; the graph is acyclic.
    pub depends_on: Vec<JobId>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// User parameter values in schema column order. `None` is a column
    /// the row never had a value for; `Some("")` is an explicit empty
    /// placeholder and is preserved.
    pub params: Vec<(String, Option<String>)>,
}

/// A job to be inserted, as produced by CSV import.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub status: JobStatus,
    pub priority: i64,
    pub estimate_time: f64,
    pub elapsed_time: Option<f64>,
    pub depends_on: Vec<JobId>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub params: Vec<(String, Option<String>)>,
}

impl NewJob {
    /// A fresh pending job with default bookkeeping fields.
    pub fn pending(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            priority: 0,
            estimate_time: 0.0,
            elapsed_time: None,
            depends_on: Vec::new(),
            created_at: None,
            started_at: None,
            finished_at: None,
            error_message: None,
            params: Vec::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the estimated runtime in hours.
    pub fn with_estimate(mut self, hours: f64) -> Self {
        self.estimate_time = hours;
        self
    }

    /// Set the predecessor list.
    pub fn with_depends_on(mut self, deps: Vec<JobId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Append a user parameter value.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), Some(value.into())));
        self
    }
}

/// Parse the whitespace-separated serialized form of `depends_on`.
pub fn parse_depends_on(text: &str) -> Vec<JobId> {
    text.split_whitespace().map(JobId::new).collect()
}

/// Serialize predecessors back to the whitespace-separated store form.
pub fn format_depends_on(deps: &[JobId]) -> String {
    deps.iter()
        .map(JobId::as_str)
        .collect::<Vec<_>>()
        .join(" ")
}
