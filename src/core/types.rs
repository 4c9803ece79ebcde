//! Core identifier and status types for the dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique textual identifier for a job. Primary key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Create a new JobId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `pending → running → done | error`. Operators may reset `error` or
/// `running` back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished with exit code 0.
    Done,
    /// Finished unsuccessfully.
    Error,
}

impl JobStatus {
    /// Stable textual form used in the store and in CSV files.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// Parse the textual form. Returns `None` for anything outside the
    /// four known states.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of executing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Subprocess exited with code 0.
    Done,
    /// Subprocess failed to spawn, exited nonzero, or was killed.
    Error,
}

impl JobOutcome {
    /// The status recorded in the store for this outcome.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Done => JobStatus::Done,
            JobOutcome::Error => JobStatus::Error,
        }
    }
}

/// Classification of a `pending` job by the states of its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// All predecessors are `done` (or there are none).
    Ready,
    /// At least one predecessor is `pending` or `running`, none is `error`.
    Waiting,
    /// At least one predecessor is `error`.
    Blocked,
}
