pub mod core;
pub mod csvio;
pub mod execution;
pub mod storage;

pub use crate::core::deadline::{AdmissionFilter, Budget};
pub use crate::core::graph::GraphError;
pub use crate::core::job::{JobRow, NewJob};
pub use crate::core::types::{JobId, JobOutcome, JobStatus, Readiness};

pub use crate::csvio::CsvError;

pub use crate::execution::{ArgError, ArgMode, Worker, WorkerError, WorkerOptions, WorkerSummary};

pub use crate::storage::{ClaimOutcome, JobStore, Snapshot, StoreError};
