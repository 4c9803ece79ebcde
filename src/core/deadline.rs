//! Worker time budget and claim admission.
//!
//! `max_runtime` is a soft deadline for claim admission only; the host
//! batch scheduler's wall-clock limit remains authoritative for actual
//! termination. `margin_time` leaves headroom for in-flight jobs to
//! commit before that hard kill.

use std::time::Instant;

/// Remaining-time accounting for one worker process.
#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    max_runtime_secs: f64,
    margin_secs: f64,
}

impl Budget {
    /// Start the clock now.
    pub fn start(max_runtime_secs: u64, margin_secs: u64) -> Self {
        Self {
            started: Instant::now(),
            max_runtime_secs: max_runtime_secs as f64,
            margin_secs: margin_secs as f64,
        }
    }

    /// Seconds the worker will still admit new jobs for:
    /// `max_runtime − margin_time − elapsed`. May be negative.
    pub fn remaining(&self) -> f64 {
        self.max_runtime_secs - self.margin_secs - self.started.elapsed().as_secs_f64()
    }

    /// True once the budget is exhausted and claiming must stop.
    pub fn exhausted(&self) -> bool {
        self.remaining() <= 0.0
    }
}

/// Admission filter for smart scheduling: a candidate whose scaled
/// estimate exceeds the remaining budget is skipped.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionFilter {
    pub budget_seconds: f64,
    pub speed_factor: f64,
}

impl AdmissionFilter {
    /// Whether a job with the given estimate (hours) fits the budget.
    pub fn admits(&self, estimate_hours: f64) -> bool {
        estimate_hours * 3600.0 / self.speed_factor <= self.budget_seconds
    }
}
