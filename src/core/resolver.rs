//! Readiness classification of pending jobs.
//!
//! A pending job is `Ready` when every predecessor is `done`, `Blocked`
//! when any predecessor is `error` (or is itself a blocked pending job),
//! and `Waiting` otherwise. Blockage propagates: once a predecessor can
//! never run, neither can anything downstream of it. Readiness is
//! evaluated against a point-in-time status view at claim time, never
//! cached: predecessor state may change between attempts.

use std::collections::{HashMap, VecDeque};

use super::types::{JobId, JobStatus, Readiness};

/// Classify one job by the statuses of its direct predecessors.
///
/// A predecessor missing from the view is treated like `error`: the
/// import path validates that all references exist, so a hole can only
/// mean the row was deleted out from under us, and such a job can never
/// run.
pub fn classify(depends_on: &[JobId], statuses: &HashMap<JobId, JobStatus>) -> Readiness {
    let mut waiting = false;

    for dep in depends_on {
        match statuses.get(dep) {
            Some(JobStatus::Done) => {}
            Some(JobStatus::Pending) | Some(JobStatus::Running) => waiting = true,
            Some(JobStatus::Error) | None => return Readiness::Blocked,
        }
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Classify every pending job, propagating blockage through pending
/// chains: a job waiting only on a blocked pending predecessor is itself
/// Blocked, not Waiting, so workers can tell "will resolve later" from
/// "will never run".
///
/// `pending` holds `(job, predecessors)` for all pending rows; `statuses`
/// is the full status view.
pub fn classify_pending(
    pending: &[(JobId, Vec<JobId>)],
    statuses: &HashMap<JobId, JobStatus>,
) -> HashMap<JobId, Readiness> {
    let mut classes: HashMap<JobId, Readiness> = HashMap::with_capacity(pending.len());

    // Reverse edges between pending jobs, for blockage propagation.
    let mut dependents: HashMap<&JobId, Vec<&JobId>> = HashMap::new();
    let mut blocked_queue: VecDeque<&JobId> = VecDeque::new();

    for (id, deps) in pending {
        let direct = classify(deps, statuses);
        if direct == Readiness::Blocked {
            blocked_queue.push_back(id);
        }
        classes.insert(id.clone(), direct);
        for dep in deps {
            if matches!(statuses.get(dep), Some(JobStatus::Pending)) {
                dependents.entry(dep).or_default().push(id);
            }
        }
    }

    while let Some(blocked) = blocked_queue.pop_front() {
        if let Some(children) = dependents.get(blocked) {
            for &child in children {
                let class = classes
                    .get_mut(child)
                    .expect("dependent is a pending job");
                if *class != Readiness::Blocked {
                    *class = Readiness::Blocked;
                    blocked_queue.push_back(child);
                }
            }
        }
    }

    classes
}
