//! Import-time validation of the dependency graph.
//!
//! Every referenced predecessor must exist and the graph must be acyclic.
//! Validation runs once when jobs enter the store; the runtime resolver
//! then only needs point queries against predecessor statuses.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use super::types::JobId;

/// Errors raised while validating a batch of jobs and their edges.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A dependency references a job that exists neither in the batch nor
    /// in the store.
    #[error("job '{from}' depends on non-existent job '{to}'")]
    MissingDependency { from: JobId, to: JobId },

    /// A cycle was detected in the dependency graph.
    #[error("dependency cycle detected involving job '{0}'")]
    CycleDetected(JobId),

    /// The same job id appears twice in one batch.
    #[error("duplicate job id in batch: '{0}'")]
    DuplicateJob(JobId),
}

/// Validate a batch of `(job, predecessors)` pairs.
///
/// `existing` holds ids already present in the store (empty on a fresh
/// import). Edges may point at batch members or at existing jobs; existing
/// jobs were validated when they were imported and cannot point back at
/// the batch, so cycle detection only needs the batch-internal edges.
pub fn validate(
    batch: &[(JobId, Vec<JobId>)],
    existing: &HashSet<JobId>,
) -> Result<(), GraphError> {
    let mut batch_ids: HashSet<&JobId> = HashSet::with_capacity(batch.len());
    for (id, _) in batch {
        if !batch_ids.insert(id) {
            return Err(GraphError::DuplicateJob(id.clone()));
        }
    }

    for (id, deps) in batch {
        for dep in deps {
            if !batch_ids.contains(dep) && !existing.contains(dep) {
                return Err(GraphError::MissingDependency {
                    from: id.clone(),
                    to: dep.clone(),
                });
            }
        }
    }

    detect_cycle(batch, &batch_ids)
}

/// Kahn's algorithm over the batch-internal edges. Anything left with a
/// nonzero in-degree after the queue drains sits on a cycle.
fn detect_cycle(
    batch: &[(JobId, Vec<JobId>)],
    batch_ids: &HashSet<&JobId>,
) -> Result<(), GraphError> {
    let mut indegree: HashMap<&JobId, usize> = HashMap::with_capacity(batch.len());
    let mut dependents: HashMap<&JobId, Vec<&JobId>> = HashMap::new();

    for (id, deps) in batch {
        let internal = deps.iter().filter(|d| batch_ids.contains(d)).count();
        indegree.insert(id, internal);
        for dep in deps.iter().filter(|d| batch_ids.contains(d)) {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut queue: VecDeque<&JobId> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for &child in children {
                let deg = indegree
                    .get_mut(child)
                    .expect("dependent is a batch member");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if visited == batch.len() {
        Ok(())
    } else {
        let culprit = indegree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| (*id).clone())
            .min()
            .expect("at least one node on the cycle");
        Err(GraphError::CycleDetected(culprit))
    }
}
