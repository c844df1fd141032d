//! Submission-time validation of a feature's phase graph.
//!
//! Dependencies are intra-feature only and must form a DAG over the
//! declared `phase_number`s. Validation rejects duplicate numbers, unknown
//! or self references, out-of-range priorities, and cycles — nothing is
//! persisted when any check fails.

use std::collections::{HashMap, HashSet};

use crate::errors::SubmitError;
use crate::store::models::NewPhase;

pub const PRIORITY_MIN: i64 = 10;
pub const PRIORITY_MAX: i64 = 90;
pub const PRIORITY_DEFAULT: i64 = 50;

/// Validate a submission's phase graph and priority. Returns the topological
/// layering (each layer's phases only depend on earlier layers), which also
/// proves acyclicity.
pub fn validate_submission(
    phases: &[NewPhase],
    priority: i64,
) -> Result<Vec<Vec<i64>>, SubmitError> {
    if phases.is_empty() {
        return Err(SubmitError::EmptyPhases);
    }
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
        return Err(SubmitError::PriorityOutOfRange { priority });
    }

    let mut numbers = HashSet::new();
    for phase in phases {
        if !numbers.insert(phase.phase_number) {
            return Err(SubmitError::DuplicatePhaseNumber {
                number: phase.phase_number,
            });
        }
    }

    for phase in phases {
        for dep in &phase.depends_on {
            if *dep == phase.phase_number {
                return Err(SubmitError::SelfDependency {
                    phase: phase.phase_number,
                });
            }
            if !numbers.contains(dep) {
                return Err(SubmitError::UnknownDependency {
                    phase: phase.phase_number,
                    dependency: *dep,
                });
            }
        }
    }

    layer(phases)
}

/// Kahn's algorithm over the declared edges. Any residue after the queue
/// drains is a cycle.
fn layer(phases: &[NewPhase]) -> Result<Vec<Vec<i64>>, SubmitError> {
    let mut in_degree: HashMap<i64, usize> = phases
        .iter()
        .map(|p| (p.phase_number, p.depends_on.len()))
        .collect();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for phase in phases {
        for dep in &phase.depends_on {
            dependents.entry(*dep).or_default().push(phase.phase_number);
        }
    }

    let mut layers = Vec::new();
    let mut current: Vec<i64> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    current.sort_unstable();

    let mut placed = 0usize;
    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for number in &current {
            for dependent in dependents.get(number).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent missing from in-degree map");
                *degree -= 1;
                if *degree == 0 {
                    next.push(*dependent);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::replace(&mut current, next));
    }

    if placed != phases.len() {
        let mut members: Vec<i64> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n)
            .collect();
        members.sort_unstable();
        return Err(SubmitError::CycleDetected { members });
    }

    Ok(layers)
}
