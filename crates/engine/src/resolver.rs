//! Dependency resolution.
//!
//! Pure functions over a graph and a state slice aligned with
//! [`WorkflowGraph::steps`]. The runner calls [`resolve`] after every state
//! transition; nothing here is cached between rounds.

use crate::graph::WorkflowGraph;
use crate::models::StepState;

/// Outcome of one resolution pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// PENDING steps whose dependencies are all COMPLETED, in declaration order.
    pub ready: Vec<usize>,
    /// PENDING steps that can never run, with the dependency that blocks them.
    /// Ordered so a blocker always precedes the steps it blocks.
    pub unreachable: Vec<Unreachable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unreachable {
    pub step: usize,
    pub blocked_by: usize,
}

/// Compute ready and unreachable steps.
///
/// Unreachability is transitive within one call: if `a` failed and `c`
/// depends on `b` which depends on `a`, both `b` and `c` are reported.
pub fn resolve(graph: &WorkflowGraph, states: &[StepState]) -> Resolution {
    debug_assert_eq!(graph.len(), states.len());

    // Topological scan so a step sees its dependencies' effective state.
    let mut effective = states.to_vec();
    let mut unreachable = Vec::new();
    for &i in graph.topological_order() {
        if effective[i] != StepState::Pending {
            continue;
        }
        let blocker = graph
            .dependencies_of(i)
            .iter()
            .copied()
            .find(|&d| effective[d].blocks_dependents());
        if let Some(blocked_by) = blocker {
            effective[i] = StepState::Unreachable;
            unreachable.push(Unreachable { step: i, blocked_by });
        }
    }

    let ready = (0..graph.len())
        .filter(|&i| {
            effective[i] == StepState::Pending
                && graph
                    .dependencies_of(i)
                    .iter()
                    .all(|&d| effective[d] == StepState::Completed)
        })
        .collect();

    Resolution { ready, unreachable }
}

/// True when no step is READY or in flight and no PENDING step can ever
/// become ready; the workflow has nothing left to do.
pub fn is_settled(graph: &WorkflowGraph, states: &[StepState]) -> bool {
    if states
        .iter()
        .any(|s| matches!(s, StepState::Ready) || s.is_in_flight())
    {
        return false;
    }
    let resolution = resolve(graph, states);
    resolution.ready.is_empty()
        && states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == StepState::Pending)
            .all(|(i, _)| resolution.unreachable.iter().any(|u| u.step == i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Step;
    use workers::Capability;

    use StepState::{Cancelled, Completed, Failed, Pending, Ready, Retrying, Running};

    fn diamond() -> WorkflowGraph {
        let cap = Capability::new("general").unwrap();
        WorkflowGraph::build(vec![
            Step::new("s1", cap.clone()),
            Step::new("s2", cap.clone()).depends_on(["s1"]),
            Step::new("s3", cap.clone()).depends_on(["s1"]),
            Step::new("s4", cap).depends_on(["s2", "s3"]),
        ])
        .unwrap()
    }

    #[test]
    fn roots_are_ready_initially() {
        let graph = diamond();
        let r = resolve(&graph, &[Pending, Pending, Pending, Pending]);
        assert_eq!(r.ready, vec![0]);
        assert!(r.unreachable.is_empty());
    }

    #[test]
    fn dependents_become_ready_only_after_all_dependencies_complete() {
        let graph = diamond();
        let r = resolve(&graph, &[Completed, Pending, Pending, Pending]);
        assert_eq!(r.ready, vec![1, 2]);

        let r = resolve(&graph, &[Completed, Completed, Running, Pending]);
        assert!(r.ready.is_empty());

        let r = resolve(&graph, &[Completed, Completed, Completed, Pending]);
        assert_eq!(r.ready, vec![3]);
    }

    #[test]
    fn non_pending_steps_are_never_reported_ready() {
        let graph = diamond();
        let r = resolve(&graph, &[Completed, Ready, Running, Pending]);
        assert!(r.ready.is_empty());
    }

    #[test]
    fn failure_propagates_transitively() {
        let graph = diamond();
        let r = resolve(&graph, &[Failed, Pending, Pending, Pending]);
        assert!(r.ready.is_empty());
        let steps: Vec<usize> = r.unreachable.iter().map(|u| u.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(r.unreachable[0].blocked_by, 0);
        // s4 is blocked by whichever of s2/s3 the scan marked first.
        assert!(matches!(r.unreachable[2].blocked_by, 1 | 2));
    }

    #[test]
    fn cancelled_dependency_blocks_only_its_branch() {
        let graph = diamond();
        let r = resolve(&graph, &[Completed, Cancelled, Completed, Pending]);
        assert_eq!(r.unreachable, vec![super::Unreachable { step: 3, blocked_by: 1 }]);
    }

    #[test]
    fn settled_detection() {
        let graph = diamond();
        assert!(!is_settled(&graph, &[Pending, Pending, Pending, Pending]));
        assert!(!is_settled(&graph, &[Completed, Running, Completed, Pending]));
        assert!(is_settled(&graph, &[Completed, Completed, Completed, Completed]));
        // s4 still PENDING but unreachable behind a failure.
        assert!(is_settled(&graph, &[Completed, Failed, Completed, Pending]));
        assert!(!is_settled(&graph, &[Completed, Completed, Retrying, Pending]));
    }
}
