//! Workflow graph: built and validated once, immutable afterwards.
//!
//! Rules enforced by [`WorkflowGraph::build`]:
//! 1. Step IDs must be non-empty and unique within the workflow.
//! 2. Every dependency must reference a step in the same workflow.
//! 3. The dependency graph must be acyclic (three-colour depth-first search;
//!    the error names the steps on the cycle).
//!
//! Steps are addressed by their declaration index throughout the engine;
//! state slices passed to the resolver, dispatcher and adaptation engine are
//! aligned with [`WorkflowGraph::steps`].

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ValidationError;
use crate::models::Step;

#[derive(Debug)]
pub struct WorkflowGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    topo_order: Vec<usize>,
    stages: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl WorkflowGraph {
    /// Validate `steps` and build the graph.
    ///
    /// # Errors
    /// - [`ValidationError::InvalidStep`] for an empty ID or a zero timeout.
    /// - [`ValidationError::DuplicateStepId`] if two steps share an ID.
    /// - [`ValidationError::UnknownDependency`] if a dependency names a missing step.
    /// - [`ValidationError::Cycle`] if the dependencies are not acyclic.
    pub fn build(steps: Vec<Step>) -> Result<Self, ValidationError> {
        // -------------------------------------------------------------------
        // 1. Ensure step IDs are valid and unique
        // -------------------------------------------------------------------
        let mut index: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(ValidationError::InvalidStep {
                    step_id: step.id.clone(),
                    reason: "step ID must not be empty".into(),
                });
            }
            if step.timeout.is_zero() {
                return Err(ValidationError::InvalidStep {
                    step_id: step.id.clone(),
                    reason: "timeout must be positive".into(),
                });
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateStepId(step.id.clone()));
            }
        }

        // -------------------------------------------------------------------
        // 2. Resolve dependency references
        // -------------------------------------------------------------------
        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut deps = Vec::with_capacity(step.dependencies.len());
            for dep in &step.dependencies {
                let &d = index
                    .get(dep)
                    .ok_or_else(|| ValidationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    })?;
                // Repeated dependencies are harmless; keep one edge.
                if seen.insert(d) {
                    deps.push(d);
                    dependents[d].push(i);
                }
            }
            dependencies.push(deps);
        }

        // -------------------------------------------------------------------
        // 3. Cycle detection (three-colour DFS)
        // -------------------------------------------------------------------
        let mut colours = vec![Colour::White; steps.len()];
        for start in 0..steps.len() {
            if colours[start] == Colour::White {
                if let Some(cycle) = find_cycle(start, &dependencies, &mut colours) {
                    return Err(ValidationError::Cycle {
                        path: cycle.into_iter().map(|i| steps[i].id.clone()).collect(),
                    });
                }
            }
        }

        // -------------------------------------------------------------------
        // 4. Topological order (Kahn's algorithm, declaration order on ties)
        // -------------------------------------------------------------------
        let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut topo_order = Vec::with_capacity(steps.len());
        while let Some(i) = queue.pop_front() {
            topo_order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        debug_assert_eq!(topo_order.len(), steps.len());

        // Stage = length of the longest dependency chain leading to the step.
        let mut stages = vec![0usize; steps.len()];
        for &i in &topo_order {
            stages[i] = dependencies[i]
                .iter()
                .map(|&d| stages[d] + 1)
                .max()
                .unwrap_or(0);
        }

        Ok(Self {
            steps,
            index,
            dependencies,
            dependents,
            topo_order,
            stages,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.index_of(step_id).map(|i| &self.steps[i])
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    /// Indices of the steps `index` depends on.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Indices of the steps that depend directly on `index`.
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Every step that depends on `index`, directly or transitively, in
    /// declaration order.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.steps.len()];
        let mut stack = vec![index];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if !seen[d] {
                    seen[d] = true;
                    stack.push(d);
                }
            }
        }
        (0..self.steps.len()).filter(|&i| seen[i]).collect()
    }

    /// Step indices, dependencies before dependents.
    pub fn topological_order(&self) -> &[usize] {
        &self.topo_order
    }

    /// Step IDs in topological order.
    pub fn topological_ids(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|&i| self.steps[i].id.as_str())
            .collect()
    }

    /// Dependency depth of a step; steps without dependencies are stage 0.
    pub fn stage(&self, index: usize) -> usize {
        self.stages[index]
    }

    /// Step IDs grouped by stage.
    pub fn stages(&self) -> Vec<Vec<&str>> {
        let count = self.stages.iter().max().map_or(0, |m| m + 1);
        let mut out = vec![Vec::new(); count];
        for (i, &stage) in self.stages.iter().enumerate() {
            out[stage].push(self.steps[i].id.as_str());
        }
        out
    }
}

/// Depth-first search from `start` following dependency edges. Returns the
/// cycle (first index repeated at the end) if a grey node is reached.
///
/// Iterative: each stack frame is a node and the index of its next
/// dependency to visit, so long chains do not grow the call stack.
fn find_cycle(start: usize, dependencies: &[Vec<usize>], colours: &mut [Colour]) -> Option<Vec<usize>> {
    let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
    colours[start] = Colour::Grey;

    while let Some(frame) = stack.last_mut() {
        let (node, next) = *frame;
        let Some(&dep) = dependencies[node].get(next) else {
            colours[node] = Colour::Black;
            stack.pop();
            continue;
        };
        frame.1 += 1;
        match colours[dep] {
            Colour::Grey => {
                let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                let mut cycle: Vec<usize> = stack[from..].iter().map(|&(n, _)| n).collect();
                cycle.push(dep);
                return Some(cycle);
            }
            Colour::White => {
                colours[dep] = Colour::Grey;
                stack.push((dep, 0));
            }
            Colour::Black => {}
        }
    }
    None
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use workers::Capability;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, Capability::new("general").unwrap()).depends_on(deps.iter().copied())
    }

    #[test]
    fn valid_linear_graph_returns_sorted_order() {
        // a → b → c
        let graph = WorkflowGraph::build(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])])
            .expect("should be valid");
        assert_eq!(graph.topological_ids(), vec!["a", "b", "c"]);
        assert_eq!(graph.stages(), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn valid_diamond_graph() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let graph = WorkflowGraph::build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ])
        .expect("should be valid");

        let order = graph.topological_ids();
        assert_eq!(order.first(), Some(&"a"));
        assert_eq!(order.last(), Some(&"d"));
        assert_eq!(graph.stages(), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(graph.transitive_dependents(0), vec![1, 2, 3]);
        assert_eq!(graph.dependents_of(1), &[3]);
    }

    #[test]
    fn forward_references_are_allowed() {
        let graph = WorkflowGraph::build(vec![step("report", &["fetch"]), step("fetch", &[])])
            .expect("declaration order does not matter");
        assert_eq!(graph.topological_ids(), vec!["fetch", "report"]);
        assert_eq!(graph.stage(0), 1);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let result = WorkflowGraph::build(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(
            result,
            Err(ValidationError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_step_is_rejected() {
        let result = WorkflowGraph::build(vec![step("a", &["ghost"])]);
        assert!(matches!(
            result,
            Err(ValidationError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected_with_path() {
        // a → b → c → a
        let result = WorkflowGraph::build(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]);
        match result {
            Err(ValidationError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == id), "{id} missing from {path:?}");
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_path_excludes_steps_leading_into_it() {
        // entry → x ⇄ y
        let result = WorkflowGraph::build(vec![
            step("entry", &["x"]),
            step("x", &["y"]),
            step("y", &["x"]),
        ]);
        match result {
            Err(ValidationError::Cycle { path }) => assert_eq!(path, vec!["x", "y", "x"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let result = WorkflowGraph::build(vec![step("loop", &["loop"])]);
        assert!(matches!(
            result,
            Err(ValidationError::Cycle { path }) if path == vec!["loop", "loop"]
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = WorkflowGraph::build(vec![step("a", &[]).with_timeout(Duration::ZERO)]);
        assert!(matches!(result, Err(ValidationError::InvalidStep { .. })));
    }

    #[test]
    fn single_step_no_dependencies_is_valid() {
        let graph = WorkflowGraph::build(vec![step("solo", &[])]).expect("single step should be valid");
        assert_eq!(graph.topological_ids(), vec!["solo"]);
        assert_eq!(graph.len(), 1);
    }

    fn chain(len: usize) -> Vec<Step> {
        (0..len)
            .map(|i| {
                let id = format!("s{i}");
                if i == 0 {
                    step(&id, &[])
                } else {
                    let prev = format!("s{}", i - 1);
                    step(&id, &[prev.as_str()])
                }
            })
            .collect()
    }

    #[test]
    fn very_long_chain_builds() {
        let graph = WorkflowGraph::build(chain(100_000)).expect("long chain is acyclic");
        assert_eq!(graph.len(), 100_000);
        assert_eq!(graph.stage(99_999), 99_999);
        assert_eq!(graph.topological_order()[0], 0);
    }

    #[test]
    fn cycle_at_the_end_of_a_long_chain_is_reported() {
        // s0 depends on the last step, closing a loop through the whole chain.
        let mut steps = chain(50_000);
        steps[0] = step("s0", &["s49999"]);
        match WorkflowGraph::build(steps) {
            Err(ValidationError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 50_001);
            }
            other => panic!("expected cycle, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn repeated_dependency_keeps_one_edge() {
        let graph = WorkflowGraph::build(vec![step("a", &[]), step("b", &["a", "a"])]).unwrap();
        assert_eq!(graph.dependencies_of(1), &[0]);
        assert_eq!(graph.dependents_of(0), &[1]);
    }
}
