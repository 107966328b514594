//! Dispatcher: decides which ready steps run next and on which worker.
//!
//! A scheduling round has two halves:
//! 1. **Admission** (pure): order the READY steps for the workflow's
//!    execution mode and compute how many more may be in flight.
//! 2. **Assignment**: for each admitted step pick the least-busy eligible
//!    worker (ties broken round-robin over registration order) and take a
//!    lease on it. A step with no eligible worker stays READY.
//!
//! Capabilities a round found saturated put the workflow on the registry's
//! waitlist at its priority, so freed capacity goes to the highest-priority
//! waiting workflow first.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use workers::Capability;

use crate::adaptation::PrioritySnapshot;
use crate::models::{ExecutionMode, StepState, Workflow};
use crate::registry::{WorkerLease, WorkerRegistry, WorkerSlot};

/// Why a ready step could not be assigned this round. Neither is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// No registered worker declares the capability.
    CapabilityUnavailable,
    /// Workers declare it but all are at capacity.
    Saturated,
}

/// A step paired with the worker capacity it will run on.
#[derive(Debug)]
pub struct Assignment {
    pub step: usize,
    pub lease: WorkerLease,
}

#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub assigned: Vec<Assignment>,
    pub blocked: Vec<(usize, Blocked)>,
}

pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Run one scheduling round for `workflow`.
    ///
    /// `states` is aligned with the workflow's graph; steps in `assigned` must
    /// be moved out of READY by the caller before the next round.
    pub fn dispatch_round(
        &self,
        workflow: &Workflow,
        states: &[StepState],
        priorities: &PrioritySnapshot,
    ) -> RoundOutcome {
        let mut capacity = available_slots(workflow, states);
        let mut outcome = RoundOutcome::default();
        let mut saturated = BTreeSet::new();

        for step in admission_order(workflow, states, priorities) {
            if capacity == 0 {
                break;
            }
            let capability = &workflow.graph.steps()[step].capability;
            match self.assign(capability, workflow.priority) {
                Ok(lease) => {
                    outcome.assigned.push(Assignment { step, lease });
                    capacity -= 1;
                }
                Err(reason) => {
                    if reason == Blocked::Saturated {
                        saturated.insert(capability.clone());
                    }
                    outcome.blocked.push((step, reason));
                }
            }
        }
        self.registry
            .set_waiting(workflow.id, workflow.priority, saturated);
        outcome
    }

    /// Lease the least-busy eligible worker for `capability` on behalf of a
    /// workflow with `priority`.
    ///
    /// Reports [`Blocked::Saturated`] while a higher-priority workflow is
    /// waiting on the same capability.
    pub fn assign(&self, capability: &Capability, priority: i32) -> Result<WorkerLease, Blocked> {
        let mut state = self.registry.lock();
        if state.outranked(capability, priority) {
            return Err(Blocked::Saturated);
        }
        match select_worker(&state.slots, state.cursor, capability) {
            Some(index) => {
                state.cursor = (index + 1) % state.slots.len();
                Ok(self.registry.lease(&mut state, index))
            }
            None if state.slots.iter().any(|s| s.capabilities.contains(capability)) => {
                Err(Blocked::Saturated)
            }
            None => Err(Blocked::CapabilityUnavailable),
        }
    }
}

/// How many more steps this workflow may put in flight right now.
pub fn available_slots(workflow: &Workflow, states: &[StepState]) -> usize {
    let in_flight = states.iter().filter(|s| s.is_in_flight()).count();
    workflow.parallel_limit().saturating_sub(in_flight)
}

/// READY steps in the order the workflow's mode admits them.
///
/// - SEQUENTIAL / PARALLEL: declaration order.
/// - ADAPTIVE: `priority_boost + workflow.priority` descending, then shorter
///   `estimated_duration`, then declaration order.
/// - PIPELINE: stage, then declaration order; only steps within one stage of
///   the lowest unfinished stage are admitted.
pub fn admission_order(
    workflow: &Workflow,
    states: &[StepState],
    priorities: &PrioritySnapshot,
) -> Vec<usize> {
    let graph = &workflow.graph;
    let mut ready: Vec<usize> = (0..states.len())
        .filter(|&i| states[i] == StepState::Ready)
        .collect();

    match workflow.execution_mode {
        ExecutionMode::Sequential | ExecutionMode::Parallel => {}
        ExecutionMode::Adaptive => {
            let base = f64::from(workflow.priority);
            ready.sort_by(|&a, &b| {
                let pa = priorities.boost(a) + base;
                let pb = priorities.boost(b) + base;
                pb.total_cmp(&pa)
                    .then_with(|| {
                        graph.steps()[a]
                            .estimated_duration
                            .cmp(&graph.steps()[b].estimated_duration)
                    })
                    .then(a.cmp(&b))
            });
        }
        ExecutionMode::Pipeline => {
            let floor = (0..states.len())
                .filter(|&i| !states[i].is_terminal())
                .map(|i| graph.stage(i))
                .min()
                .unwrap_or(0);
            ready.retain(|&i| graph.stage(i) <= floor + 1);
            ready.sort_by(|&a, &b| match graph.stage(a).cmp(&graph.stage(b)) {
                Ordering::Equal => a.cmp(&b),
                other => other,
            });
        }
    }
    ready
}

/// Lowest-load eligible slot, scanning from `cursor` so equal loads rotate.
pub(crate) fn select_worker(
    slots: &[WorkerSlot],
    cursor: usize,
    capability: &Capability,
) -> Option<usize> {
    let min_load = slots
        .iter()
        .filter(|s| s.is_eligible(capability))
        .map(|s| s.current_load)
        .min()?;
    let n = slots.len();
    (0..n)
        .map(|k| (cursor + k) % n)
        .find(|&i| slots[i].is_eligible(capability) && slots[i].current_load == min_load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use workers::mock::MockWorker;
    use workers::Worker;

    use crate::graph::WorkflowGraph;
    use crate::models::Step;
    use crate::registry::WorkerRegistration;

    use StepState::*;

    fn cap(tag: &str) -> Capability {
        Capability::new(tag).unwrap()
    }

    fn registry_with(workers: &[(&str, &str, usize)]) -> Arc<WorkerRegistry> {
        let registry = Arc::new(WorkerRegistry::new());
        for (id, capability, max) in workers {
            let worker: Arc<dyn Worker> =
                Arc::new(MockWorker::returning(*id, json!({})).with_capabilities([*capability]));
            registry
                .register(WorkerRegistration::new(*id, worker).with_max_concurrent_tasks(*max))
                .unwrap();
        }
        registry
    }

    fn flat_workflow(n: usize, mode: ExecutionMode, max_parallel: usize) -> Workflow {
        let steps = (0..n).map(|i| Step::new(format!("s{i}"), cap("general"))).collect();
        let mut wf = Workflow::new("wf", WorkflowGraph::build(steps).unwrap(), mode);
        wf.max_parallel_steps = max_parallel;
        wf
    }

    #[test]
    fn least_busy_worker_wins() {
        let registry = registry_with(&[("w1", "general", 3), ("w2", "general", 3)]);
        let dispatcher = Dispatcher::new(registry.clone());

        let first = dispatcher.assign(&cap("general"), 0).unwrap();
        let second = dispatcher.assign(&cap("general"), 0).unwrap();
        assert_ne!(first.worker_id(), second.worker_id());

        // w1 busy with one more task; the next pick must be w2.
        drop(second);
        let third = dispatcher.assign(&cap("general"), 0).unwrap();
        assert_eq!(third.worker_id(), "w2");
        assert_eq!(registry.current_load("w1"), Some(1));
        assert_eq!(registry.current_load("w2"), Some(1));
        drop(first);
        drop(third);
    }

    #[test]
    fn equal_loads_rotate_in_registration_order() {
        let registry = registry_with(&[
            ("w1", "general", 5),
            ("w2", "general", 5),
            ("w3", "general", 5),
        ]);
        let dispatcher = Dispatcher::new(registry);
        let mut picked = Vec::new();
        for _ in 0..3 {
            // Dropping the lease keeps every load at zero; only the cursor moves.
            let lease = dispatcher.assign(&cap("general"), 0).unwrap();
            picked.push(lease.worker_id().to_owned());
        }
        assert_eq!(picked, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let registry = registry_with(&[("w1", "general", 2)]);
        let dispatcher = Dispatcher::new(registry.clone());
        let a = dispatcher.assign(&cap("general"), 0).unwrap();
        let b = dispatcher.assign(&cap("general"), 0).unwrap();
        assert_eq!(dispatcher.assign(&cap("general"), 0).unwrap_err(), Blocked::Saturated);
        assert_eq!(registry.current_load("w1"), Some(2));
        drop((a, b));
        assert_eq!(registry.current_load("w1"), Some(0));
    }

    #[test]
    fn missing_capability_is_reported() {
        let registry = registry_with(&[("w1", "general", 1)]);
        let dispatcher = Dispatcher::new(registry);
        assert_eq!(
            dispatcher.assign(&cap("crm.fetch"), 0).unwrap_err(),
            Blocked::CapabilityUnavailable
        );
    }

    #[test]
    fn only_capable_workers_are_chosen() {
        let registry = registry_with(&[("crm", "crm.fetch", 4), ("gen", "general", 4)]);
        let dispatcher = Dispatcher::new(registry);
        for _ in 0..3 {
            assert_eq!(dispatcher.assign(&cap("crm.fetch"), 0).unwrap().worker_id(), "crm");
        }
    }

    #[test]
    fn waiting_higher_priority_workflow_claims_freed_capacity() {
        let registry = registry_with(&[("w1", "general", 1)]);
        let dispatcher = Dispatcher::new(registry.clone());
        let held = dispatcher.assign(&cap("general"), 0).unwrap();

        let mut urgent = flat_workflow(1, ExecutionMode::Parallel, 1);
        urgent.priority = 5;
        let routine = flat_workflow(1, ExecutionMode::Parallel, 1);

        // Both find the worker busy and join the waitlist.
        let outcome = dispatcher.dispatch_round(&routine, &[Ready], &PrioritySnapshot::empty(1));
        assert_eq!(outcome.blocked, vec![(0, Blocked::Saturated)]);
        let outcome = dispatcher.dispatch_round(&urgent, &[Ready], &PrioritySnapshot::empty(1));
        assert_eq!(outcome.blocked, vec![(0, Blocked::Saturated)]);
        assert_eq!(registry.waiting(), 2);

        // The lower-priority workflow polls first but is refused.
        drop(held);
        let outcome = dispatcher.dispatch_round(&routine, &[Ready], &PrioritySnapshot::empty(1));
        assert!(outcome.assigned.is_empty());
        assert_eq!(registry.current_load("w1"), Some(0));

        let outcome = dispatcher.dispatch_round(&urgent, &[Ready], &PrioritySnapshot::empty(1));
        assert_eq!(outcome.assigned.len(), 1);
        assert_eq!(registry.waiting(), 1);
        drop(outcome);

        let outcome = dispatcher.dispatch_round(&routine, &[Ready], &PrioritySnapshot::empty(1));
        assert_eq!(outcome.assigned.len(), 1);
        assert_eq!(registry.waiting(), 0);
    }

    #[test]
    fn parallel_round_respects_max_parallel_steps() {
        let registry = registry_with(&[("w1", "general", 10)]);
        let dispatcher = Dispatcher::new(registry);
        let wf = flat_workflow(5, ExecutionMode::Parallel, 2);
        let states = vec![Ready; 5];
        let outcome = dispatcher.dispatch_round(&wf, &states, &PrioritySnapshot::empty(5));
        let steps: Vec<usize> = outcome.assigned.iter().map(|a| a.step).collect();
        assert_eq!(steps, vec![0, 1]);

        let states = vec![Running, Ready, Ready, Ready, Ready];
        let outcome = dispatcher.dispatch_round(&wf, &states, &PrioritySnapshot::empty(5));
        assert_eq!(outcome.assigned.len(), 1);
    }

    #[test]
    fn sequential_round_admits_one_step_only_when_idle() {
        let registry = registry_with(&[("w1", "general", 10)]);
        let dispatcher = Dispatcher::new(registry);
        let wf = flat_workflow(3, ExecutionMode::Sequential, 8);

        let outcome = dispatcher.dispatch_round(&wf, &[Ready, Ready, Ready], &PrioritySnapshot::empty(3));
        assert_eq!(outcome.assigned.len(), 1);
        assert_eq!(outcome.assigned[0].step, 0);

        let outcome =
            dispatcher.dispatch_round(&wf, &[Running, Ready, Ready], &PrioritySnapshot::empty(3));
        assert!(outcome.assigned.is_empty());
    }

    #[test]
    fn blocked_steps_do_not_consume_capacity() {
        let registry = registry_with(&[("w1", "general", 10)]);
        let dispatcher = Dispatcher::new(registry);
        let graph = WorkflowGraph::build(vec![
            Step::new("crm", cap("crm.fetch")),
            Step::new("a", cap("general")),
            Step::new("b", cap("general")),
        ])
        .unwrap();
        let mut wf = Workflow::new("wf", graph, ExecutionMode::Parallel);
        wf.max_parallel_steps = 2;
        let outcome = dispatcher.dispatch_round(&wf, &[Ready, Ready, Ready], &PrioritySnapshot::empty(3));
        assert_eq!(outcome.blocked, vec![(0, Blocked::CapabilityUnavailable)]);
        let steps: Vec<usize> = outcome.assigned.iter().map(|a| a.step).collect();
        assert_eq!(steps, vec![1, 2]);
    }

    #[test]
    fn adaptive_order_uses_boost_then_estimate_then_declaration() {
        let graph = WorkflowGraph::build(vec![
            Step::new("slow", cap("general")).with_estimated_duration(Duration::from_secs(9)),
            Step::new("fast", cap("general")).with_estimated_duration(Duration::from_secs(1)),
            Step::new("boosted", cap("general")).with_estimated_duration(Duration::from_secs(9)),
            Step::new("fast_twin", cap("general")).with_estimated_duration(Duration::from_secs(1)),
        ])
        .unwrap();
        let wf = Workflow::new("wf", graph, ExecutionMode::Adaptive);
        let priorities = PrioritySnapshot::from_boosts(vec![0.0, 0.0, 5.0, 0.0], Vec::new());
        let order = admission_order(&wf, &[Ready, Ready, Ready, Ready], &priorities);
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn pipeline_admits_at_most_one_stage_ahead() {
        let g = cap("general");
        // a → b → c, and x (stage 0) still running.
        let graph = WorkflowGraph::build(vec![
            Step::new("x", g.clone()),
            Step::new("a", g.clone()),
            Step::new("b", g.clone()).depends_on(["a"]),
            Step::new("c", g.clone()).depends_on(["b"]),
            Step::new("y", g).depends_on(["x"]),
        ])
        .unwrap();
        let wf = Workflow::new("wf", graph, ExecutionMode::Pipeline);
        // Stage 0 has x running, so stage 2 (c) must wait even though it is ready.
        let states = [Running, Completed, Completed, Ready, Pending];
        assert!(admission_order(&wf, &states, &PrioritySnapshot::empty(5)).is_empty());

        // Once stage 0 drains, stage 2 is inside the window.
        let states = [Completed, Completed, Completed, Ready, Ready];
        assert_eq!(admission_order(&wf, &states, &PrioritySnapshot::empty(5)), vec![4, 3]);
    }
}
