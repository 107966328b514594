//! Core domain models for the orchestration engine.
//!
//! Submission types (`WorkflowSpec`, `StepSpec`) are what callers send in and
//! are serialisable to/from JSON. `Step` and `Workflow` are the validated,
//! immutable forms the runner executes. Runtime state lives in the runner;
//! `StatusSnapshot` is the read-only view it publishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use workers::{Capability, JsonMap};

use crate::graph::WorkflowGraph;

pub type StepId = String;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// How a workflow's ready steps are admitted each scheduling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step in flight at a time, in declaration order.
    Sequential,
    /// Ready steps in declaration order, up to `max_parallel_steps`.
    #[default]
    Parallel,
    /// Ready steps ordered by adaptive priority, up to `max_parallel_steps`.
    Adaptive,
    /// Stage-ordered admission with a two-stage window.
    Pipeline,
}

/// What a permanently failed step does to the rest of the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the workflow on the first failed step and cancel everything else.
    #[default]
    FailFast,
    /// Keep running independent branches; fail at the end.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Unreachable,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Unreachable | Self::Cancelled
        )
    }

    /// Dispatched to a worker and not yet finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    /// A dependency in this state makes its dependents unreachable.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Unreachable | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Submission types
// ---------------------------------------------------------------------------

/// A step as submitted. Optional fields fall back to the engine's [`StepDefaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique identifier within the workflow (referenced by `dependencies`).
    pub id: StepId,
    /// Task name handed to the worker; defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub required_capability: Capability,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    /// Step-specific input passed to the worker.
    #[serde(default)]
    pub input: JsonMap,
}

/// A workflow as submitted to `create_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Tie-break beneath step-level priority.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Per-workflow in-flight limit; defaults to the engine setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    /// Read-only key/value bag passed to every step execution.
    #[serde(default)]
    pub context: JsonMap,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            steps,
            priority: 0,
            execution_mode: ExecutionMode::default(),
            failure_policy: FailurePolicy::default(),
            max_parallel_steps: None,
            context: JsonMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_max_parallel_steps(mut self, limit: usize) -> Self {
        self.max_parallel_steps = Some(limit);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Engine-wide defaults for optional step fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefaults {
    pub timeout: Duration,
    pub max_retries: u32,
    pub estimated_duration: Duration,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            estimated_duration: Duration::from_secs(1),
        }
    }
}

/// A step with every field resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub capability: Capability,
    pub dependencies: Vec<StepId>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub estimated_duration: Duration,
    pub input: JsonMap,
}

impl Step {
    /// A step with default timeout, retries and estimate.
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        let id = id.into();
        let defaults = StepDefaults::default();
        Self {
            name: id.clone(),
            id,
            capability,
            dependencies: Vec::new(),
            timeout: defaults.timeout,
            max_retries: defaults.max_retries,
            estimated_duration: defaults.estimated_duration,
            input: JsonMap::new(),
        }
    }

    pub fn from_spec(spec: StepSpec, defaults: &StepDefaults) -> Self {
        Self {
            name: spec.name.unwrap_or_else(|| spec.id.clone()),
            id: spec.id,
            capability: spec.required_capability,
            dependencies: spec.dependencies,
            timeout: spec
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            max_retries: spec.max_retries.unwrap_or(defaults.max_retries),
            estimated_duration: spec
                .estimated_duration_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.estimated_duration),
            input: spec.input,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn with_input(mut self, input: JsonMap) -> Self {
        self.input = input;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A validated workflow definition. Immutable once built.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub graph: Arc<WorkflowGraph>,
    pub priority: i32,
    pub execution_mode: ExecutionMode,
    pub failure_policy: FailurePolicy,
    pub max_parallel_steps: usize,
    pub context: Arc<JsonMap>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, graph: WorkflowGraph, mode: ExecutionMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            graph: Arc::new(graph),
            priority: 0,
            execution_mode: mode,
            failure_policy: FailurePolicy::default(),
            max_parallel_steps: 4,
            context: Arc::new(JsonMap::new()),
            created_at: Utc::now(),
        }
    }

    /// In-flight step limit for this workflow's mode.
    pub fn parallel_limit(&self) -> usize {
        match self.execution_mode {
            ExecutionMode::Sequential => 1,
            _ => self.max_parallel_steps.max(1),
        }
    }
}

/// Returned by `create_workflow`; identifies the workflow in later calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub workflow_id: Uuid,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Per-step view inside a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_id: StepId,
    pub name: String,
    pub capability: Capability,
    pub state: StepState,
    pub attempts: u32,
    pub priority_boost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of one workflow, as returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub workflow_id: Uuid,
    pub name: String,
    pub state: WorkflowState,
    pub execution_mode: ExecutionMode,
    /// Share of steps in a terminal state, 0–100.
    pub progress: f64,
    pub steps: Vec<StepStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl StatusSnapshot {
    /// Snapshot of a freshly created workflow: every step PENDING.
    pub fn created(workflow: &Workflow) -> Self {
        let steps = workflow
            .graph
            .steps()
            .iter()
            .map(|s| StepStatus {
                step_id: s.id.clone(),
                name: s.name.clone(),
                capability: s.capability.clone(),
                state: StepState::Pending,
                attempts: 0,
                priority_boost: 0.0,
                worker_id: None,
                result: None,
                error: None,
            })
            .collect();
        Self {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            state: WorkflowState::Created,
            execution_mode: workflow.execution_mode,
            progress: 0.0,
            steps,
            created_at: workflow.created_at,
            started_at: None,
            completed_at: None,
            elapsed_ms: 0,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Recompute `progress` from the step states.
    pub fn refresh_progress(&mut self) {
        if self.steps.is_empty() {
            self.progress = if self.state.is_terminal() { 100.0 } else { 0.0 };
            return;
        }
        let done = self.steps.iter().filter(|s| s.state.is_terminal()).count();
        self.progress = done as f64 * 100.0 / self.steps.len() as f64;
    }

    /// Mark the workflow FAILED after its runner died, cancelling every
    /// unfinished step. No-op once terminal.
    pub fn abandon(&mut self, now: DateTime<Utc>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = WorkflowState::Failed;
        self.completed_at = Some(now);
        for step in self.steps.iter_mut().filter(|s| !s.state.is_terminal()) {
            step.state = StepState::Cancelled;
            step.worker_id = None;
        }
        self.refresh_progress();
    }

    /// Fill `elapsed_ms` relative to `now` (or to completion, once finished).
    pub fn with_elapsed(mut self, now: DateTime<Utc>) -> Self {
        self.elapsed_ms = match self.started_at {
            Some(start) => {
                let end = self.completed_at.unwrap_or(now);
                (end - start).num_milliseconds().max(0) as u64
            }
            None => 0,
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cap(tag: &str) -> Capability {
        Capability::new(tag).unwrap()
    }

    #[test]
    fn step_spec_defaults_apply() {
        let spec: StepSpec = serde_json::from_value(json!({
            "id": "fetch",
            "required_capability": "crm.fetch",
            "timeout_ms": 250
        }))
        .unwrap();
        let defaults = StepDefaults {
            timeout: Duration::from_secs(9),
            max_retries: 5,
            estimated_duration: Duration::from_millis(40),
        };
        let step = Step::from_spec(spec, &defaults);
        assert_eq!(step.name, "fetch");
        assert_eq!(step.timeout, Duration::from_millis(250));
        assert_eq!(step.max_retries, 5);
        assert_eq!(step.estimated_duration, Duration::from_millis(40));
        assert!(step.dependencies.is_empty());
    }

    #[test]
    fn workflow_spec_parses_modes_and_policies() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "name": "nightly",
            "execution_mode": "adaptive",
            "failure_policy": "continue",
            "steps": [
                { "id": "a", "required_capability": "general" },
                { "id": "b", "required_capability": "general", "dependencies": ["a"] }
            ]
        }))
        .unwrap();
        assert_eq!(spec.execution_mode, ExecutionMode::Adaptive);
        assert_eq!(spec.failure_policy, FailurePolicy::Continue);
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.steps[1].dependencies, vec!["a"]);
    }

    #[test]
    fn sequential_mode_limits_parallelism_to_one() {
        let graph = WorkflowGraph::build(vec![Step::new("a", cap("general"))]).unwrap();
        let mut wf = Workflow::new("wf", graph, ExecutionMode::Sequential);
        wf.max_parallel_steps = 8;
        assert_eq!(wf.parallel_limit(), 1);
        wf.execution_mode = ExecutionMode::Parallel;
        assert_eq!(wf.parallel_limit(), 8);
    }

    #[test]
    fn progress_counts_terminal_steps() {
        let graph = WorkflowGraph::build(vec![
            Step::new("a", cap("general")),
            Step::new("b", cap("general")),
            Step::new("c", cap("general")),
            Step::new("d", cap("general")),
        ])
        .unwrap();
        let wf = Workflow::new("wf", graph, ExecutionMode::Parallel);
        let mut snap = StatusSnapshot::created(&wf);
        snap.steps[0].state = StepState::Completed;
        snap.steps[1].state = StepState::Unreachable;
        snap.steps[2].state = StepState::Running;
        snap.refresh_progress();
        assert_eq!(snap.progress, 50.0);
    }

    #[test]
    fn abandoned_snapshot_is_failed_and_finished() {
        let graph = WorkflowGraph::build(vec![
            Step::new("a", cap("general")),
            Step::new("b", cap("general")),
        ])
        .unwrap();
        let wf = Workflow::new("wf", graph, ExecutionMode::Parallel);
        let mut snap = StatusSnapshot::created(&wf);
        snap.state = WorkflowState::Running;
        snap.steps[0].state = StepState::Completed;
        snap.steps[1].state = StepState::Running;
        snap.steps[1].worker_id = Some("w1".into());

        let now = Utc::now();
        snap.abandon(now);
        assert_eq!(snap.state, WorkflowState::Failed);
        assert_eq!(snap.completed_at, Some(now));
        assert_eq!(snap.steps[0].state, StepState::Completed);
        assert_eq!(snap.steps[1].state, StepState::Cancelled);
        assert_eq!(snap.steps[1].worker_id, None);
        assert_eq!(snap.progress, 100.0);

        // A second call leaves the first outcome alone.
        snap.abandon(now + chrono::Duration::seconds(5));
        assert_eq!(snap.completed_at, Some(now));
    }
}
