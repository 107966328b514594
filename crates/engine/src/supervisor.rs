//! Engine supervisor.
//!
//! `EngineSupervisor` is the engine's public entry point. It owns the worker
//! registry and every workflow's handle, enforces the global concurrency
//! ceiling (FIFO admission past it) and the admission backlog bound, and
//! exposes the lifecycle operations used by the API and CLI.
//!
//! The supervisor is cheap to clone; clones share the same engine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use workers::Capability;

use crate::adaptation::{AdaptationEngine, DurationStats};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, ValidationError};
use crate::event::{EventEmitter, EventStream, WorkflowEvent};
use crate::executor::StepExecutor;
use crate::graph::WorkflowGraph;
use crate::journal::{self, JournalWriter};
use crate::models::{
    StatusSnapshot, Step, StepState, Workflow, WorkflowHandle, WorkflowSpec, WorkflowState,
};
use crate::registry::{CapabilityCatalog, WorkerLoad, WorkerRegistration, WorkerRegistry};
use crate::runner::{RunnerContext, WorkflowRunner};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check `spec` against `config` and build its graph: at least one step, a
/// non-zero parallel limit, catalog capabilities, unique IDs, known
/// dependencies and no cycles.
pub fn validate_spec(spec: &WorkflowSpec, config: &EngineConfig) -> Result<WorkflowGraph, ValidationError> {
    if spec.steps.is_empty() {
        return Err(ValidationError::InvalidWorkflow("workflow has no steps".into()));
    }
    if spec.max_parallel_steps == Some(0) {
        return Err(ValidationError::InvalidWorkflow(
            "max_parallel_steps must be at least 1".into(),
        ));
    }
    let catalog = CapabilityCatalog::new(config.capabilities.iter().cloned());
    for step in &spec.steps {
        catalog.check_step(&step.id, &step.required_capability)?;
    }

    let defaults = config.step_defaults();
    WorkflowGraph::build(
        spec.steps
            .iter()
            .cloned()
            .map(|s| Step::from_spec(s, &defaults))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Reporting types
// ---------------------------------------------------------------------------

/// A READY step that no registered worker can ever take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckStep {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub capability: Capability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub active_workflows: usize,
    pub queued_workflows: usize,
    pub per_worker_load: BTreeMap<String, WorkerLoad>,
    /// READY steps per capability across running workflows.
    pub per_capability_queue_depth: BTreeMap<String, usize>,
    pub stuck_steps: Vec<StuckStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub name: String,
    pub state: WorkflowState,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct WorkflowEntry {
    status: Arc<watch::Sender<StatusSnapshot>>,
    cancel: CancellationToken,
    /// Present until `execute_workflow` takes it.
    pending: Option<(WorkflowRunner, EventStream)>,
}

impl WorkflowEntry {
    fn state(&self) -> WorkflowState {
        self.status.borrow().state
    }
}

#[derive(Default)]
struct SupervisorState {
    workflows: HashMap<Uuid, WorkflowEntry>,
    /// Creation order, for listing.
    order: Vec<Uuid>,
    queue: VecDeque<WorkflowRunner>,
    active: usize,
}

impl SupervisorState {
    /// Workflows waiting for admission: CREATED or QUEUED.
    fn backlog(&self) -> usize {
        self.workflows
            .values()
            .filter(|e| matches!(e.state(), WorkflowState::Created | WorkflowState::Queued))
            .count()
    }

    fn remove(&mut self, workflow_id: Uuid) {
        self.workflows.remove(&workflow_id);
        self.order.retain(|id| *id != workflow_id);
    }

    /// Drop the oldest terminal workflows until fewer than `limit` are kept.
    fn evict_terminal(&mut self, limit: usize) {
        while self.workflows.len() >= limit {
            let oldest = self.order.iter().copied().find(|id| {
                self.workflows
                    .get(id)
                    .is_some_and(|e| e.state().is_terminal())
            });
            let Some(id) = oldest else { break };
            debug!(workflow_id = %id, "evicting finished workflow");
            self.remove(id);
        }
    }
}

/// How `install` treats an existing entry under the same ID.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Install {
    New,
    /// Replace the entry if it has finished.
    Resume,
}

struct Inner {
    config: EngineConfig,
    catalog: CapabilityCatalog,
    registry: Arc<WorkerRegistry>,
    runner_ctx: RunnerContext,
    clock: Arc<dyn Clock>,
    state: Mutex<SupervisorState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a runner that has been admitted. Caller has counted it in `active`.
    fn launch(self: &Arc<Self>, mut runner: WorkflowRunner) {
        runner.start();
        let inner = Arc::clone(self);
        let status = runner.status();
        tokio::spawn(async move {
            let workflow_id = runner.workflow_id();
            match AssertUnwindSafe(runner.run()).catch_unwind().await {
                Ok(state) => info!(workflow_id = %workflow_id, state = ?state, "runner finished"),
                Err(_) => {
                    error!(workflow_id = %workflow_id, "runner panicked; marking workflow failed");
                    let now = inner.clock.now();
                    status.send_modify(|snap| snap.abandon(now));
                }
            }
            inner.on_finished();
        });
    }

    /// Free a slot and admit queued workflows in FIFO order.
    fn on_finished(self: &Arc<Self>) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        while state.active < self.config.max_concurrent_workflows {
            let Some(runner) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            info!(workflow_id = %runner.workflow_id(), "workflow admitted from queue");
            self.launch(runner);
        }
    }
}

// ---------------------------------------------------------------------------
// EngineSupervisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<Inner>,
}

impl EngineSupervisor {
    /// Build a supervisor with the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Arc::new(WorkerRegistry::new());
        let runner_ctx = RunnerContext {
            dispatcher: Arc::new(Dispatcher::new(Arc::clone(&registry))),
            executor: StepExecutor::with_seed(config.retry.clone(), config.rng_seed),
            adaptation: AdaptationEngine::new(config.adaptation.clone()),
            stats: Arc::new(DurationStats::new(config.adaptation.overrun_window)),
            clock: Arc::clone(&clock),
            idle_poll_interval: config.idle_poll_interval(),
            cancel_grace_period: config.cancel_grace_period(),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                catalog: CapabilityCatalog::new(config.capabilities.iter().cloned()),
                config,
                registry,
                runner_ctx,
                clock,
                state: Mutex::new(SupervisorState::default()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.inner.registry
    }

    /// Add a worker to the shared pool. Its capabilities must be in the catalog.
    pub fn register_worker(&self, registration: WorkerRegistration) -> Result<(), EngineError> {
        if let Some(unknown) = registration
            .capabilities
            .iter()
            .find(|c| !self.inner.catalog.contains(c))
        {
            return Err(EngineError::WorkerRegistration {
                worker_id: registration.worker_id.clone(),
                reason: format!("capability '{unknown}' is not in the engine's catalog"),
            });
        }
        self.inner.registry.register(registration)
    }

    /// Validate `spec` and create a workflow in state CREATED.
    ///
    /// # Errors
    /// [`EngineError::EngineOverload`] when the admission backlog is full,
    /// [`EngineError::Validation`] for an invalid graph or unknown capability.
    pub fn create_workflow(&self, spec: WorkflowSpec) -> Result<WorkflowHandle, EngineError> {
        self.check_backlog()?;
        let workflow = self.build_workflow(spec, Uuid::new_v4())?;
        self.install(workflow, BTreeMap::new(), Install::New)
    }

    /// Recreate a workflow from its journal under its original ID. Steps the
    /// journal records as completed are restored with their results and are
    /// not executed again.
    ///
    /// A workflow that already finished in this engine is replaced; one that
    /// is still live is a [`EngineError::DuplicateWorkflow`].
    pub fn resume_workflow(
        &self,
        spec: WorkflowSpec,
        events: &[WorkflowEvent],
    ) -> Result<WorkflowHandle, EngineError> {
        let workflow_id = events
            .first()
            .map(|e| e.workflow_id)
            .ok_or_else(|| ValidationError::InvalidWorkflow("journal contains no events".into()))?;
        if self
            .inner
            .lock()
            .workflows
            .get(&workflow_id)
            .is_some_and(|e| !e.state().is_terminal())
        {
            return Err(EngineError::DuplicateWorkflow(workflow_id));
        }
        self.check_backlog()?;
        let workflow = self.build_workflow(spec, workflow_id)?;
        let restored = journal::completed_results(events);
        info!(workflow_id = %workflow_id, restored = restored.len(), "resuming workflow");
        self.install(workflow, restored, Install::Resume)
    }

    /// Start a CREATED workflow and return its event stream. Past the
    /// concurrency ceiling the workflow is QUEUED and starts when a slot frees.
    pub fn execute_workflow(&self, workflow_id: Uuid) -> Result<EventStream, EngineError> {
        let mut state = self.inner.lock();
        let entry = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        if entry.state() == WorkflowState::Cancelled {
            return Err(EngineError::WorkflowCancelled(workflow_id));
        }
        let (mut runner, stream) = entry
            .pending
            .take()
            .ok_or(EngineError::AlreadyExecuted(workflow_id))?;

        if state.active < self.inner.config.max_concurrent_workflows {
            state.active += 1;
            self.inner.launch(runner);
        } else {
            info!(
                workflow_id = %workflow_id,
                active = state.active,
                queued = state.queue.len() + 1,
                "concurrency ceiling reached; workflow queued"
            );
            runner.mark_queued();
            state.queue.push_back(runner);
        }
        Ok(stream)
    }

    /// Cancel a workflow. Returns `true` if this call moved it towards
    /// CANCELLED, `false` if it was already terminal or already cancelling.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> Result<bool, EngineError> {
        let mut state = self.inner.lock();
        let entry = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        if entry.state().is_terminal() {
            return Ok(false);
        }

        if let Some((runner, _stream)) = entry.pending.take() {
            runner.cancel_unstarted();
            info!(workflow_id = %workflow_id, "created workflow cancelled");
            return Ok(true);
        }

        if let Some(pos) = state.queue.iter().position(|r| r.workflow_id() == workflow_id) {
            if let Some(runner) = state.queue.remove(pos) {
                runner.cancel_unstarted();
                info!(workflow_id = %workflow_id, "queued workflow cancelled");
                return Ok(true);
            }
        }

        let Some(entry) = state.workflows.get(&workflow_id) else {
            return Err(EngineError::WorkflowNotFound(workflow_id));
        };
        if entry.cancel.is_cancelled() {
            return Ok(false);
        }
        entry.cancel.cancel();
        info!(workflow_id = %workflow_id, "running workflow cancellation requested");
        Ok(true)
    }

    /// Drop a finished workflow from the engine. Returns `false` while it is
    /// still live.
    pub fn forget_workflow(&self, workflow_id: Uuid) -> Result<bool, EngineError> {
        let mut state = self.inner.lock();
        let entry = state
            .workflows
            .get(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        if !entry.state().is_terminal() {
            return Ok(false);
        }
        state.remove(workflow_id);
        debug!(workflow_id = %workflow_id, "workflow forgotten");
        Ok(true)
    }

    pub fn get_status(&self, workflow_id: Uuid) -> Result<StatusSnapshot, EngineError> {
        let state = self.inner.lock();
        let entry = state
            .workflows
            .get(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let snapshot = entry.status.borrow().clone();
        Ok(snapshot.with_elapsed(self.inner.clock.now()))
    }

    /// Every known workflow, oldest first.
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let state = self.inner.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.workflows.get(id))
            .map(|entry| {
                let snap = entry.status.borrow();
                WorkflowSummary {
                    workflow_id: snap.workflow_id,
                    name: snap.name.clone(),
                    state: snap.state,
                    progress: snap.progress,
                    created_at: snap.created_at,
                }
            })
            .collect()
    }

    pub fn get_metrics(&self) -> EngineMetrics {
        let state = self.inner.lock();
        let mut depth: BTreeMap<String, usize> = BTreeMap::new();
        let mut stuck = Vec::new();

        for entry in state.workflows.values() {
            let snap = entry.status.borrow();
            if snap.state != WorkflowState::Running {
                continue;
            }
            for step in snap.steps.iter().filter(|s| s.state == StepState::Ready) {
                *depth.entry(step.capability.to_string()).or_default() += 1;
                if !self.inner.registry.declares(&step.capability) {
                    stuck.push(StuckStep {
                        workflow_id: snap.workflow_id,
                        step_id: step.step_id.clone(),
                        capability: step.capability.clone(),
                    });
                }
            }
        }
        stuck.sort_by(|a, b| (a.workflow_id, &a.step_id).cmp(&(b.workflow_id, &b.step_id)));

        EngineMetrics {
            active_workflows: state.active,
            queued_workflows: state.queue.len(),
            per_worker_load: self.inner.registry.loads(),
            per_capability_queue_depth: depth,
            stuck_steps: stuck,
        }
    }

    /// Cancel every non-terminal workflow. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<Uuid> = self.inner.lock().order.clone();
        let mut cancelled = 0;
        for id in ids {
            match self.cancel_workflow(id) {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(workflow_id = %id, error = %e, "cancel during shutdown failed"),
            }
        }
        info!(cancelled, "supervisor shut down");
        cancelled
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Fail fast before validation; `install` repeats the check under the
    /// same lock that inserts the workflow.
    fn check_backlog(&self) -> Result<(), EngineError> {
        self.admit(&self.inner.lock())
    }

    fn admit(&self, state: &SupervisorState) -> Result<(), EngineError> {
        let backlog = state.backlog();
        let limit = self.inner.config.max_queued_workflows;
        if backlog >= limit {
            warn!(backlog, limit, "admission backlog full; rejecting workflow");
            return Err(EngineError::EngineOverload { backlog, limit });
        }
        Ok(())
    }

    fn build_workflow(&self, spec: WorkflowSpec, id: Uuid) -> Result<Workflow, EngineError> {
        let graph = validate_spec(&spec, &self.inner.config)?;

        Ok(Workflow {
            id,
            name: spec.name,
            graph: Arc::new(graph),
            priority: spec.priority,
            execution_mode: spec.execution_mode,
            failure_policy: spec.failure_policy,
            max_parallel_steps: spec
                .max_parallel_steps
                .unwrap_or(self.inner.config.max_parallel_steps),
            context: Arc::new(spec.context),
            created_at: self.inner.clock.now(),
        })
    }

    fn install(
        &self,
        workflow: Workflow,
        restored: BTreeMap<String, serde_json::Value>,
        mode: Install,
    ) -> Result<WorkflowHandle, EngineError> {
        let workflow = Arc::new(workflow);
        let (emitter, stream) = EventEmitter::new(workflow.id, Arc::clone(&self.inner.clock));
        let emitter = match &self.inner.config.journal_dir {
            Some(dir) => emitter.with_journal(JournalWriter::open(dir, workflow.id)?),
            None => emitter,
        };
        let (status, _) = watch::channel(StatusSnapshot::created(&workflow));
        let status = Arc::new(status);
        let cancel = CancellationToken::new();

        let runner = WorkflowRunner::new(
            Arc::clone(&workflow),
            self.inner.runner_ctx.clone(),
            emitter,
            Arc::clone(&status),
            cancel.clone(),
        );
        let runner = if restored.is_empty() {
            runner
        } else {
            runner.with_restored(restored)
        };

        let handle = WorkflowHandle {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
        };
        let mut state = self.inner.lock();
        if let Some(existing) = state.workflows.get(&workflow.id) {
            if mode == Install::New || !existing.state().is_terminal() {
                return Err(EngineError::DuplicateWorkflow(workflow.id));
            }
        }
        self.admit(&state)?;
        state.remove(workflow.id);
        state.evict_terminal(self.inner.config.max_retained_workflows);
        state.workflows.insert(
            workflow.id,
            WorkflowEntry {
                status,
                cancel,
                pending: Some((runner, stream)),
            },
        );
        state.order.push(workflow.id);
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.graph.len(),
            mode = ?workflow.execution_mode,
            "workflow created"
        );
        Ok(handle)
    }
}
