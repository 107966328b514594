//! Workflow runner.
//!
//! `WorkflowRunner` owns one workflow's mutable state and drives it to a
//! terminal state:
//! 1. Resolves ready and unreachable steps after every transition.
//! 2. Recomputes adaptive priorities (ADAPTIVE mode).
//! 3. Dispatches admitted steps onto leased workers; each step runs as its own
//!    task in the runner's `JoinSet` and reports back over an mpsc channel.
//! 4. Applies the failure policy, honours cancellation and emits events.
//!
//! Step state is only ever written here. Every transition is published as a
//! [`StatusSnapshot`] over a watch channel, which backs `get_status`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use workers::JsonMap;

use crate::adaptation::{AdaptationEngine, DurationStats, PrioritySnapshot};
use crate::clock::Clock;
use crate::dispatcher::{Blocked, Dispatcher};
use crate::error::StepError;
use crate::event::{EventEmitter, EventKind};
use crate::executor::{ExecutorMessage, StepExecutor, StepJob};
use crate::models::{ExecutionMode, FailurePolicy, StatusSnapshot, StepId, StepState, Workflow, WorkflowState};
use crate::resolver;

/// Engine-wide collaborators shared by every runner.
#[derive(Clone)]
pub struct RunnerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub executor: StepExecutor,
    pub adaptation: AdaptationEngine,
    pub stats: Arc<DurationStats>,
    pub clock: Arc<dyn Clock>,
    pub idle_poll_interval: Duration,
    pub cancel_grace_period: Duration,
}

#[derive(Debug, Default)]
struct StepRuntime {
    attempts: u32,
    worker_id: Option<String>,
    /// Results of completed dependencies, filled in as each one finishes.
    upstream: JsonMap,
    /// Assembled when the step becomes READY.
    input: Option<JsonMap>,
    result: Option<Value>,
    error: Option<String>,
    warned_unavailable: bool,
}

enum Wake {
    Cancelled,
    Message(ExecutorMessage),
    Tick,
}

pub struct WorkflowRunner {
    workflow: Arc<Workflow>,
    ctx: RunnerContext,
    state: WorkflowState,
    states: Vec<StepState>,
    runtime: Vec<StepRuntime>,
    priorities: PrioritySnapshot,
    restored: Vec<StepId>,
    emitter: EventEmitter,
    status: Arc<watch::Sender<StatusSnapshot>>,
    cancel: CancellationToken,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    /// Set by the first failed step under fail-fast.
    failure: Option<String>,
    draining: bool,
    /// The grace period ran out; late step outcomes are discarded.
    aborted: bool,
}

impl WorkflowRunner {
    pub fn new(
        workflow: Arc<Workflow>,
        ctx: RunnerContext,
        emitter: EventEmitter,
        status: Arc<watch::Sender<StatusSnapshot>>,
        cancel: CancellationToken,
    ) -> Self {
        let len = workflow.graph.len();
        Self {
            states: vec![StepState::Pending; len],
            runtime: (0..len).map(|_| StepRuntime::default()).collect(),
            priorities: PrioritySnapshot::empty(len),
            restored: Vec::new(),
            state: WorkflowState::Created,
            workflow,
            ctx,
            emitter,
            status,
            cancel,
            started: None,
            started_at: None,
            failure: None,
            draining: false,
            aborted: false,
        }
    }

    /// Mark steps as already COMPLETED with the given results. Unknown step
    /// IDs are ignored.
    pub fn with_restored(mut self, results: BTreeMap<StepId, Value>) -> Self {
        for (step_id, result) in results {
            if let Some(i) = self.workflow.graph.index_of(&step_id) {
                self.states[i] = StepState::Completed;
                self.forward_result(i, &result);
                self.runtime[i].result = Some(result);
                self.restored.push(step_id);
            }
        }
        self.publish();
        self
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow.id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// The channel this runner publishes its snapshots on.
    pub fn status(&self) -> Arc<watch::Sender<StatusSnapshot>> {
        Arc::clone(&self.status)
    }

    /// Waiting for admission behind the concurrency ceiling.
    pub fn mark_queued(&mut self) {
        self.state = WorkflowState::Queued;
        self.publish();
    }

    /// Cancel a workflow that was never started (CREATED or QUEUED).
    pub fn cancel_unstarted(mut self) {
        let cancelled_steps = self.cancel_remaining(false);
        self.state = WorkflowState::Cancelled;
        self.publish();
        info!(workflow_id = %self.workflow.id, "workflow cancelled before start");
        self.emitter.emit(EventKind::WorkflowCancelled {
            elapsed_ms: 0,
            cancelled_steps,
        });
        self.emitter.close();
    }

    /// Move to RUNNING and emit `workflow_started`. Idempotent.
    pub fn start(&mut self) {
        if self.started.is_some() {
            return;
        }
        self.started = Some(Instant::now());
        self.started_at = Some(self.ctx.clock.now());
        self.state = WorkflowState::Running;
        info!(
            workflow_id = %self.workflow.id,
            name = %self.workflow.name,
            mode = ?self.workflow.execution_mode,
            steps = self.states.len(),
            "workflow started"
        );
        self.emitter.emit(EventKind::WorkflowStarted {
            name: self.workflow.name.clone(),
            execution_mode: self.workflow.execution_mode,
            total_steps: self.states.len(),
            restored_steps: self.restored.clone(),
        });
        self.publish();
    }

    /// Drive the workflow to a terminal state.
    #[instrument(skip(self), fields(workflow_id = %self.workflow.id))]
    pub async fn run(mut self) -> WorkflowState {
        self.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let step_cancel = self.cancel.child_token();
        let registry = Arc::clone(self.ctx.dispatcher.registry());
        let _waitlist = registry.waitlist_guard(self.workflow.id);

        loop {
            if self.cancel.is_cancelled() {
                self.drain(&mut tasks, &mut rx, &step_cancel).await;
                return self.finish_cancelled();
            }

            if self.resolve() {
                self.drain(&mut tasks, &mut rx, &step_cancel).await;
                return self.finish_failed();
            }
            if resolver::is_settled(&self.workflow.graph, &self.states) {
                return self.finish_settled();
            }

            self.adapt();
            let waiting = self.dispatch(&mut tasks, &tx, &step_cancel);

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                Some(msg) = rx.recv() => Wake::Message(msg),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(workflow_id = %self.workflow.id, error = %e, "step task ended abnormally");
                    }
                    Wake::Tick
                }
                _ = registry.released(), if waiting => Wake::Tick,
                _ = tokio::time::sleep(self.ctx.idle_poll_interval), if waiting => Wake::Tick,
            };
            match wake {
                Wake::Message(msg) => self.handle(msg),
                Wake::Cancelled | Wake::Tick => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rounds
    // -----------------------------------------------------------------------

    /// Apply unreachability and promote ready steps. Returns true when a
    /// fail-fast failure has ended the run.
    fn resolve(&mut self) -> bool {
        let graph = Arc::clone(&self.workflow.graph);
        let resolution = resolver::resolve(&graph, &self.states);
        let mut changed = false;

        for u in resolution.unreachable {
            self.states[u.step] = StepState::Unreachable;
            changed = true;
            self.emitter.emit(EventKind::StepUnreachable {
                step_id: graph.steps()[u.step].id.clone(),
                blocked_by: graph.steps()[u.blocked_by].id.clone(),
            });
        }
        if self.failure.is_some() {
            if changed {
                self.publish();
            }
            return true;
        }

        for i in resolution.ready {
            self.states[i] = StepState::Ready;
            self.runtime[i].input = Some(self.build_input(i));
            changed = true;
            self.emitter.emit(EventKind::StepReady {
                step_id: graph.steps()[i].id.clone(),
            });
        }
        if changed {
            self.publish();
        }
        false
    }

    /// Stage a completed step's result in each dependent's upstream map.
    fn forward_result(&mut self, index: usize, result: &Value) {
        let graph = Arc::clone(&self.workflow.graph);
        let step_id = &graph.steps()[index].id;
        for &dependent in graph.dependents_of(index) {
            self.runtime[dependent]
                .upstream
                .insert(step_id.clone(), result.clone());
        }
    }

    /// The step's own input plus an `upstream` object with each dependency's result.
    fn build_input(&self, index: usize) -> JsonMap {
        let graph = &self.workflow.graph;
        let mut input = graph.steps()[index].input.clone();
        if !graph.dependencies_of(index).is_empty() {
            input.insert(
                "upstream".to_owned(),
                Value::Object(self.runtime[index].upstream.clone()),
            );
        }
        input
    }

    fn adapt(&mut self) {
        if self.workflow.execution_mode != ExecutionMode::Adaptive {
            return;
        }
        let overruns = self.ctx.stats.overrun_ratios();
        let snapshot = self
            .ctx
            .adaptation
            .compute(&self.workflow.graph, &self.states, &overruns);
        if snapshot == self.priorities {
            return;
        }

        let steps = self.workflow.graph.steps();
        let boosts = snapshot
            .boosts()
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0.0)
            .map(|(i, b)| (steps[i].id.clone(), *b))
            .collect();
        let critical_path = snapshot
            .critical_path()
            .iter()
            .map(|&i| steps[i].id.clone())
            .collect();
        self.priorities = snapshot;
        self.emitter.emit(EventKind::AdaptationApplied {
            boosts,
            critical_path,
        });
        self.publish();
    }

    /// Start admitted steps. Returns true while READY steps are left waiting.
    fn dispatch(
        &mut self,
        tasks: &mut JoinSet<()>,
        tx: &UnboundedSender<ExecutorMessage>,
        step_cancel: &CancellationToken,
    ) -> bool {
        let outcome = self
            .ctx
            .dispatcher
            .dispatch_round(&self.workflow, &self.states, &self.priorities);

        for (step, reason) in outcome.blocked {
            if reason == Blocked::CapabilityUnavailable && !self.runtime[step].warned_unavailable {
                self.runtime[step].warned_unavailable = true;
                let s = &self.workflow.graph.steps()[step];
                warn!(
                    workflow_id = %self.workflow.id,
                    step_id = %s.id,
                    capability = %s.capability,
                    "no registered worker declares the required capability; step stays ready"
                );
            }
        }

        let dispatched = !outcome.assigned.is_empty();
        for assignment in outcome.assigned {
            let index = assignment.step;
            let step = &self.workflow.graph.steps()[index];
            self.states[index] = StepState::Running;
            self.runtime[index].worker_id = Some(assignment.lease.worker_id().to_owned());
            let input = match self.runtime[index].input.take() {
                Some(input) => input,
                None => self.build_input(index),
            };
            let job = StepJob {
                step: index,
                task_name: step.name.clone(),
                timeout: step.timeout,
                max_retries: step.max_retries,
                input,
                context: Arc::clone(&self.workflow.context),
                lease: assignment.lease,
                cancel: step_cancel.clone(),
            };
            let executor = self.ctx.executor.clone();
            let tx = tx.clone();
            tasks.spawn(async move { executor.run(job, tx).await });
        }
        if dispatched {
            self.publish();
        }

        self.states.contains(&StepState::Ready)
    }

    fn handle(&mut self, msg: ExecutorMessage) {
        if self.aborted {
            return;
        }
        let graph = Arc::clone(&self.workflow.graph);
        match msg {
            ExecutorMessage::AttemptStarted {
                step,
                attempt,
                worker_id,
            } => {
                if self.draining || self.states[step].is_terminal() {
                    return;
                }
                self.states[step] = StepState::Running;
                self.runtime[step].attempts = attempt;
                self.emitter.emit(EventKind::StepStarted {
                    step_id: graph.steps()[step].id.clone(),
                    worker_id,
                    attempt,
                });
            }
            ExecutorMessage::Retrying {
                step,
                attempt,
                delay,
                error,
            } => {
                if self.draining || self.states[step].is_terminal() {
                    return;
                }
                self.states[step] = StepState::Retrying;
                self.runtime[step].error = Some(error.to_string());
                self.emitter.emit(EventKind::StepRetrying {
                    step_id: graph.steps()[step].id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });
            }
            ExecutorMessage::Finished { step, report } => {
                if self.states[step].is_terminal() {
                    return;
                }
                let spec = &graph.steps()[step];
                self.runtime[step].attempts = report.attempts;
                match report.outcome {
                    Ok(result) => {
                        self.ctx
                            .stats
                            .record(&spec.capability, report.last_attempt, spec.estimated_duration);
                        self.states[step] = StepState::Completed;
                        self.forward_result(step, &result);
                        self.runtime[step].error = None;
                        self.runtime[step].result = Some(result.clone());
                        info!(
                            workflow_id = %self.workflow.id,
                            step_id = %spec.id,
                            attempts = report.attempts,
                            "step completed"
                        );
                        self.emitter.emit(EventKind::StepCompleted {
                            step_id: spec.id.clone(),
                            attempts: report.attempts,
                            duration_ms: report.elapsed.as_millis() as u64,
                            result,
                        });
                    }
                    Err(StepError::Cancelled) => {
                        self.states[step] = StepState::Cancelled;
                        self.emitter.emit(EventKind::StepCancelled {
                            step_id: spec.id.clone(),
                        });
                    }
                    Err(error) => {
                        let message = error.to_string();
                        self.states[step] = StepState::Failed;
                        self.runtime[step].error = Some(message.clone());
                        warn!(
                            workflow_id = %self.workflow.id,
                            step_id = %spec.id,
                            attempts = report.attempts,
                            error = %message,
                            "step failed"
                        );
                        self.emitter.emit(EventKind::StepFailed {
                            step_id: spec.id.clone(),
                            attempts: report.attempts,
                            error: message.clone(),
                        });
                        if self.workflow.failure_policy == FailurePolicy::FailFast
                            && !self.draining
                            && self.failure.is_none()
                        {
                            self.failure = Some(format!("step '{}' failed: {}", spec.id, message));
                        }
                    }
                }
            }
        }
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Signal in-flight steps to stop and collect their outcomes. Steps that
    /// do not finish within the grace period are aborted.
    async fn drain(
        &mut self,
        tasks: &mut JoinSet<()>,
        rx: &mut UnboundedReceiver<ExecutorMessage>,
        step_cancel: &CancellationToken,
    ) {
        self.draining = true;
        step_cancel.cancel();

        let deadline = tokio::time::sleep(self.ctx.cancel_grace_period);
        tokio::pin!(deadline);
        while !tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        workflow_id = %self.workflow.id,
                        remaining = tasks.len(),
                        "grace period elapsed; aborting in-flight steps"
                    );
                    self.aborted = true;
                    tasks.abort_all();
                    // Aborted tasks drop their jobs, which releases the leases.
                    while tasks.join_next().await.is_some() {}
                    break;
                }
                Some(msg) = rx.recv() => self.handle(msg),
                Some(_) = tasks.join_next() => {}
            }
        }
        while let Ok(msg) = rx.try_recv() {
            self.handle(msg);
        }
    }

    /// Move every non-terminal step to CANCELLED; returns their IDs.
    fn cancel_remaining(&mut self, emit_steps: bool) -> Vec<StepId> {
        let graph = Arc::clone(&self.workflow.graph);
        let mut cancelled = Vec::new();
        for (i, state) in self.states.iter_mut().enumerate() {
            if state.is_terminal() {
                continue;
            }
            *state = StepState::Cancelled;
            let step_id = graph.steps()[i].id.clone();
            if emit_steps {
                self.emitter.emit(EventKind::StepCancelled {
                    step_id: step_id.clone(),
                });
            }
            cancelled.push(step_id);
        }
        cancelled
    }

    fn finish_cancelled(mut self) -> WorkflowState {
        self.cancel_remaining(true);
        let cancelled_steps = self.ids_in(StepState::Cancelled);
        self.finish(WorkflowState::Cancelled);
        info!(workflow_id = %self.workflow.id, cancelled = cancelled_steps.len(), "workflow cancelled");
        self.emitter.emit(EventKind::WorkflowCancelled {
            elapsed_ms: self.elapsed_ms(),
            cancelled_steps,
        });
        self.emitter.close();
        WorkflowState::Cancelled
    }

    fn finish_failed(mut self) -> WorkflowState {
        self.cancel_remaining(true);
        let reason = self
            .failure
            .take()
            .unwrap_or_else(|| "workflow failed".to_owned());
        self.emit_failed(reason)
    }

    fn finish_settled(mut self) -> WorkflowState {
        if self.states.iter().all(|s| *s == StepState::Completed) {
            self.finish(WorkflowState::Completed);
            let steps = self.workflow.graph.steps();
            let results = self
                .runtime
                .iter()
                .enumerate()
                .map(|(i, rt)| (steps[i].id.clone(), rt.result.clone().unwrap_or(Value::Null)))
                .collect();
            info!(workflow_id = %self.workflow.id, elapsed_ms = self.elapsed_ms(), "workflow completed");
            self.emitter.emit(EventKind::WorkflowCompleted {
                elapsed_ms: self.elapsed_ms(),
                results,
            });
            self.emitter.close();
            return WorkflowState::Completed;
        }

        let failed = self.states.iter().filter(|s| **s == StepState::Failed).count();
        let unreachable = self.states.iter().filter(|s| **s == StepState::Unreachable).count();
        let reason = format!("{failed} step(s) failed, {unreachable} unreachable");
        self.emit_failed(reason)
    }

    fn emit_failed(mut self, reason: String) -> WorkflowState {
        let failed_steps = self.ids_in(StepState::Failed);
        let unreachable_steps = self.ids_in(StepState::Unreachable);
        self.finish(WorkflowState::Failed);
        warn!(workflow_id = %self.workflow.id, reason = %reason, "workflow failed");
        self.emitter.emit(EventKind::WorkflowFailed {
            elapsed_ms: self.elapsed_ms(),
            reason,
            failed_steps,
            unreachable_steps,
        });
        self.emitter.close();
        WorkflowState::Failed
    }

    fn finish(&mut self, state: WorkflowState) {
        self.state = state;
        self.publish();
    }

    fn ids_in(&self, state: StepState) -> Vec<StepId> {
        let steps = self.workflow.graph.steps();
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .map(|(i, _)| steps[i].id.clone())
            .collect()
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    fn publish(&self) {
        let now = self.ctx.clock.now();
        self.status.send_modify(|snap| {
            snap.state = self.state;
            snap.started_at = self.started_at;
            if self.state.is_terminal() && snap.completed_at.is_none() {
                snap.completed_at = Some(now);
            }
            for (i, step) in snap.steps.iter_mut().enumerate() {
                let rt = &self.runtime[i];
                step.state = self.states[i];
                step.attempts = rt.attempts;
                step.priority_boost = self.priorities.boost(i);
                step.worker_id = rt.worker_id.clone();
                step.result = rt.result.clone();
                step.error = rt.error.clone();
            }
            snap.refresh_progress();
        });
    }
}
