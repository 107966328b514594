//! Worker registry.
//!
//! Workers are registered for the lifetime of the supervisor and shared by
//! every workflow. The registry stores each worker's capabilities, capacity
//! and current load. Load only changes inside the registry's lock: the
//! dispatcher acquires a [`WorkerLease`] (load + 1) and the lease gives the
//! slot back when dropped (load − 1), whichever way the step ends.
//!
//! Workflows that found a capability saturated are kept on a waitlist with
//! their priority. A released slot is refused to a workflow while one of
//! higher priority is waiting on the same capability.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;
use workers::{Capability, JsonMap, Worker};

use crate::error::{EngineError, ValidationError};

// ---------------------------------------------------------------------------
// Capability catalog
// ---------------------------------------------------------------------------

/// The closed set of capability tags the engine accepts.
///
/// An empty catalog accepts every well-formed tag.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    allowed: BTreeSet<Capability>,
}

impl CapabilityCatalog {
    pub fn new(allowed: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.allowed.is_empty() || self.allowed.contains(capability)
    }

    /// Check a step's required capability.
    pub fn check_step(&self, step_id: &str, capability: &Capability) -> Result<(), ValidationError> {
        if self.contains(capability) {
            Ok(())
        } else {
            Err(ValidationError::UnknownCapability {
                step_id: step_id.to_owned(),
                capability: capability.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Everything needed to add a worker to the pool.
#[derive(Clone)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub capabilities: BTreeSet<Capability>,
    pub max_concurrent_tasks: usize,
    /// Free-form worker settings, reported back through metrics.
    pub config: JsonMap,
    pub worker: Arc<dyn Worker>,
}

impl WorkerRegistration {
    /// Register `worker` with the capabilities it declares and a capacity of one.
    pub fn new(worker_id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: worker.declared_capabilities(),
            max_concurrent_tasks: 1,
            config: JsonMap::new(),
            worker,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_config(mut self, config: JsonMap) -> Self {
        self.config = config;
        self
    }
}

/// Load report for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub current_load: usize,
    pub max_concurrent_tasks: usize,
    pub capabilities: Vec<Capability>,
}

pub(crate) struct WorkerSlot {
    pub(crate) worker_id: String,
    pub(crate) capabilities: BTreeSet<Capability>,
    pub(crate) max_concurrent_tasks: usize,
    pub(crate) current_load: usize,
    pub(crate) config: JsonMap,
    pub(crate) worker: Arc<dyn Worker>,
}

impl WorkerSlot {
    pub(crate) fn is_eligible(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability) && self.current_load < self.max_concurrent_tasks
    }
}

/// A workflow waiting for capacity on some capabilities.
pub(crate) struct Waiter {
    pub(crate) priority: i32,
    pub(crate) capabilities: BTreeSet<Capability>,
}

/// Slots in registration order, the round-robin cursor and the waitlist.
pub(crate) struct RegistryState {
    pub(crate) slots: Vec<WorkerSlot>,
    pub(crate) cursor: usize,
    pub(crate) waiting: HashMap<Uuid, Waiter>,
}

impl RegistryState {
    /// Whether a workflow with priority above `priority` waits on `capability`.
    pub(crate) fn outranked(&self, capability: &Capability, priority: i32) -> bool {
        self.waiting
            .values()
            .any(|w| w.priority > priority && w.capabilities.contains(capability))
    }
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
    released: Notify,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                slots: Vec::new(),
                cursor: 0,
                waiting: HashMap::new(),
            }),
            released: Notify::new(),
        }
    }

    /// Add a worker to the pool.
    ///
    /// # Errors
    /// [`EngineError::WorkerRegistration`] for a duplicate ID, an empty
    /// capability set or a zero capacity.
    pub fn register(&self, registration: WorkerRegistration) -> Result<(), EngineError> {
        let reject = |reason: &str| EngineError::WorkerRegistration {
            worker_id: registration.worker_id.clone(),
            reason: reason.to_owned(),
        };
        if registration.capabilities.is_empty() {
            return Err(reject("no capabilities declared"));
        }
        if registration.max_concurrent_tasks == 0 {
            return Err(reject("max_concurrent_tasks must be at least 1"));
        }

        let mut state = self.lock();
        if state.slots.iter().any(|s| s.worker_id == registration.worker_id) {
            return Err(reject("a worker with this ID is already registered"));
        }
        info!(
            worker_id = %registration.worker_id,
            capabilities = ?registration.capabilities,
            max_concurrent_tasks = registration.max_concurrent_tasks,
            "worker registered"
        );
        state.slots.push(WorkerSlot {
            worker_id: registration.worker_id,
            capabilities: registration.capabilities,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_load: 0,
            config: registration.config,
            worker: registration.worker,
        });
        drop(state);

        // New capacity may unblock waiting steps.
        self.released.notify_waiters();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any registered worker declares `capability`, busy or not.
    pub fn declares(&self, capability: &Capability) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|s| s.capabilities.contains(capability))
    }

    pub fn current_load(&self, worker_id: &str) -> Option<usize> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.worker_id == worker_id)
            .map(|s| s.current_load)
    }

    /// The settings bag a worker was registered with.
    pub fn worker_config(&self, worker_id: &str) -> Option<JsonMap> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.worker_id == worker_id)
            .map(|s| s.config.clone())
    }

    /// Load of every worker, keyed by worker ID.
    pub fn loads(&self) -> BTreeMap<String, WorkerLoad> {
        self.lock()
            .slots
            .iter()
            .map(|s| {
                (
                    s.worker_id.clone(),
                    WorkerLoad {
                        current_load: s.current_load,
                        max_concurrent_tasks: s.max_concurrent_tasks,
                        capabilities: s.capabilities.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    /// Resolves when a lease is released or a worker registers.
    ///
    /// Only wakes tasks already waiting; callers pair it with a poll interval.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Record the capabilities `workflow_id` is waiting on. An empty set
    /// takes it off the waitlist.
    pub fn set_waiting(&self, workflow_id: Uuid, priority: i32, capabilities: BTreeSet<Capability>) {
        let mut state = self.lock();
        if capabilities.is_empty() {
            if state.waiting.remove(&workflow_id).is_some() {
                drop(state);
                self.released.notify_waiters();
            }
            return;
        }
        state.waiting.insert(
            workflow_id,
            Waiter {
                priority,
                capabilities,
            },
        );
    }

    /// Number of workflows on the waitlist.
    pub fn waiting(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Keep `workflow_id` on the waitlist only while the returned guard lives.
    pub fn waitlist_guard(self: &Arc<Self>, workflow_id: Uuid) -> WaitlistGuard {
        WaitlistGuard {
            registry: Arc::clone(self),
            workflow_id,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one unit of capacity on slot `index`. Caller holds the lock and
    /// has checked eligibility.
    pub(crate) fn lease(
        self: &Arc<Self>,
        state: &mut RegistryState,
        index: usize,
    ) -> WorkerLease {
        let slot = &mut state.slots[index];
        slot.current_load += 1;
        debug!(
            worker_id = %slot.worker_id,
            load = slot.current_load,
            max = slot.max_concurrent_tasks,
            "worker leased"
        );
        WorkerLease {
            registry: Arc::clone(self),
            index,
            worker_id: slot.worker_id.clone(),
            worker: Arc::clone(&slot.worker),
        }
    }

    fn release(&self, index: usize) {
        {
            let mut state = self.lock();
            if let Some(slot) = state.slots.get_mut(index) {
                slot.current_load = slot.current_load.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }
}

/// Takes a workflow off the waitlist when dropped.
pub struct WaitlistGuard {
    registry: Arc<WorkerRegistry>,
    workflow_id: Uuid,
}

impl Drop for WaitlistGuard {
    fn drop(&mut self) {
        self.registry
            .set_waiting(self.workflow_id, 0, BTreeSet::new());
    }
}

// ---------------------------------------------------------------------------
// WorkerLease
// ---------------------------------------------------------------------------

/// One unit of a worker's capacity, held for the lifetime of a step execution.
pub struct WorkerLease {
    registry: Arc<WorkerRegistry>,
    index: usize,
    worker_id: String,
    worker: Arc<dyn Worker>,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.registry.release(self.index);
    }
}
