//! `engine` crate: workflow graphs, dependency resolution, capability-based
//! dispatch, step execution and the supervisor that ties them together.

pub mod adaptation;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod journal;
pub mod models;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod supervisor;

pub use adaptation::{AdaptationEngine, DurationStats, PrioritySnapshot};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdaptationConfig, EngineConfig, RetryPolicy};
pub use error::{EngineError, StepError, ValidationError};
pub use event::{EventKind, EventStream, WorkflowEvent};
pub use graph::WorkflowGraph;
pub use models::{
    ExecutionMode, FailurePolicy, StatusSnapshot, Step, StepSpec, StepState, StepStatus, Workflow,
    WorkflowHandle, WorkflowSpec, WorkflowState,
};
pub use registry::{CapabilityCatalog, WorkerLoad, WorkerRegistration, WorkerRegistry};
pub use supervisor::{validate_spec, EngineMetrics, EngineSupervisor, StuckStep, WorkflowSummary};
