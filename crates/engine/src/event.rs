//! Workflow events.
//!
//! Every observable change in a workflow's life is one [`WorkflowEvent`]. The
//! runner is the only producer; callers receive events through the
//! [`EventStream`] returned by `execute_workflow`. On the wire an event is a
//! flat JSON object tagged by `type`:
//!
//! ```json
//! { "workflow_id": "…", "timestamp": "…", "type": "step_completed",
//!   "step_id": "fetch", "attempts": 1, "duration_ms": 120, "result": {} }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::journal::JournalWriter;
use crate::models::{ExecutionMode, StepId};

/// Stream of events for one workflow, ending after the terminal event.
pub type EventStream = UnboundedReceiverStream<WorkflowEvent>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub workflow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted {
        name: String,
        execution_mode: ExecutionMode,
        total_steps: usize,
        /// Steps carried over as COMPLETED from a previous run.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        restored_steps: Vec<StepId>,
    },
    StepReady {
        step_id: StepId,
    },
    StepStarted {
        step_id: StepId,
        worker_id: String,
        attempt: u32,
    },
    StepRetrying {
        step_id: StepId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StepCompleted {
        step_id: StepId,
        attempts: u32,
        duration_ms: u64,
        result: Value,
    },
    StepFailed {
        step_id: StepId,
        attempts: u32,
        error: String,
    },
    StepUnreachable {
        step_id: StepId,
        blocked_by: StepId,
    },
    StepCancelled {
        step_id: StepId,
    },
    AdaptationApplied {
        boosts: BTreeMap<StepId, f64>,
        critical_path: Vec<StepId>,
    },
    WorkflowCompleted {
        elapsed_ms: u64,
        results: BTreeMap<StepId, Value>,
    },
    WorkflowFailed {
        elapsed_ms: u64,
        reason: String,
        failed_steps: Vec<StepId>,
        unreachable_steps: Vec<StepId>,
    },
    WorkflowCancelled {
        elapsed_ms: u64,
        cancelled_steps: Vec<StepId>,
    },
}

impl EventKind {
    /// The `type` tag, as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::StepReady { .. } => "step_ready",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepUnreachable { .. } => "step_unreachable",
            Self::StepCancelled { .. } => "step_cancelled",
            Self::AdaptationApplied { .. } => "adaptation_applied",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepReady { step_id }
            | Self::StepStarted { step_id, .. }
            | Self::StepRetrying { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepUnreachable { step_id, .. }
            | Self::StepCancelled { step_id } => Some(step_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. } | Self::WorkflowCancelled { .. }
        )
    }
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn step_id(&self) -> Option<&str> {
        self.kind.step_id()
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// EventEmitter
// ---------------------------------------------------------------------------

/// Stamps, journals and delivers one workflow's events.
///
/// A dropped receiver does not stop the workflow; events are still journaled.
pub struct EventEmitter {
    workflow_id: Uuid,
    clock: Arc<dyn Clock>,
    tx: Option<UnboundedSender<WorkflowEvent>>,
    journal: Option<JournalWriter>,
}

impl EventEmitter {
    pub fn new(workflow_id: Uuid, clock: Arc<dyn Clock>) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Self {
            workflow_id,
            clock,
            tx: Some(tx),
            journal: None,
        };
        (emitter, UnboundedReceiverStream::new(rx))
    }

    pub fn with_journal(mut self, journal: JournalWriter) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn emit(&mut self, kind: EventKind) {
        let event = WorkflowEvent {
            workflow_id: self.workflow_id,
            timestamp: self.clock.now(),
            kind,
        };
        debug!(workflow_id = %self.workflow_id, event = event.name(), step_id = ?event.step_id(), "event");

        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append(&event) {
                warn!(workflow_id = %self.workflow_id, error = %e, "journal write failed; journaling disabled");
                self.journal = None;
            }
        }

        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!(workflow_id = %self.workflow_id, "event stream dropped by consumer");
                self.tx = None;
            }
        }
    }

    /// End the stream. Called after the terminal event.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[test]
    fn events_serialise_flat_with_type_tag() {
        let event = WorkflowEvent {
            workflow_id: Uuid::nil(),
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            kind: EventKind::StepRetrying {
                step_id: "fetch".into(),
                attempt: 1,
                delay_ms: 100,
                error: "timeout".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_retrying");
        assert_eq!(value["step_id"], "fetch");
        assert_eq!(value["delay_ms"], 100);
        assert_eq!(value["workflow_id"], Uuid::nil().to_string());

        let back: WorkflowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn names_match_wire_tags() {
        let kinds = [
            EventKind::StepReady { step_id: "a".into() },
            EventKind::StepCancelled { step_id: "a".into() },
            EventKind::WorkflowCancelled {
                elapsed_ms: 0,
                cancelled_steps: vec![],
            },
        ];
        for kind in kinds {
            let value = serde_json::to_value(&kind).unwrap();
            assert_eq!(value["type"], kind.name());
        }
    }

    #[test]
    fn step_id_and_terminal_helpers() {
        let started = EventKind::WorkflowStarted {
            name: "wf".into(),
            execution_mode: ExecutionMode::Parallel,
            total_steps: 1,
            restored_steps: vec![],
        };
        assert_eq!(started.step_id(), None);
        assert!(!started.is_terminal());

        let completed = EventKind::StepCompleted {
            step_id: "a".into(),
            attempts: 1,
            duration_ms: 5,
            result: json!({}),
        };
        assert_eq!(completed.step_id(), Some("a"));
        assert!(EventKind::WorkflowCompleted {
            elapsed_ms: 1,
            results: BTreeMap::new()
        }
        .is_terminal());
    }

    #[tokio::test]
    async fn emitter_stamps_and_closes() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let id = Uuid::new_v4();
        let (mut emitter, stream) = EventEmitter::new(id, clock.clone());

        emitter.emit(EventKind::StepReady { step_id: "a".into() });
        clock.advance(chrono::Duration::seconds(2));
        emitter.emit(EventKind::StepReady { step_id: "b".into() });
        emitter.close();

        let events: Vec<WorkflowEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.workflow_id == id));
        assert_eq!(events[1].timestamp - events[0].timestamp, chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_break_emission() {
        let (mut emitter, stream) = EventEmitter::new(Uuid::new_v4(), Arc::new(ManualClock::new(Utc::now())));
        drop(stream);
        emitter.emit(EventKind::StepReady { step_id: "a".into() });
        emitter.emit(EventKind::StepReady { step_id: "b".into() });
    }
}
