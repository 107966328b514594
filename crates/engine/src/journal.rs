//! Append-only event journal.
//!
//! One JSON line per event at `<dir>/<workflow_id>.jsonl`, flushed as each
//! event is written. A journal can be replayed with [`read_events`] and handed
//! to `EngineSupervisor::resume_workflow` to skip work that already completed.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{EventKind, WorkflowEvent};
use crate::models::StepId;

pub struct JournalWriter {
    path: PathBuf,
    file: File,
}

impl JournalWriter {
    /// Open (or create) the journal for `workflow_id` under `dir`.
    pub fn open(dir: &Path, workflow_id: Uuid) -> Result<Self, EngineError> {
        fs::create_dir_all(dir)?;
        let path = journal_path(dir, workflow_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, event: &WorkflowEvent) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        Ok(())
    }
}

pub fn journal_path(dir: &Path, workflow_id: Uuid) -> PathBuf {
    dir.join(format!("{workflow_id}.jsonl"))
}

/// Read every event from a journal file. Blank lines are skipped; a truncated
/// final line (crash mid-write) is ignored.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<WorkflowEvent>, EngineError> {
    let reader = BufReader::new(File::open(path)?);
    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let last = lines.len().saturating_sub(1);

    let mut events = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(_) if n == last => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(events)
}

/// Results of every step that completed, by step ID.
pub fn completed_results(events: &[WorkflowEvent]) -> BTreeMap<StepId, Value> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepCompleted { step_id, result, .. } => Some((step_id.clone(), result.clone())),
            _ => None,
        })
        .collect()
}
