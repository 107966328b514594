//! Adaptive priority.
//!
//! Between scheduling rounds the runner asks [`AdaptationEngine::compute`]
//! for a fresh [`PrioritySnapshot`]. The computation is a pure function of the
//! graph, the current step states and the observed duration statistics; it
//! never mutates steps and never changes which steps are ready, only the order
//! in which ADAPTIVE workflows admit them.
//!
//! Two signals feed the boost:
//! - **critical path**: steps on the longest remaining chain (weighted by
//!   `estimated_duration`) get a flat boost;
//! - **overrun**: when steps of a capability have recently taken much longer
//!   than estimated, remaining steps needing that capability are boosted in
//!   proportion so slow lanes are not starved by faster work.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use workers::Capability;

use crate::config::AdaptationConfig;
use crate::graph::WorkflowGraph;
use crate::models::StepState;

// ---------------------------------------------------------------------------
// PrioritySnapshot
// ---------------------------------------------------------------------------

/// Per-step priority boosts for one round, aligned with the graph's steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrioritySnapshot {
    boosts: Vec<f64>,
    critical_path: Vec<usize>,
}

impl PrioritySnapshot {
    /// No boosts for a graph of `len` steps.
    pub fn empty(len: usize) -> Self {
        Self {
            boosts: vec![0.0; len],
            critical_path: Vec::new(),
        }
    }

    pub fn from_boosts(boosts: Vec<f64>, critical_path: Vec<usize>) -> Self {
        Self {
            boosts,
            critical_path,
        }
    }

    pub fn boost(&self, index: usize) -> f64 {
        self.boosts.get(index).copied().unwrap_or(0.0)
    }

    pub fn boosts(&self) -> &[f64] {
        &self.boosts
    }

    /// Step indices on the longest remaining chain, first to last.
    pub fn critical_path(&self) -> &[usize] {
        &self.critical_path
    }
}

// ---------------------------------------------------------------------------
// DurationStats
// ---------------------------------------------------------------------------

/// Moving window of observed/estimated duration ratios per capability.
///
/// Shared by every runner, since workers serve all workflows.
#[derive(Debug)]
pub struct DurationStats {
    window: usize,
    samples: Mutex<HashMap<Capability, VecDeque<f64>>>,
}

impl DurationStats {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record one successful attempt.
    pub fn record(&self, capability: &Capability, observed: Duration, estimated: Duration) {
        if estimated.is_zero() {
            return;
        }
        let ratio = observed.as_secs_f64() / estimated.as_secs_f64();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let window = samples.entry(capability.clone()).or_default();
        if window.len() == self.window {
            window.pop_front();
        }
        window.push_back(ratio);
    }

    /// Average ratio per capability over the current window.
    pub fn overrun_ratios(&self) -> HashMap<Capability, f64> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(cap, w)| (cap.clone(), w.iter().sum::<f64>() / w.len() as f64))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// AdaptationEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdaptationEngine {
    config: AdaptationConfig,
}

impl AdaptationEngine {
    pub fn new(config: AdaptationConfig) -> Self {
        Self { config }
    }

    /// Compute this round's boosts. Only PENDING and READY steps are boosted.
    pub fn compute(
        &self,
        graph: &WorkflowGraph,
        states: &[StepState],
        overruns: &HashMap<Capability, f64>,
    ) -> PrioritySnapshot {
        let mut boosts = vec![0.0; graph.len()];
        let path = critical_path(graph, states);
        for &i in &path {
            boosts[i] += self.config.critical_path_boost;
        }

        for (i, step) in graph.steps().iter().enumerate() {
            if !is_remaining(states[i]) {
                continue;
            }
            if let Some(&ratio) = overruns.get(&step.capability) {
                if ratio > self.config.overrun_threshold {
                    boosts[i] += (self.config.overrun_boost_factor * ratio)
                        .min(self.config.max_overrun_boost);
                }
            }
        }

        PrioritySnapshot::from_boosts(boosts, path)
    }
}

fn is_remaining(state: StepState) -> bool {
    matches!(state, StepState::Pending | StepState::Ready)
}

/// Longest chain of remaining (PENDING/READY) steps, weighted by estimated
/// duration, found with a reverse-topological longest-path scan. Ties go to
/// the earlier-declared step.
pub fn critical_path(graph: &WorkflowGraph, states: &[StepState]) -> Vec<usize> {
    let len = graph.len();
    let mut longest = vec![0.0f64; len];
    let mut next: Vec<Option<usize>> = vec![None; len];

    for &i in graph.topological_order().iter().rev() {
        if !is_remaining(states[i]) {
            continue;
        }
        let mut best: Option<(usize, f64)> = None;
        for &d in graph.dependents_of(i) {
            if !is_remaining(states[d]) {
                continue;
            }
            let better = match best {
                None => true,
                Some((b, w)) => longest[d] > w || (longest[d] == w && d < b),
            };
            if better {
                best = Some((d, longest[d]));
            }
        }
        longest[i] = graph.steps()[i].estimated_duration.as_secs_f64()
            + best.map_or(0.0, |(_, w)| w);
        next[i] = best.map(|(d, _)| d);
    }

    let start = (0..len)
        .filter(|&i| is_remaining(states[i]))
        .fold(None::<usize>, |acc, i| match acc {
            Some(b) if longest[b] >= longest[i] => Some(b),
            _ => Some(i),
        });

    let mut path = Vec::new();
    let mut cursor = start;
    while let Some(i) = cursor {
        path.push(i);
        cursor = next[i];
    }
    path
}
