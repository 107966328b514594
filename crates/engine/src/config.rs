//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration file. Durations are expressed in milliseconds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use workers::Capability;

use crate::models::StepDefaults;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential back-off between attempts of a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Scale each delay by a random factor in `[0.8, 1.2]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry):
    /// `base_delay * 2^retry`, capped at `max_delay`, then jittered.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let factor = 2u64.checked_pow(retry).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        let ms = if self.jitter {
            let jitter = rng.gen_range(0.8..=1.2);
            ((ms as f64) * jitter) as u64
        } else {
            ms
        };
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Adaptation
// ---------------------------------------------------------------------------

/// Tuning knobs for the adaptive priority engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Flat boost for steps on the longest remaining dependency chain.
    pub critical_path_boost: f64,
    /// Observed/estimated duration ratio above which a capability counts as overrunning.
    pub overrun_threshold: f64,
    /// Number of recent completions per capability in the moving average.
    pub overrun_window: usize,
    /// Boost per unit of overrun ratio.
    pub overrun_boost_factor: f64,
    /// Ceiling for the overrun boost.
    pub max_overrun_boost: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            critical_path_boost: 10.0,
            overrun_threshold: 1.5,
            overrun_window: 8,
            overrun_boost_factor: 2.0,
            max_overrun_boost: 20.0,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for an [`EngineSupervisor`](crate::EngineSupervisor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission ceiling: workflows running at the same time.
    pub max_concurrent_workflows: usize,
    /// Workflows allowed to wait for admission (CREATED + QUEUED) before
    /// `create_workflow` fails fast with `EngineOverload`.
    pub max_queued_workflows: usize,
    /// Default in-flight step limit per workflow.
    pub max_parallel_steps: usize,
    pub default_step_timeout_ms: u64,
    pub default_max_retries: u32,
    pub default_estimated_duration_ms: u64,
    pub retry: RetryPolicy,
    /// How long in-flight steps get to observe cancellation before they are aborted.
    pub cancel_grace_period_ms: u64,
    /// Workflows kept for status queries. Past it, creating a workflow drops
    /// the oldest finished ones; live workflows are never dropped.
    pub max_retained_workflows: usize,
    /// Re-check interval while ready steps wait for a free worker.
    pub idle_poll_interval_ms: u64,
    pub adaptation: AdaptationConfig,
    /// Closed set of capability tags. Empty accepts every well-formed tag.
    pub capabilities: BTreeSet<Capability>,
    /// When set, every event is appended to `<journal_dir>/<workflow_id>.jsonl`.
    pub journal_dir: Option<PathBuf>,
    /// Seed for retry jitter; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 4,
            max_queued_workflows: 64,
            max_parallel_steps: 4,
            default_step_timeout_ms: 30_000,
            default_max_retries: 3,
            default_estimated_duration_ms: 1_000,
            retry: RetryPolicy::default(),
            cancel_grace_period_ms: 500,
            max_retained_workflows: 1_024,
            idle_poll_interval_ms: 50,
            adaptation: AdaptationConfig::default(),
            capabilities: BTreeSet::new(),
            journal_dir: None,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrent_workflows == 0 {
            return Err(EngineError::Config(
                "max_concurrent_workflows must be at least 1".into(),
            ));
        }
        if self.max_parallel_steps == 0 {
            return Err(EngineError::Config("max_parallel_steps must be at least 1".into()));
        }
        if self.max_retained_workflows == 0 {
            return Err(EngineError::Config("max_retained_workflows must be at least 1".into()));
        }
        if self.default_step_timeout_ms == 0 {
            return Err(EngineError::Config("default_step_timeout_ms must be positive".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(EngineError::Config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.adaptation.overrun_window == 0 {
            return Err(EngineError::Config("adaptation.overrun_window must be at least 1".into()));
        }
        Ok(())
    }

    pub fn step_defaults(&self) -> StepDefaults {
        StepDefaults {
            timeout: Duration::from_millis(self.default_step_timeout_ms),
            max_retries: self.default_max_retries,
            estimated_duration: Duration::from_millis(self.default_estimated_duration_ms),
        }
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(1))
    }
}
