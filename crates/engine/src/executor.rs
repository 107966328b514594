//! Step execution.
//!
//! `StepExecutor` runs one step on the worker it was leased to:
//! 1. Invokes `Worker::execute` under the step's timeout, catching panics.
//! 2. Retries retryable failures (timeouts and panics included) with
//!    exponential back-off until `max_retries + 1` attempts are used up.
//! 3. Stops at once on `WorkerError::Fatal` or on cancellation.
//! 4. Reports progress to the owning runner over an unbounded channel.
//!
//! The worker lease travels inside the [`StepJob`] and is released when the
//! job is dropped, so capacity is returned whichever way the step ends.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use workers::JsonMap;

use crate::config::RetryPolicy;
use crate::error::StepError;
use crate::registry::WorkerLease;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Progress sent from a running step back to its workflow runner.
#[derive(Debug)]
pub enum ExecutorMessage {
    AttemptStarted {
        step: usize,
        attempt: u32,
        worker_id: String,
    },
    /// Attempt `attempt` failed and another will follow after `delay`.
    Retrying {
        step: usize,
        attempt: u32,
        delay: Duration,
        error: StepError,
    },
    Finished {
        step: usize,
        report: StepReport,
    },
}

/// Final outcome of a step.
#[derive(Debug)]
pub struct StepReport {
    pub worker_id: String,
    pub attempts: u32,
    pub outcome: Result<Value, StepError>,
    /// Wall time from the first attempt to the end, back-off included.
    pub elapsed: Duration,
    /// Duration of the last attempt alone.
    pub last_attempt: Duration,
}

/// Everything needed to run one step.
#[derive(Debug)]
pub struct StepJob {
    pub step: usize,
    pub task_name: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub input: JsonMap,
    pub context: Arc<JsonMap>,
    pub lease: WorkerLease,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Shared by every runner; cheap to clone.
#[derive(Clone)]
pub struct StepExecutor {
    retry: RetryPolicy,
    rng: Arc<Mutex<StdRng>>,
}

enum AttemptOutcome {
    Done(Result<Value, StepError>),
    Cancelled,
}

impl StepExecutor {
    pub fn new(retry: RetryPolicy, rng: StdRng) -> Self {
        Self {
            retry,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    /// Seeded jitter when `seed` is set, entropy otherwise.
    pub fn with_seed(retry: RetryPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::new(retry, rng)
    }

    /// Run `job` to completion and send [`ExecutorMessage::Finished`].
    pub async fn run(&self, job: StepJob, tx: UnboundedSender<ExecutorMessage>) {
        let step = job.step;
        let report = self.execute(&job, &tx).await;
        // Release worker capacity before the runner hears about the result.
        drop(job);
        let _ = tx.send(ExecutorMessage::Finished { step, report });
    }

    /// Attempt loop. Progress messages go to `tx`; the final report is returned.
    pub async fn execute(&self, job: &StepJob, tx: &UnboundedSender<ExecutorMessage>) -> StepReport {
        let worker_id = job.lease.worker_id().to_owned();
        let max_attempts = job.max_retries.saturating_add(1);
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut last_attempt;

        let outcome = loop {
            attempt += 1;
            let _ = tx.send(ExecutorMessage::AttemptStarted {
                step: job.step,
                attempt,
                worker_id: worker_id.clone(),
            });

            let attempt_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => AttemptOutcome::Cancelled,
                r = self.attempt(job) => AttemptOutcome::Done(r),
            };
            last_attempt = attempt_started.elapsed();

            let error = match result {
                AttemptOutcome::Cancelled => break Err(StepError::Cancelled),
                AttemptOutcome::Done(Ok(value)) => break Ok(value),
                AttemptOutcome::Done(Err(e)) => e,
            };

            if !error.is_retryable() {
                warn!("step '{}' failed fatally on attempt {}: {}", job.task_name, attempt, error);
                break Err(error);
            }
            if attempt >= max_attempts {
                warn!("step '{}' exhausted {} attempts: {}", job.task_name, attempt, error);
                break Err(StepError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff(attempt - 1);
            warn!(
                "step '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                job.task_name, attempt, max_attempts, delay, error
            );
            let _ = tx.send(ExecutorMessage::Retrying {
                step: job.step,
                attempt,
                delay,
                error,
            });

            let cancelled = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                break Err(StepError::Cancelled);
            }
        };

        debug!(step = %job.task_name, attempts = attempt, ok = outcome.is_ok(), "step finished");
        StepReport {
            worker_id,
            attempts: attempt,
            outcome,
            elapsed: started.elapsed(),
            last_attempt,
        }
    }

    async fn attempt(&self, job: &StepJob) -> Result<Value, StepError> {
        let worker = Arc::clone(job.lease.worker());
        let call = AssertUnwindSafe(worker.execute(&job.task_name, &job.context, job.input.clone()))
            .catch_unwind();
        match tokio::time::timeout(job.timeout, call).await {
            Err(_) => Err(StepError::Timeout(job.timeout)),
            Ok(Err(payload)) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
            Ok(Ok(result)) => result.map_err(StepError::from),
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.retry.delay_for(retry, &mut *rng)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
