//! `MockWorker`: a test double for `Worker`.
//!
//! Useful in unit and integration tests where a real worker implementation is
//! either unavailable or irrelevant. Every call is recorded, and the number of
//! concurrently running calls is tracked so tests can assert concurrency bounds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Capability, JsonMap, Worker, WorkerError};

/// Behaviour injected into `MockWorker` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Sleep for `delay`, then return `value`.
    Delayed { delay: Duration, value: Value },
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then succeed.
    FailTimes { failures: usize, then: Value },
    /// Never complete.
    Hang,
    /// Block the calling thread for `duration`, ignoring cancellation, then
    /// return `value`. Needs a multi-thread runtime.
    Block { duration: Duration, value: Value },
    /// Panic inside `execute`.
    Panic(String),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub task_name: String,
    pub input: JsonMap,
}

/// A mock worker that records every call it receives and returns a
/// programmer-specified result.
pub struct MockWorker {
    /// Label used in test assertions and merged into the output.
    pub name: String,
    /// What the worker will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All calls seen by this worker (in call order).
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    capabilities: BTreeSet<Capability>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockWorker {
    pub fn new(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            capabilities: BTreeSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that sleeps before succeeding.
    pub fn delayed(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::new(name, MockBehaviour::Delayed { delay, value })
    }

    /// Create a mock that holds its thread for `duration` before succeeding.
    pub fn blocking(name: impl Into<String>, duration: Duration, value: Value) -> Self {
        Self::new(name, MockBehaviour::Block { duration, value })
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before returning `then`.
    pub fn flaky(name: impl Into<String>, failures: usize, then: Value) -> Self {
        Self::new(name, MockBehaviour::FailTimes { failures, then })
    }

    /// Create a mock that never returns.
    pub fn hanging(name: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::Hang)
    }

    /// Create a mock that panics.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::Panic(msg.into()))
    }

    /// Declare the capabilities this mock serves.
    ///
    /// # Panics
    /// On an invalid capability tag; test fixtures only.
    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.capabilities = tags
            .into_iter()
            .map(|t| Capability::new(t.as_ref()).expect("valid capability tag"))
            .collect();
        self
    }

    /// Number of times this worker has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Task names in call order.
    pub fn task_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.task_name.clone())
            .collect()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when the call finishes or its future is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn execute(
        &self,
        task_name: &str,
        _context: &JsonMap,
        input: JsonMap,
    ) -> Result<Value, WorkerError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(MockCall {
                task_name: task_name.to_owned(),
                input,
            });
            calls.len()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.merge(task_name, v)),
            MockBehaviour::Delayed { delay, value } => {
                tokio::time::sleep(*delay).await;
                Ok(self.merge(task_name, value))
            }
            MockBehaviour::FailRetryable(msg) => Err(WorkerError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(WorkerError::Fatal(msg.clone())),
            MockBehaviour::FailTimes { failures, then } => {
                if call_index <= *failures {
                    Err(WorkerError::Retryable(format!("failure {call_index} of {failures}")))
                } else {
                    Ok(self.merge(task_name, then))
                }
            }
            MockBehaviour::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            MockBehaviour::Block { duration, value } => {
                let duration = *duration;
                tokio::task::block_in_place(|| std::thread::sleep(duration));
                Ok(self.merge(task_name, value))
            }
            MockBehaviour::Panic(msg) => panic!("{}", msg),
        }
    }

    fn declared_capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }
}

impl MockWorker {
    // Merge the worker's own fields with the scripted value so tests can
    // trace which worker produced a result.
    fn merge(&self, task_name: &str, value: &Value) -> Value {
        let mut out = json!({ "worker": self.name, "task": task_name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returning_merges_worker_fields() {
        let worker = MockWorker::returning("w1", json!({ "score": 7 }));
        let out = worker
            .execute("analyse", &JsonMap::new(), JsonMap::new())
            .await
            .unwrap();
        assert_eq!(out["worker"], "w1");
        assert_eq!(out["task"], "analyse");
        assert_eq!(out["score"], 7);
        assert_eq!(worker.call_count(), 1);
    }

    #[tokio::test]
    async fn flaky_fails_then_succeeds() {
        let worker = MockWorker::flaky("w", 2, json!({}));
        let ctx = JsonMap::new();
        assert!(worker.execute("t", &ctx, JsonMap::new()).await.is_err());
        assert!(worker.execute("t", &ctx, JsonMap::new()).await.is_err());
        assert!(worker.execute("t", &ctx, JsonMap::new()).await.is_ok());
        assert_eq!(worker.task_names(), vec!["t", "t", "t"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_concurrent_calls() {
        let worker = Arc::new(MockWorker::delayed("w", Duration::from_millis(10), json!({})));
        let a = {
            let w = worker.clone();
            tokio::spawn(async move { w.execute("a", &JsonMap::new(), JsonMap::new()).await })
        };
        let b = {
            let w = worker.clone();
            tokio::spawn(async move { w.execute("b", &JsonMap::new(), JsonMap::new()).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(worker.max_in_flight(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_holds_the_thread_then_succeeds() {
        let worker = MockWorker::blocking("w", Duration::from_millis(30), json!({ "done": true }));
        let started = std::time::Instant::now();
        let out = worker.execute("t", &JsonMap::new(), JsonMap::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(out["done"], true);
    }

    #[test]
    fn capabilities_are_declared() {
        let worker = MockWorker::returning("w", json!({})).with_capabilities(["crm.fetch", "analysis"]);
        let caps: Vec<String> = worker
            .declared_capabilities()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(caps, vec!["analysis", "crm.fetch"]);
    }
}
