//! `EchoWorker`: a built-in worker that echoes its input back.
//!
//! Used by the CLI `run` / `serve` commands so workflows can be exercised
//! end-to-end without any external system. Two input keys change its
//! behaviour:
//! - `sleep_ms`: simulate work by sleeping before answering.
//! - `fail`: return a retryable error with the given message.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Capability, JsonMap, Worker, WorkerError};

pub struct EchoWorker {
    id: String,
    capabilities: BTreeSet<Capability>,
}

impl EchoWorker {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(
        &self,
        task_name: &str,
        context: &JsonMap,
        input: JsonMap,
    ) -> Result<Value, WorkerError> {
        debug!(worker_id = %self.id, task = task_name, "echo worker executing");

        if let Some(ms) = input.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if let Some(msg) = input.get("fail").and_then(Value::as_str) {
            return Err(WorkerError::Retryable(msg.to_owned()));
        }

        Ok(json!({
            "worker": self.id,
            "task": task_name,
            "context_keys": context.keys().collect::<Vec<_>>(),
            "input": input,
        }))
    }

    fn declared_capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_input_and_context_keys() {
        let worker = EchoWorker::new("echo-1", [Capability::new("general").unwrap()]);
        let mut ctx = JsonMap::new();
        ctx.insert("account".into(), json!("acme"));
        let mut input = JsonMap::new();
        input.insert("x".into(), json!(1));

        let out = worker.execute("summarise", &ctx, input).await.unwrap();
        assert_eq!(out["worker"], "echo-1");
        assert_eq!(out["input"]["x"], 1);
        assert_eq!(out["context_keys"], json!(["account"]));
    }

    #[tokio::test]
    async fn fail_key_produces_retryable_error() {
        let worker = EchoWorker::new("echo-1", []);
        let mut input = JsonMap::new();
        input.insert("fail".into(), json!("boom"));
        let err = worker.execute("t", &JsonMap::new(), input).await.unwrap_err();
        assert_eq!(err, WorkerError::Retryable("boom".into()));
    }
}
