use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::dsl::JobId;
use crate::error::JobFailure;
use crate::runtime::blueprint::Submission;

// --- Interfaces ---

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, submission: Submission) -> Result<()>;
    /// `None` when nothing arrived within the backend's poll window.
    async fn pop(&self) -> Result<Option<Submission>>;
}

/// Resolved outputs and failures of each run, keyed by run id.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_output(&self, run_id: Uuid, job_id: JobId, value: &Value) -> Result<()>;
    async fn get_output(&self, run_id: Uuid, job_id: JobId) -> Result<Option<Value>>;
    /// All outputs of a run. Might be expensive in remote implementations.
    async fn outputs(&self, run_id: Uuid) -> Result<HashMap<JobId, Value>>;
    async fn put_failure(&self, run_id: Uuid, failure: &JobFailure) -> Result<()>;
    async fn failures(&self, run_id: Uuid) -> Result<Vec<JobFailure>>;
}

// --- In-Memory Implementations ---

const POLL_WINDOW: Duration = Duration::from_millis(200);

pub struct InMemoryTaskQueue {
    sender: mpsc::Sender<Submission>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Submission>>,
}

impl InMemoryTaskQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: tx,
            receiver: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, submission: Submission) -> Result<()> {
        self.sender
            .send(submission)
            .await
            .map_err(|e| anyhow::anyhow!("Submission channel closed: {}", e))
    }

    async fn pop(&self) -> Result<Option<Submission>> {
        let mut rx = self.receiver.lock().await;
        match tokio::time::timeout(POLL_WINDOW, rx.recv()).await {
            Ok(submission) => Ok(submission),
            Err(_) => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStateStore {
    // Map<RunId, Map<JobId, Value>>
    outputs: DashMap<Uuid, DashMap<JobId, Value>>,
    failures: DashMap<Uuid, Vec<JobFailure>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_output(&self, run_id: Uuid, job_id: JobId, value: &Value) -> Result<()> {
        let run = self.outputs.entry(run_id).or_default();
        run.insert(job_id, value.clone());
        Ok(())
    }

    async fn get_output(&self, run_id: Uuid, job_id: JobId) -> Result<Option<Value>> {
        Ok(self
            .outputs
            .get(&run_id)
            .and_then(|run| run.get(&job_id).map(|v| v.value().clone())))
    }

    async fn outputs(&self, run_id: Uuid) -> Result<HashMap<JobId, Value>> {
        let mut map = HashMap::new();
        if let Some(run) = self.outputs.get(&run_id) {
            for item in run.iter() {
                map.insert(*item.key(), item.value().clone());
            }
        }
        Ok(map)
    }

    async fn put_failure(&self, run_id: Uuid, failure: &JobFailure) -> Result<()> {
        self.failures.entry(run_id).or_default().push(failure.clone());
        Ok(())
    }

    async fn failures(&self, run_id: Uuid) -> Result<Vec<JobFailure>> {
        Ok(self
            .failures
            .get(&run_id)
            .map(|f| f.value().clone())
            .unwrap_or_default())
    }
}
