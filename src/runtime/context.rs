use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::dsl::{JobId, Metadata};
use crate::runtime::storage::StateStore;

/// 运行时上下文 (Runtime Context)
/// 每次调用 handler 时构造一份
#[derive(Clone)]
pub struct Context {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub name: String,
    pub metadata: Metadata,
    /// Replacement depth the job was created at.
    pub depth: usize,
    pub store: Arc<dyn StateStore>,
}

impl Context {
    pub fn new(
        run_id: Uuid,
        job_id: JobId,
        name: String,
        metadata: Metadata,
        depth: usize,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            run_id,
            job_id,
            name,
            metadata,
            depth,
            store,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Output already recorded for another job of the same run.
    pub async fn recorded_output(&self, job_id: JobId) -> anyhow::Result<Option<Value>> {
        self.store.get_output(self.run_id, job_id).await
    }
}
