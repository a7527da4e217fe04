use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use uuid::Uuid;

use crate::dsl::JobId;
use crate::error::JobFailure;
use crate::runtime::blueprint::Submission;
use crate::runtime::storage::{StateStore, TaskQueue};

pub struct RedisTaskQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisTaskQueue {
    pub fn new(client: redis::Client, queue_key: String) -> Self {
        Self { client, queue_key }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, submission: Submission) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&submission)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Submission>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 1s poll window keeps the worker loop responsive to shutdown
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        match result {
            Some((_, json)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

pub struct RedisStateStore {
    client: redis::Client,
}

impl RedisStateStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn output_key(&self, run_id: Uuid) -> String {
        format!("mofflow:run:{}:outputs", run_id)
    }

    fn failure_key(&self, run_id: Uuid) -> String {
        format!("mofflow:run:{}:failures", run_id)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn put_output(&self, run_id: Uuid, job_id: JobId, value: &Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let val_str = serde_json::to_string(value)?;
        let _: () = conn
            .hset(self.output_key(run_id), job_id.to_string(), val_str)
            .await?;
        Ok(())
    }

    async fn get_output(&self, run_id: Uuid, job_id: JobId) -> Result<Option<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let val_str: Option<String> = conn
            .hget(self.output_key(run_id), job_id.to_string())
            .await?;

        match val_str {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn outputs(&self, run_id: Uuid) -> Result<HashMap<JobId, Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw_map: HashMap<String, String> = conn.hgetall(self.output_key(run_id)).await?;

        let mut result = HashMap::new();
        for (k, v_str) in raw_map {
            let id = Uuid::parse_str(&k)?;
            result.insert(id, serde_json::from_str(&v_str)?);
        }
        Ok(result)
    }

    async fn put_failure(&self, run_id: Uuid, failure: &JobFailure) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(failure)?;
        let _: () = conn.rpush(self.failure_key(run_id), serialized).await?;
        Ok(())
    }

    async fn failures(&self, run_id: Uuid) -> Result<Vec<JobFailure>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Vec<String> = conn.lrange(self.failure_key(run_id), 0, -1).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(anyhow::Error::from))
            .collect()
    }
}
