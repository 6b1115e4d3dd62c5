//! The Redis-backed task registry.

use std::time::Duration;

use async_trait::async_trait;
use clap::Args;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};
use serde::{Deserialize, Serialize};
use surveyor_core::store::{StoreError, StoreResult, TaskStore};
use surveyor_core::task::DEFAULT_EXPIRE_SECONDS;
use surveyor_core::{TaskRecord, TaskStatus};

use crate::TRACING_TARGET;
use crate::codec::{
    self, FIELD_END_TIME, FIELD_ERROR, FIELD_EXECUTION_SECONDS, FIELD_ID, FIELD_START_TIME,
    FIELD_STATUS, FIELD_UPDATED_AT,
};

const TRANSPORT_ATTEMPTS: usize = 3;
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(200);

/// Redis connection configuration for the task registry.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct RedisConfig {
    /// Redis connection URL.
    #[arg(long = "redis-url", env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/0")]
    pub redis_url: String,

    /// Prefix for task keys.
    #[arg(long = "redis-key-prefix", env = "REDIS_KEY_PREFIX", default_value = "survey_task:")]
    pub redis_key_prefix: String,

    /// Task expiration window in seconds; doubles as the key TTL.
    #[arg(
        long = "redis-expire-seconds",
        env = "REDIS_EXPIRE_SECONDS",
        default_value_t = DEFAULT_EXPIRE_SECONDS
    )]
    pub redis_expire_seconds: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            redis_key_prefix: "survey_task:".to_string(),
            redis_expire_seconds: DEFAULT_EXPIRE_SECONDS,
        }
    }
}

/// Task registry backed by Redis hashes with per-key TTL.
///
/// The connection manager multiplexes one connection and reconnects on
/// failure; clones share it, so the store is cheap to pass to workers.
#[derive(Clone)]
pub struct RedisTaskStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

fn is_transient(err: &RedisError) -> bool {
    err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(err.kind(), ErrorKind::IoError | ErrorKind::TryAgain)
}

fn backend(err: RedisError) -> StoreError {
    if is_transient(&err) {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::backend(err)
    }
}

impl RedisTaskStore {
    /// Connects to Redis and verifies the connection with a ping.
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|err| StoreError::backend(err))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        let store = Self { connection, config };
        store.health_check().await?;
        tracing::info!(
            target: TRACING_TARGET,
            key_prefix = %store.config.redis_key_prefix,
            expire_seconds = store.config.redis_expire_seconds,
            "Redis task store connected"
        );
        Ok(store)
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}{}", self.config.redis_key_prefix, task_id)
    }

    /// Fetches and decodes a record; an empty hash means the key expired
    /// or never existed.
    async fn fetch(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let key = self.task_key(task_id);
        let map: std::collections::HashMap<String, String> = self
            .with_retry(|mut conn| {
                let key = key.clone();
                async move { conn.hgetall(&key).await }
            })
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        codec::decode_record(map).map(Some)
    }

    /// Writes hash fields and refreshes the key TTL.
    async fn write_fields(&self, task_id: &str, fields: Vec<(&'static str, String)>) -> StoreResult<()> {
        let key = self.task_key(task_id);
        let ttl = self.config.redis_expire_seconds;
        self.with_retry(|mut conn| {
            let key = key.clone();
            let fields = fields.clone();
            async move {
                conn.hset_multiple::<_, _, _, ()>(&key, &fields).await?;
                conn.expire::<_, bool>(&key, ttl).await?;
                Ok(())
            }
        })
        .await
    }

    /// Runs an operation with bounded retries on transient errors.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> StoreResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(self.connection.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < TRANSPORT_ATTEMPTS => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        attempt,
                        error = %err,
                        "Transient Redis error, retrying"
                    );
                    tokio::time::sleep(TRANSPORT_BACKOFF * attempt as u32).await;
                }
                Err(err) => return Err(backend(err)),
            }
        }
    }

    /// Scans all task keys under the configured prefix.
    async fn scan_task_keys(&self) -> StoreResult<Vec<String>> {
        let pattern = format!("{}*", self.config.redis_key_prefix);
        self.with_retry(|mut conn| {
            let pattern = pattern.clone();
            async move {
                let mut keys = Vec::new();
                let mut iter = conn.scan_match::<_, String>(&pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok(keys)
            }
        })
        .await
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn create(
        &self,
        task_id: &str,
        params: serde_json::Value,
    ) -> StoreResult<TaskRecord> {
        let record = TaskRecord::new(task_id, params, self.config.redis_expire_seconds);
        let key = self.task_key(task_id);

        // HSETNX on the id field is the single-flight gate: exactly one
        // concurrent creator observes `true`.
        let created: bool = self
            .with_retry(|mut conn| {
                let key = key.clone();
                let id = record.id.clone();
                async move { conn.hset_nx(&key, FIELD_ID, id).await }
            })
            .await?;
        if !created {
            return Err(StoreError::AlreadyExists(task_id.to_string()));
        }

        self.write_fields(task_id, codec::encode_record(&record)?).await?;
        tracing::info!(
            target: TRACING_TARGET,
            task_id = %task_id,
            "Task created"
        );
        Ok(record)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let Some(mut record) = self.fetch(task_id).await? else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        if !record.apply_status(status, error) {
            return Ok(false);
        }

        // Only lifecycle fields are written so concurrent field updates
        // keep their last-writer-wins semantics.
        let mut fields = vec![
            (FIELD_STATUS, record.status.to_string()),
            (FIELD_UPDATED_AT, record.updated_at.to_string()),
        ];
        if let Some(error) = &record.error {
            fields.push((FIELD_ERROR, error.clone()));
        }
        if let Some(start) = record.start_time {
            fields.push((FIELD_START_TIME, start.to_string()));
        }
        if let Some(end) = record.end_time {
            fields.push((FIELD_END_TIME, end.to_string()));
        }
        if let Some(seconds) = record.execution_seconds {
            fields.push((FIELD_EXECUTION_SECONDS, seconds.to_string()));
        }
        self.write_fields(task_id, fields).await?;

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %task_id,
            status = %record.status,
            "Task status updated"
        );
        Ok(true)
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        self.fetch(task_id).await
    }

    async fn update_field(
        &self,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> StoreResult<bool> {
        let Some(mut record) = self.fetch(task_id).await? else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        record.set_field(field, value)?;

        let encoded = codec::encode_field(&record, field)?;
        let fields = vec![encoded, (FIELD_UPDATED_AT, record.updated_at.to_string())];
        self.write_fields(task_id, fields).await?;
        Ok(true)
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> StoreResult<Vec<TaskRecord>> {
        let keys = self.scan_task_keys().await?;
        let mut records = Vec::new();
        for key in keys {
            let map: std::collections::HashMap<String, String> = self
                .with_retry(|mut conn| {
                    let key = key.clone();
                    async move { conn.hgetall(&key).await }
                })
                .await?;
            if map.is_empty() {
                continue;
            }
            match codec::decode_record(map) {
                Ok(record) => {
                    if status.is_none_or(|status| record.status == status) {
                        records.push(record);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        key = %key,
                        error = %err,
                        "Skipping undecodable task hash"
                    );
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        let key = self.task_key(task_id);
        let deleted: i64 = self
            .with_retry(|mut conn| {
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn active_count(&self) -> StoreResult<usize> {
        let records = self.list(None, usize::MAX).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.status.is_active())
            .count())
    }

    async fn cleanup_expired(&self) -> StoreResult<usize> {
        // Redis evicts expired keys on its own; nothing to sweep here.
        tracing::debug!(
            target: TRACING_TARGET,
            "Expiration handled by key TTL, nothing to clean"
        );
        Ok(0)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.with_retry(|mut conn| async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_keys_use_the_prefix() {
        let config = RedisConfig::default();
        assert_eq!(config.redis_key_prefix, "survey_task:");
        assert_eq!(config.redis_expire_seconds, DEFAULT_EXPIRE_SECONDS);
    }
}
