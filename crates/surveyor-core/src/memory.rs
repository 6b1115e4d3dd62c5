//! In-memory stores for tests and local development.
//!
//! Functionally equivalent to the Redis/Postgres backends, minus
//! durability. The task manager and watcher tests run against these.

use std::collections::HashMap;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::sync::RwLock;

use crate::status::TaskStatus;
use crate::store::{
    ResultRecord, ResultStats, ResultStore, StoreError, StoreResult, TaskStore,
};
use crate::task::{DEFAULT_EXPIRE_SECONDS, TaskRecord};

/// Task registry backed by a process-local map.
#[derive(Debug)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    expire_seconds: i64,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRE_SECONDS)
    }
}

impl MemoryTaskStore {
    /// Creates a store with the given expiration window.
    pub fn new(expire_seconds: i64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            expire_seconds,
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(
        &self,
        task_id: &str,
        params: serde_json::Value,
    ) -> StoreResult<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(task_id) {
            return Err(StoreError::AlreadyExists(task_id.to_string()));
        }
        let record = TaskRecord::new(task_id, params, self.expire_seconds);
        tasks.insert(task_id.to_string(), record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        Ok(record.apply_status(status, error))
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update_field(
        &self,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> StoreResult<bool> {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        record.set_field(field, value)?;
        Ok(true)
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut records: Vec<TaskRecord> = tasks
            .values()
            .filter(|record| status.is_none_or(|status| record.status == status))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.tasks.write().await.remove(task_id).is_some())
    }

    async fn active_count(&self) -> StoreResult<usize> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().filter(|record| record.status.is_active()).count())
    }

    async fn cleanup_expired(&self) -> StoreResult<usize> {
        let now = Timestamp::now();
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, record| !record.is_expired(now));
        Ok(before - tasks.len())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Result store backed by process-local maps.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, ResultRecord>>,
    crawls: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryResultStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, task_id: &str, survey_data: serde_json::Value) -> StoreResult<()> {
        let record = ResultRecord::completed(task_id, survey_data);
        self.results
            .write()
            .await
            .insert(task_id.to_string(), record);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<ResultRecord>> {
        Ok(self.results.read().await.get(task_id).cloned())
    }

    async fn list(
        &self,
        status: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let results = self.results.read().await;
        let mut records: Vec<ResultRecord> = results
            .values()
            .filter(|record| status.is_none_or(|status| record.status == status))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().skip(skip).take(limit).collect())
    }

    async fn update_status(&self, task_id: &str, status: &str) -> StoreResult<bool> {
        let mut results = self.results.write().await;
        match results.get_mut(task_id) {
            Some(record) => {
                record.status = status.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.results.write().await.remove(task_id).is_some())
    }

    async fn stats(&self) -> StoreResult<ResultStats> {
        let results = self.results.read().await;
        Ok(ResultStats {
            total_surveys: results.len() as u64,
            completed_surveys: results
                .values()
                .filter(|record| record.is_completed())
                .count() as u64,
            latest_created_at: results.values().map(|record| record.created_at).max(),
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn save_crawl_results(
        &self,
        task_id: &str,
        data: serde_json::Value,
    ) -> StoreResult<()> {
        self.crawls.write().await.insert(task_id.to_string(), data);
        Ok(())
    }

    async fn get_crawl_results(
        &self,
        task_id: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.crawls.read().await.get(task_id).cloned())
    }

    async fn delete_crawl_results(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.crawls.write().await.remove(task_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn create_is_single_flight() {
        let store = Arc::new(MemoryTaskStore::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create("same-id", serde_json::Value::Null).await
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn create_delete_get_round_trip() {
        let store = MemoryTaskStore::default();
        store.create("t", serde_json::json!({"a": 1})).await.unwrap();
        assert!(store.get("t").await.unwrap().is_some());
        assert!(store.delete("t").await.unwrap());
        assert!(store.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_monotonicity_holds_through_the_store() {
        let store = MemoryTaskStore::default();
        store.create("t", serde_json::Value::Null).await.unwrap();
        assert!(
            store
                .update_status("t", TaskStatus::Completed, None)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_status("t", TaskStatus::Processing, None)
                .await
                .unwrap()
        );
        let record = store.get("t").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = MemoryTaskStore::default();
        for index in 0..3 {
            store
                .create(&format!("t{index}"), serde_json::Value::Null)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store
            .update_status("t1", TaskStatus::Failed, None)
            .await
            .unwrap();

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at >= all[1].created_at);

        let failed = store.list(Some(TaskStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "t1");

        assert_eq!(store.active_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_records() {
        let store = MemoryTaskStore::new(-1);
        store.create("old", serde_json::Value::Null).await.unwrap();
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn result_store_upserts_by_task_id() {
        let store = MemoryResultStore::new();
        store
            .save("t", serde_json::json!({"title": "one", "papers": []}))
            .await
            .unwrap();
        store
            .save("t", serde_json::json!({"title": "two", "papers": []}))
            .await
            .unwrap();

        let record = store.get("t").await.unwrap().unwrap();
        assert_eq!(record.title, "two");
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_surveys, 1);
        assert_eq!(stats.completed_surveys, 1);
    }

    #[tokio::test]
    async fn crawl_results_round_trip() {
        let store = MemoryResultStore::new();
        store
            .save_crawl_results("t", serde_json::json!({"papers": [1]}))
            .await
            .unwrap();
        assert!(store.get_crawl_results("t").await.unwrap().is_some());
        assert!(store.delete_crawl_results("t").await.unwrap());
        assert!(store.get_crawl_results("t").await.unwrap().is_none());
    }
}
