//! `TaskStore` / `ResultStore` implementations over the Postgres client.
//!
//! Every operation checks its own connection out of the pool, which is
//! the per-operation scope making the stores callable from any worker
//! task. Transient failures retry up to three times with a short linear
//! backoff before surfacing to the caller.

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use surveyor_core::store::{
    ResultRecord, ResultStats, ResultStore, StoreError, StoreResult, TaskStore,
};
use surveyor_core::{TaskRecord, TaskStatus};

use crate::TRACING_TARGET_QUERY;
use crate::client::PgClient;
use crate::error::PgError;
use crate::model::{CrawlResultRow, SurveyRow, TaskRow, UpdateTaskRow};
use crate::query::{SurveyRepository, TaskRepository};

const TRANSPORT_ATTEMPTS: usize = 3;
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(200);

/// Task registry backed by the `tasks` table.
#[derive(Clone)]
pub struct PgTaskStore {
    client: PgClient,
    expire_seconds: i64,
}

impl PgTaskStore {
    /// Creates a store with the given expiration window.
    pub fn new(client: PgClient, expire_seconds: i64) -> Self {
        Self {
            client,
            expire_seconds,
        }
    }
}

/// Runs an operation with bounded retries on transient transport errors.
async fn with_transport_retry<T, F, Fut>(operation: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, PgError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < TRANSPORT_ATTEMPTS => {
                tracing::warn!(
                    target: TRACING_TARGET_QUERY,
                    attempt,
                    error = %err,
                    "Transient database error, retrying"
                );
                tokio::time::sleep(TRANSPORT_BACKOFF * attempt as u32).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(
        &self,
        task_id: &str,
        params: serde_json::Value,
    ) -> StoreResult<TaskRecord> {
        let record = TaskRecord::new(task_id, params, self.expire_seconds);
        let row = TaskRow::from_record(&record);

        let result = with_transport_retry(|| {
            let row = row.clone();
            async move {
                let mut conn = self.client.get_connection().await?;
                conn.insert_task(row).await
            }
        })
        .await;

        match result {
            Ok(row) => row.into_record(),
            // The unique violation on the primary key is the single-flight
            // signal, not a transport failure.
            Err(StoreError::Backend(err)) => match err.downcast_ref::<PgError>() {
                Some(PgError::Query(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ))) => Err(StoreError::AlreadyExists(task_id.to_string())),
                _ => Err(StoreError::Backend(err)),
            },
            Err(err) => Err(err),
        }
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> StoreResult<bool> {
        // Read-modify-write through the lifecycle rules; the guarded
        // update keeps a concurrent terminal writer authoritative.
        let Some(current) = self.get(task_id).await? else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        let mut record = current;
        if !record.apply_status(status, error) {
            return Ok(false);
        }

        let changes = UpdateTaskRow {
            status: Some(record.status.to_string()),
            error: Some(record.error.clone()),
            updated_at: Some(record.updated_at.into()),
            start_time: Some(record.start_time.map(Into::into)),
            end_time: Some(record.end_time.map(Into::into)),
            execution_seconds: Some(record.execution_seconds),
            ..UpdateTaskRow::default()
        };

        with_transport_retry(|| {
            let changes = changes.clone();
            async move {
                let mut conn = self.client.get_connection().await?;
                conn.update_task(task_id, changes, true).await
            }
        })
        .await
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        let row = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.find_task(task_id).await
        })
        .await?;
        row.map(TaskRow::into_record).transpose()
    }

    async fn update_field(
        &self,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> StoreResult<bool> {
        let Some(mut record) = self.get(task_id).await? else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        record.set_field(field, value)?;

        let changes = UpdateTaskRow {
            params: Some(record.params.clone()),
            original_topic: Some(record.original_topic.clone()),
            expected_result_key: Some(record.expected_result_key.clone()),
            user_id: Some(record.user_id.clone()),
            error: Some(record.error.clone()),
            updated_at: Some(record.updated_at.into()),
            ..UpdateTaskRow::default()
        };

        with_transport_retry(|| {
            let changes = changes.clone();
            async move {
                let mut conn = self.client.get_connection().await?;
                conn.update_task(task_id, changes, false).await
            }
        })
        .await
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> StoreResult<Vec<TaskRecord>> {
        let rows = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.list_tasks(status.map(|status| status.to_string()), limit as i64)
                .await
        })
        .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.delete_task(task_id).await
        })
        .await
    }

    async fn active_count(&self) -> StoreResult<usize> {
        let count = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.count_active_tasks().await
        })
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn cleanup_expired(&self) -> StoreResult<usize> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.delete_expired_tasks(Timestamp::now().into()).await
        })
        .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.client.health_check().await.map_err(StoreError::from)
    }
}

/// Result store backed by the `surveys` and `crawl_results` tables.
#[derive(Clone)]
pub struct PgResultStore {
    client: PgClient,
}

impl PgResultStore {
    /// Creates a result store over the shared client.
    pub fn new(client: PgClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn save(&self, task_id: &str, survey_data: serde_json::Value) -> StoreResult<()> {
        let record = ResultRecord::completed(task_id, survey_data);
        let row = SurveyRow::from_record(&record);
        with_transport_retry(|| {
            let row = row.clone();
            async move {
                let mut conn = self.client.get_connection().await?;
                conn.upsert_survey(row).await
            }
        })
        .await
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<ResultRecord>> {
        let row = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.find_survey(task_id).await
        })
        .await?;
        Ok(row.map(SurveyRow::into_record))
    }

    async fn list(
        &self,
        status: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> StoreResult<Vec<ResultRecord>> {
        let rows = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.list_surveys(
                status.map(str::to_string),
                limit as i64,
                skip as i64,
            )
            .await
        })
        .await?;
        Ok(rows.into_iter().map(SurveyRow::into_record).collect())
    }

    async fn update_status(&self, task_id: &str, status: &str) -> StoreResult<bool> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.update_survey_status(task_id, status.to_string()).await
        })
        .await
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.delete_survey(task_id).await
        })
        .await
    }

    async fn stats(&self) -> StoreResult<ResultStats> {
        let (total, completed, latest) = with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            let (total, completed) = conn.count_surveys().await?;
            let latest = conn.latest_survey_at().await?;
            Ok((total, completed, latest))
        })
        .await?;
        Ok(ResultStats {
            total_surveys: total.max(0) as u64,
            completed_surveys: completed.max(0) as u64,
            latest_created_at: latest.map(Into::into),
        })
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.client.health_check().await.map_err(StoreError::from)
    }

    async fn save_crawl_results(
        &self,
        task_id: &str,
        data: serde_json::Value,
    ) -> StoreResult<()> {
        let row = CrawlResultRow {
            task_id: task_id.to_string(),
            data,
            created_at: Timestamp::now().into(),
        };
        with_transport_retry(|| {
            let row = row.clone();
            async move {
                let mut conn = self.client.get_connection().await?;
                conn.upsert_crawl_results(row).await
            }
        })
        .await
    }

    async fn get_crawl_results(
        &self,
        task_id: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.find_crawl_results(task_id).await
        })
        .await
    }

    async fn delete_crawl_results(&self, task_id: &str) -> StoreResult<bool> {
        with_transport_retry(|| async {
            let mut conn = self.client.get_connection().await?;
            conn.delete_crawl_results(task_id).await
        })
        .await
    }
}
