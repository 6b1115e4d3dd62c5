//! Store contracts shared by the Redis and Postgres backends.

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::TaskStatus;
use crate::task::TaskRecord;

/// Type-erased backend error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Specialized [`Result`] type for store operations.
pub type StoreResult<T, E = StoreError> = Result<T, E>;

/// Errors surfaced by task and result stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Create collided with an existing record (single-flight guarantee).
    #[error("task {0} already exists")]
    AlreadyExists(String),

    /// The addressed record does not exist.
    #[error("task {0} not found")]
    NotFound(String),

    /// `update_field` addressed a field the record does not have.
    #[error("unknown task field: {0}")]
    UnknownField(String),

    /// A status string from the API or storage did not parse.
    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    /// The backing store rejected or lost the operation.
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),

    /// The backing store is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored blob failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Wraps a backend error.
    pub fn backend(error: impl Into<BoxError>) -> Self {
        StoreError::Backend(error.into())
    }

    /// Returns whether a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Unavailable(_))
    }
}

/// The durable task registry.
///
/// Implementations must guarantee single-flight on `create` and serialize
/// concurrent updates to the same id (last field write wins per field),
/// and must be callable from any worker task concurrently.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a pending record. Fails with [`StoreError::AlreadyExists`]
    /// when the id is taken.
    async fn create(&self, task_id: &str, params: serde_json::Value)
    -> StoreResult<TaskRecord>;

    /// Applies a status transition. Returns whether it was applied;
    /// transitions out of terminal states are ignored, not errors.
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> StoreResult<bool>;

    /// Fetches the full record.
    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>>;

    /// Sets one named field. Unknown names are rejected.
    async fn update_field(
        &self,
        task_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> StoreResult<bool>;

    /// Lists records, newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> StoreResult<Vec<TaskRecord>>;

    /// Deletes the record. Returns whether it existed.
    async fn delete(&self, task_id: &str) -> StoreResult<bool>;

    /// Number of records in any non-terminal status.
    async fn active_count(&self) -> StoreResult<usize>;

    /// Removes records past their expiration; returns the count removed.
    async fn cleanup_expired(&self) -> StoreResult<usize>;

    /// Round-trip to the backing store.
    async fn health_check(&self) -> StoreResult<()>;
}

/// Derived statistics stored alongside a result record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Share of references actually cited.
    pub cite_ratio: f64,
    /// Length of the rendered survey body, in characters.
    pub content_length: u64,
    /// Number of reference papers.
    pub references_count: u64,
}

/// The durable per-task output entry in the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Task the result belongs to. Unique per record.
    pub task_id: String,
    /// Survey title.
    pub title: String,
    /// Serialized survey payload.
    pub survey_data: serde_json::Value,
    /// Persistence instant.
    pub created_at: Timestamp,
    /// Result status label; `"completed"` once the pipeline saved it.
    pub status: String,
    /// Derived statistics.
    pub metadata: ResultMetadata,
}

impl ResultRecord {
    /// Result status label written by the pipeline save stage.
    pub const STATUS_COMPLETED: &'static str = "completed";

    /// Builds a completed record, deriving metadata from the payload.
    pub fn completed(task_id: impl Into<String>, mut survey_data: serde_json::Value) -> Self {
        let task_id = task_id.into();
        // The stored blob always carries its task id, so either store can
        // be read back on its own.
        if let Some(object) = survey_data.as_object_mut() {
            object.insert("task_id".to_string(), serde_json::json!(task_id));
        }
        let title = survey_data
            .get("title")
            .and_then(|title| title.as_str())
            .unwrap_or_default()
            .to_string();
        let metadata = ResultMetadata {
            cite_ratio: survey_data
                .get("cite_ratio")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or_default(),
            content_length: survey_data
                .get("content")
                .and_then(|content| content.as_str())
                .map(|content| content.len() as u64)
                .unwrap_or_default(),
            references_count: survey_data
                .get("papers")
                .and_then(|papers| papers.as_array())
                .map(|papers| papers.len() as u64)
                .unwrap_or_default(),
        };
        Self {
            task_id,
            title,
            survey_data,
            created_at: Timestamp::now(),
            status: Self::STATUS_COMPLETED.to_string(),
            metadata,
        }
    }

    /// Returns whether the pipeline finished this result.
    pub fn is_completed(&self) -> bool {
        self.status == Self::STATUS_COMPLETED
    }
}

/// Aggregate statistics over the result store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStats {
    /// Total result records.
    pub total_surveys: u64,
    /// Records with completed status.
    pub completed_surveys: u64,
    /// Creation instant of the newest record.
    pub latest_created_at: Option<Timestamp>,
}

/// The durable result store: at most one record per task id, replaced
/// wholesale on save (upsert). It doubles as the crawl-result handoff
/// between the preparation worker and the encode stage.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Upserts the result record for a task.
    async fn save(&self, task_id: &str, survey_data: serde_json::Value) -> StoreResult<()>;

    /// Fetches the result record for a task.
    async fn get(&self, task_id: &str) -> StoreResult<Option<ResultRecord>>;

    /// Lists records newest-first with optional status filter and offset.
    async fn list(
        &self,
        status: Option<&str>,
        limit: usize,
        skip: usize,
    ) -> StoreResult<Vec<ResultRecord>>;

    /// Updates the status label of a record.
    async fn update_status(&self, task_id: &str, status: &str) -> StoreResult<bool>;

    /// Deletes the record. Returns whether it existed.
    async fn delete(&self, task_id: &str) -> StoreResult<bool>;

    /// Aggregate statistics.
    async fn stats(&self) -> StoreResult<ResultStats>;

    /// Round-trip to the backing store.
    async fn health_check(&self) -> StoreResult<()>;

    /// Stores crawl results for the encode stage to pick up.
    async fn save_crawl_results(
        &self,
        task_id: &str,
        data: serde_json::Value,
    ) -> StoreResult<()>;

    /// Fetches crawl results for a task.
    async fn get_crawl_results(&self, task_id: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Removes crawl results once a task reaches a terminal state.
    async fn delete_crawl_results(&self, task_id: &str) -> StoreResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_record_derives_metadata() {
        let record = ResultRecord::completed(
            "task-1",
            serde_json::json!({
                "title": "Survey",
                "cite_ratio": 0.75,
                "content": "full text",
                "papers": [{}, {}, {}],
            }),
        );
        assert!(record.is_completed());
        assert_eq!(record.title, "Survey");
        assert_eq!(record.metadata.references_count, 3);
        assert_eq!(record.metadata.content_length, 9);
        assert!((record.metadata.cite_ratio - 0.75).abs() < f64::EPSILON);
        assert_eq!(record.survey_data["task_id"], "task-1");
    }

    #[test]
    fn transient_errors_are_the_backend_kinds() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::UnknownField("y".into()).is_transient());
    }
}
