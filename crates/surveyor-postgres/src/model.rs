//! Row models for the surveyor tables.

use std::str::FromStr;

use diesel::prelude::*;
use jiff_diesel::Timestamp;
use surveyor_core::store::{ResultMetadata, ResultRecord, StoreError};
use surveyor_core::{TaskRecord, TaskStatus};

use crate::schema::{crawl_results, surveys, tasks};

/// Task row as stored in the `tasks` table.
///
/// The status column holds the lowercase status label; it is normalized
/// back into [`TaskStatus`] on read so unknown values surface as errors
/// instead of phantom states.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskRow {
    /// Unique task identifier.
    pub task_id: String,
    /// Lowercase status label.
    pub status: String,
    /// Opaque submission parameters.
    pub params: serde_json::Value,
    /// Topic as originally submitted.
    pub original_topic: Option<String>,
    /// Unique key under which the result will be stored.
    pub expected_result_key: Option<String>,
    /// Submitting user.
    pub user_id: Option<String>,
    /// Last error message.
    pub error: Option<String>,
    /// Creation instant.
    pub created_at: Timestamp,
    /// Last mutation instant.
    pub updated_at: Timestamp,
    /// Instant preparation/processing started.
    pub start_time: Option<Timestamp>,
    /// Instant a terminal status was reached.
    pub end_time: Option<Timestamp>,
    /// Wall-clock seconds between start and end.
    pub execution_seconds: Option<f64>,
    /// Expiration instant.
    pub expire_at: Timestamp,
}

impl TaskRow {
    /// Converts a lifecycle record into its row form.
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id.clone(),
            status: record.status.to_string(),
            params: record.params.clone(),
            original_topic: record.original_topic.clone(),
            expected_result_key: record.expected_result_key.clone(),
            user_id: record.user_id.clone(),
            error: record.error.clone(),
            created_at: record.created_at.into(),
            updated_at: record.updated_at.into(),
            start_time: record.start_time.map(Into::into),
            end_time: record.end_time.map(Into::into),
            execution_seconds: record.execution_seconds,
            expire_at: record.expire_at.into(),
        }
    }

    /// Converts the row back into a lifecycle record.
    pub fn into_record(self) -> Result<TaskRecord, StoreError> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|_| StoreError::InvalidStatus(self.status.clone()))?;
        Ok(TaskRecord {
            id: self.task_id,
            status,
            params: self.params,
            original_topic: self.original_topic,
            expected_result_key: self.expected_result_key,
            user_id: self.user_id,
            error: self.error,
            created_at: self.created_at.into(),
            updated_at: self.updated_at.into(),
            start_time: self.start_time.map(Into::into),
            end_time: self.end_time.map(Into::into),
            execution_seconds: self.execution_seconds,
            expire_at: self.expire_at.into(),
        })
    }
}

/// Changeset for task updates; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UpdateTaskRow {
    /// New status label.
    pub status: Option<String>,
    /// New parameters blob.
    pub params: Option<serde_json::Value>,
    /// New topic.
    pub original_topic: Option<Option<String>>,
    /// New result key.
    pub expected_result_key: Option<Option<String>>,
    /// New user id.
    pub user_id: Option<Option<String>>,
    /// New error message.
    pub error: Option<Option<String>>,
    /// New update instant.
    pub updated_at: Option<Timestamp>,
    /// New start instant.
    pub start_time: Option<Option<Timestamp>>,
    /// New end instant.
    pub end_time: Option<Option<Timestamp>>,
    /// New execution time.
    pub execution_seconds: Option<Option<f64>>,
}

/// Survey result row as stored in the `surveys` table.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = surveys)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SurveyRow {
    /// Task the result belongs to.
    pub task_id: String,
    /// Survey title.
    pub title: String,
    /// Serialized survey payload.
    pub survey_data: serde_json::Value,
    /// Persistence instant.
    pub created_at: Timestamp,
    /// Result status label.
    pub status: String,
    /// Share of references actually cited.
    pub cite_ratio: f64,
    /// Length of the rendered survey body.
    pub content_length: i64,
    /// Number of reference papers.
    pub references_count: i64,
}

impl SurveyRow {
    /// Converts a result record into its row form.
    pub fn from_record(record: &ResultRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            title: record.title.clone(),
            survey_data: record.survey_data.clone(),
            created_at: record.created_at.into(),
            status: record.status.clone(),
            cite_ratio: record.metadata.cite_ratio,
            content_length: record.metadata.content_length as i64,
            references_count: record.metadata.references_count as i64,
        }
    }

    /// Converts the row back into a result record.
    pub fn into_record(self) -> ResultRecord {
        ResultRecord {
            task_id: self.task_id,
            title: self.title,
            survey_data: self.survey_data,
            created_at: self.created_at.into(),
            status: self.status,
            metadata: ResultMetadata {
                cite_ratio: self.cite_ratio,
                content_length: self.content_length.max(0) as u64,
                references_count: self.references_count.max(0) as u64,
            },
        }
    }
}

/// Crawl result row, the handoff between preparation and encode.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = crawl_results)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CrawlResultRow {
    /// Task the crawl belongs to.
    pub task_id: String,
    /// Crawled payload.
    pub data: serde_json::Value,
    /// Persistence instant.
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_row_round_trips_through_record() {
        let mut record = TaskRecord::new("t", serde_json::json!({"topic": "x"}), 60);
        record.apply_status(TaskStatus::Processing, None);
        record.original_topic = Some("x".into());

        let row = TaskRow::from_record(&record);
        assert_eq!(row.status, "processing");
        let back = row.into_record().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn unknown_status_labels_are_rejected_on_read() {
        let record = TaskRecord::new("t", serde_json::Value::Null, 60);
        let mut row = TaskRow::from_record(&record);
        row.status = "exploded".into();
        assert!(matches!(
            row.into_record(),
            Err(StoreError::InvalidStatus(label)) if label == "exploded"
        ));
    }

    #[test]
    fn survey_row_preserves_metadata() {
        let record = ResultRecord::completed(
            "t",
            serde_json::json!({"title": "S", "cite_ratio": 0.5, "papers": [{}]}),
        );
        let row = SurveyRow::from_record(&record);
        assert_eq!(row.references_count, 1);
        let back = row.into_record();
        assert_eq!(back, record);
    }
}
