//! Durable task records.

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET;
use crate::status::TaskStatus;
use crate::store::StoreError;

/// Default task expiration window: 24 hours.
pub const DEFAULT_EXPIRE_SECONDS: i64 = 86_400;

/// The durable per-submission entry in the task registry.
///
/// All timestamps are UTC [`jiff::Timestamp`]s; naive datetimes do not
/// exist anywhere in the lifecycle. Field updates are last-writer-wins
/// per field; terminal statuses are sticky.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Globally unique task id.
    pub id: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Opaque submission parameters.
    pub params: serde_json::Value,
    /// Topic as originally submitted.
    pub original_topic: Option<String>,
    /// Unique key under which the result will be stored.
    pub expected_result_key: Option<String>,
    /// Submitting user, when known.
    pub user_id: Option<String>,
    /// Last error message, set on failure.
    pub error: Option<String>,
    /// Creation instant.
    pub created_at: Timestamp,
    /// Instant of the last mutation.
    pub updated_at: Timestamp,
    /// Instant preparation/processing started.
    pub start_time: Option<Timestamp>,
    /// Instant a terminal status was reached.
    pub end_time: Option<Timestamp>,
    /// Wall-clock seconds between start and end.
    pub execution_seconds: Option<f64>,
    /// Instant after which the record may be swept.
    pub expire_at: Timestamp,
}

impl TaskRecord {
    /// Creates a pending record expiring after `expire_seconds`.
    pub fn new(id: impl Into<String>, params: serde_json::Value, expire_seconds: i64) -> Self {
        let now = Timestamp::now();
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            params,
            original_topic: None,
            expected_result_key: None,
            user_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            start_time: None,
            end_time: None,
            execution_seconds: None,
            expire_at: now + SignedDuration::from_secs(expire_seconds),
        }
    }

    /// Applies a status transition, honoring terminal monotonicity.
    ///
    /// Returns whether the transition was applied. A record already in a
    /// terminal status ignores every further transition. Entering
    /// `Preparing`/`Processing` stamps `start_time` once; entering a
    /// terminal status stamps `end_time` and computes the execution time
    /// from the UTC delta.
    pub fn apply_status(&mut self, status: TaskStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            tracing::debug!(
                target: TRACING_TARGET,
                task_id = %self.id,
                current = %self.status,
                requested = %status,
                "Ignoring transition out of terminal status"
            );
            return false;
        }

        let now = Timestamp::now();
        self.status = status;
        self.updated_at = now;
        if let Some(error) = error {
            self.error = Some(error);
        }

        match status {
            TaskStatus::Preparing | TaskStatus::Processing => {
                if self.start_time.is_none() {
                    self.start_time = Some(now);
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout => {
                self.end_time = Some(now);
                if let Some(start) = self.start_time {
                    self.execution_seconds =
                        Some(now.duration_since(start).as_secs_f64().max(0.0));
                }
            }
            _ => {}
        }
        true
    }

    /// Sets one named field; unknown names are rejected.
    pub fn set_field(&mut self, field: &str, value: serde_json::Value) -> Result<(), StoreError> {
        match field {
            "params" => self.params = value,
            "original_topic" => self.original_topic = value.as_str().map(str::to_string),
            "expected_result_key" => {
                self.expected_result_key = value.as_str().map(str::to_string)
            }
            "user_id" => self.user_id = value.as_str().map(str::to_string),
            "error" => self.error = value.as_str().map(str::to_string),
            other => return Err(StoreError::UnknownField(other.to_string())),
        }
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Returns whether the record is past its expiration instant.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expire_at < now
    }
}
