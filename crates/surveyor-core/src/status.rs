//! The task state machine.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle status of a submitted task.
///
/// `Pending → Preparing → {Searching → SearchingWeb → Crawling} →
/// Processing → Completed`, with `Failed` and `Timeout` terminal from any
/// non-terminal state. The search states only occur when the input is
/// prepared from a topic. Serializes to lowercase snake case for API and
/// storage compatibility.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by a preparation worker.
    Pending,
    /// Preparation worker is assembling the input payload.
    Preparing,
    /// Generating search queries for the topic.
    Searching,
    /// Running web searches.
    SearchingWeb,
    /// Crawling search results.
    Crawling,
    /// Payload submitted to the pipeline.
    Processing,
    /// Result persisted in the result store.
    Completed,
    /// Preparation or processing failed.
    Failed,
    /// The watcher gave up waiting for a result.
    Timeout,
}

impl TaskStatus {
    /// Returns whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Returns whether the task still occupies pipeline resources.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn statuses_serialize_to_snake_case() {
        assert_eq!(TaskStatus::SearchingWeb.to_string(), "searching_web");
        assert_eq!(
            serde_json::to_value(TaskStatus::SearchingWeb).unwrap(),
            "searching_web"
        );
        assert_eq!(
            TaskStatus::from_str("searching_web").unwrap(),
            TaskStatus::SearchingWeb
        );
    }

    #[test]
    fn exactly_three_statuses_are_terminal() {
        let terminal: Vec<TaskStatus> =
            TaskStatus::iter().filter(|status| status.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Timeout]
        );
    }

    #[test]
    fn serde_and_strum_agree() {
        for status in TaskStatus::iter() {
            let via_serde = serde_json::to_value(status).unwrap();
            assert_eq!(via_serde, status.to_string());
        }
    }
}
