//! Pipeline stage error types.

use thiserror::Error;

use crate::seam::ComposeError;

/// Specialized [`Result`] type for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Errors raised while assembling or running the survey pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The dataflow runtime rejected the topology or lost a queue.
    #[error("flow error: {0}")]
    Flow(#[from] surveyor_flow::Error),

    /// The payload could not be built or mutated.
    #[error("payload error: {0}")]
    Payload(#[from] surveyor_survey::Error),

    /// A backing store failed.
    #[error("store error: {0}")]
    Store(#[from] surveyor_core::StoreError),

    /// A model seam failed beyond its retry budget.
    #[error("compose error: {0}")]
    Compose(#[from] ComposeError),

    /// The encode stage found no crawl results for a task.
    #[error("missing crawl results for task {0}")]
    MissingCrawlResults(String),

    /// Internal error.
    #[error("internal pipeline error: {0}")]
    Internal(String),
}
