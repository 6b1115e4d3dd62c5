//! Flow runtime error types.

use thiserror::Error;

/// Type-erased error type returned by node processing functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Specialized [`Result`] type for flow runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the flow runtime itself.
///
/// Failures of user processing functions are not represented here; after
/// retry exhaustion they travel through the pipeline as [`NodeFailure`]
/// values instead.
#[derive(Debug, Error)]
pub enum Error {
    /// A node declared as producing output has no downstream connection.
    #[error("node {0} has no downstream, but is not declared as no_output")]
    MissingDownstream(String),

    /// A node declared as `no_output` has downstream connections.
    #[error("node {0} has downstream connections, but is declared as no_output")]
    UnexpectedDownstream(String),

    /// A node declared as `no_input` has upstream connections.
    #[error("node {0} has upstream connections, but is declared as no_input")]
    UnexpectedUpstream(String),

    /// The node was started more than once.
    #[error("node {0} is already running")]
    AlreadyStarted(String),

    /// A queue endpoint was dropped while the pipeline was still running.
    #[error("queue for node {0} is closed")]
    QueueClosed(String),

    /// Internal error.
    #[error("internal flow error: {0}")]
    Internal(String),
}

/// A processing failure packaged as a value.
///
/// Produced by a node once its retry budget is exhausted; flows downstream
/// so that nodes with `skip_errors` forward it untouched and sinks can
/// account for it. Carries a summary of the input rather than the input
/// itself so the failed value does not keep large payloads alive.
#[derive(Debug, Clone, Error)]
#[error("node {node} failed on {input}: {message}")]
pub struct NodeFailure {
    /// Name of the node that produced the failure.
    pub node: String,
    /// Label of the input that was being processed.
    pub input: String,
    /// Message of the final error.
    pub message: String,
    /// Display chain of the error source, innermost last.
    pub chain: Vec<String>,
}

impl NodeFailure {
    /// Creates a failure record from a type-erased processing error.
    pub fn new(node: impl Into<String>, input: impl Into<String>, error: &BoxError) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            node: node.into(),
            input: input.into(),
            message: error.to_string(),
            chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_captures_error_chain() {
        let io = std::io::Error::other("disk offline");
        let err: BoxError = Box::new(io);
        let failure = NodeFailure::new("save", "survey-1", &err);
        assert_eq!(failure.node, "save");
        assert_eq!(failure.message, "disk offline");
        assert!(failure.to_string().contains("survey-1"));
    }
}
