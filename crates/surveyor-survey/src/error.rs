//! Payload error types.

use thiserror::Error;

/// Specialized [`Result`] type for payload operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while building or mutating the survey payload.
///
/// [`Error::BibkeyNotFound`], [`Error::StructureMismatch`] and
/// [`Error::MarkdownBlockNotFound`] are the application-level retryable
/// errors: stages that parse model output retry on them with their own
/// budget before giving up.
#[derive(Debug, Error)]
pub enum Error {
    /// Generated text cites bibkeys that are not in the reference set.
    #[error("unknown bibkeys cited: {}", .0.join(", "))]
    BibkeyNotFound(Vec<String>),

    /// A parsed tree does not mirror the outline structure.
    #[error("structure mismatch: {0}")]
    StructureMismatch(String),

    /// Model output carried no usable markdown content.
    #[error("markdown block not found in model output")]
    MarkdownBlockNotFound,

    /// A bibkey was assigned to more than one digest group.
    #[error("bibkey {0} already belongs to a digest group")]
    DuplicateBibkey(String),

    /// The outline could not be parsed into any section.
    #[error("outline is empty or has no sections")]
    EmptyOutline,

    /// Input data is unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization round-trip failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns whether a stage-level retry can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BibkeyNotFound(_)
                | Error::StructureMismatch(_)
                | Error::MarkdownBlockNotFound
        )
    }
}
