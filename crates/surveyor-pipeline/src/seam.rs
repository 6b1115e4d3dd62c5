//! Trait seams to the external model collaborators.
//!
//! Prompts, model clients and the search/crawl machinery live outside
//! this crate; the stages reach them through these traits. Application
//! semantic errors (parse failures, structural mismatches, missing
//! bibkeys) are retryable with a stage-level budget; everything else
//! falls through to the node runtime's generic retry.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use surveyor_flow::RetryPolicy;
use thiserror::Error;

use crate::TRACING_TARGET;

/// Default retry budget for retryable compose errors.
pub const DEFAULT_COMPOSE_RETRIES: usize = 10;

/// Errors surfaced by the model seams.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// The model output failed payload-level validation. Retryable.
    #[error(transparent)]
    Payload(#[from] surveyor_survey::Error),

    /// The model backend failed (transport, rate limit, refusal).
    #[error("model backend error: {0}")]
    Backend(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ComposeError {
    /// Returns whether re-prompting can plausibly fix the failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComposeError::Payload(err) => err.is_retryable(),
            ComposeError::Backend(_) | ComposeError::Other(_) => false,
        }
    }
}

/// Everything the section composer needs to write one section.
#[derive(Debug, Clone)]
pub struct ComposeRequest {
    /// Survey title.
    pub survey_title: String,
    /// Title of the section being composed, without numbering.
    pub section_title: String,
    /// Outline rendered with analysis guidance.
    pub outline: String,
    /// Flattened digest descriptions relevant to the section.
    pub digests: String,
    /// Bibkeys the section may cite.
    pub bibkeys: Vec<String>,
    /// Bodies of already-composed child sections (empty for leaves).
    pub subcontents: String,
    /// Whether the section is an outline leaf.
    pub is_leaf: bool,
    /// Compose failures already observed for this section.
    pub failure_count: u32,
}

/// Prepares topic submissions: query generation, web search, crawling.
///
/// Implementations persist crawl results keyed by task id (the encode
/// stage reads them back) and drive the `Searching → SearchingWeb →
/// Crawling` status updates through the registry they are given.
#[async_trait]
pub trait TopicProcessor: Send + Sync {
    /// Runs the search and crawl phase for a topic submission.
    async fn process(
        &self,
        task_id: &str,
        topic: &str,
        params: &serde_json::Value,
    ) -> Result<(), ComposeError>;
}

/// Produces and refines survey outlines.
#[async_trait]
pub trait OutlineRefiner: Send + Sync {
    /// Drafts the initial outline markdown from titles and abstracts.
    async fn draft(
        &self,
        survey_title: &str,
        abstracts: &BTreeMap<String, (String, String)>,
    ) -> Result<String, ComposeError>;

    /// One refinement pass over the current outline. Returns the
    /// refined outline markdown.
    async fn refine(
        &self,
        survey_title: &str,
        outline: &str,
        digests: &str,
    ) -> Result<String, ComposeError>;
}

/// Builds digests for groups of reference papers.
#[async_trait]
pub trait DigestSynthesizer: Send + Sync {
    /// Produces the digest markdown for one group of papers, aligned to
    /// the outline.
    async fn synthesize(
        &self,
        survey_title: &str,
        outline: &str,
        papers: &[surveyor_survey::Paper],
    ) -> Result<String, ComposeError>;
}

/// Writes the prose of one content section.
#[async_trait]
pub trait SectionComposer: Send + Sync {
    /// Composes the section body described by the request.
    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError>;
}

/// Runs a seam call with the stage-level retry budget for retryable
/// errors. Non-retryable errors return immediately and fall through to
/// the node runtime's generic retry.
pub async fn with_compose_retry<T, F, Fut>(
    what: &str,
    max_retries: usize,
    operation: F,
) -> Result<T, ComposeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ComposeError>>,
{
    let policy = RetryPolicy::default()
        .with_max_attempts(max_retries.max(1))
        .with_max_delay(Duration::from_secs(10));
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && policy.allows(attempt) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    target: TRACING_TARGET,
                    what = %what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable compose error, re-prompting"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn payload_errors_are_retryable_backend_errors_are_not() {
        let payload = ComposeError::Payload(surveyor_survey::Error::MarkdownBlockNotFound);
        assert!(payload.is_retryable());
        assert!(!ComposeError::Backend("429".into()).is_retryable());
    }

    #[tokio::test]
    async fn retry_budget_applies_to_retryable_errors_only() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ComposeError> = with_compose_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ComposeError::Payload(surveyor_survey::Error::MarkdownBlockNotFound)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<(), ComposeError> = with_compose_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ComposeError::Backend("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
