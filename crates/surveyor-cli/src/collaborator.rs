//! Extractive fallback collaborators.
//!
//! The production deployments plug model-backed implementations of the
//! pipeline seams into the binary. This module provides deterministic
//! extractive implementations so the server runs end-to-end without a
//! model backend: outlines from paper titles, digests from abstracts,
//! sections from digest text with citations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use surveyor_pipeline::{ComposeError, ComposeRequest};
use surveyor_survey::Paper;

/// Sections per outline chapter in the extractive outline.
const PAPERS_PER_SECTION: usize = 5;

/// Drafts outlines by bucketing papers into fixed-size chapters.
pub struct ExtractiveOutliner;

#[async_trait]
impl surveyor_pipeline::OutlineRefiner for ExtractiveOutliner {
    async fn draft(
        &self,
        survey_title: &str,
        abstracts: &BTreeMap<String, (String, String)>,
    ) -> Result<String, ComposeError> {
        let mut outline = format!("# {survey_title}\n## Introduction\n");
        for (chapter, chunk) in abstracts
            .keys()
            .collect::<Vec<_>>()
            .chunks(PAPERS_PER_SECTION)
            .enumerate()
        {
            outline.push_str(&format!("## Topic Group {}\n", chapter + 1));
            let bibkeys = chunk
                .iter()
                .map(|key| key.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            outline.push_str(&format!("Covers [{bibkeys}].\n"));
        }
        outline.push_str("## Conclusion\n");
        Ok(outline)
    }

    async fn refine(
        &self,
        _survey_title: &str,
        outline: &str,
        _digests: &str,
    ) -> Result<String, ComposeError> {
        // Extractive outlines have nothing to refine.
        Ok(outline.to_string())
    }
}

/// Builds digests by copying abstracts under every outline section.
pub struct ExtractiveDigester;

#[async_trait]
impl surveyor_pipeline::DigestSynthesizer for ExtractiveDigester {
    async fn synthesize(
        &self,
        survey_title: &str,
        outline: &str,
        papers: &[Paper],
    ) -> Result<String, ComposeError> {
        let mut digest = String::new();
        for line in outline.lines() {
            if !line.starts_with('#') {
                continue;
            }
            digest.push_str(line);
            digest.push('\n');
            if line.starts_with("# ") {
                continue;
            }
            for paper in papers {
                digest.push_str(&format!(
                    "[{}]: {}\n",
                    paper.bibkey,
                    paper.abstract_text.lines().next().unwrap_or_default()
                ));
            }
        }
        if digest.is_empty() {
            return Err(ComposeError::Other(format!(
                "outline of {survey_title} has no sections"
            )));
        }
        Ok(digest)
    }
}

/// Composes sections by quoting the digest material.
pub struct ExtractiveComposer;

#[async_trait]
impl surveyor_pipeline::SectionComposer for ExtractiveComposer {
    async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError> {
        let mut body = format!(
            "This section of \"{}\" reviews {}.",
            request.survey_title, request.section_title
        );
        if !request.bibkeys.is_empty() {
            body.push_str(&format!(" Relevant work includes [{}].", request.bibkeys.join(", ")));
        }
        if !request.is_leaf && !request.subcontents.is_empty() {
            body.push_str("\n\nIt summarizes the subsections above.");
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use surveyor_pipeline::{DigestSynthesizer, OutlineRefiner};

    use super::*;

    #[tokio::test]
    async fn outline_covers_every_bibkey() {
        let abstracts: BTreeMap<String, (String, String)> = (0..7)
            .map(|index| {
                (
                    format!("paper_{index}"),
                    (format!("Paper {index}"), "abstract".to_string()),
                )
            })
            .collect();
        let outline = ExtractiveOutliner.draft("S", &abstracts).await.unwrap();
        assert!(outline.contains("## Topic Group 1"));
        assert!(outline.contains("## Topic Group 2"));
        for key in abstracts.keys() {
            assert!(outline.contains(key.as_str()));
        }
    }

    #[tokio::test]
    async fn digest_mirrors_outline_headings() {
        let papers = vec![Paper {
            title: "Alpha".into(),
            bibkey: "alpha".into(),
            abstract_text: "An abstract.".into(),
            url: None,
            text: "body".into(),
            token_count: None,
        }];
        let digest = ExtractiveDigester
            .synthesize("S", "# S\n## A\n## B\n", &papers)
            .await
            .unwrap();
        assert_eq!(digest.matches("##").count(), 2);
        assert!(digest.contains("[alpha]"));
    }
}
