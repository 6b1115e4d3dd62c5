//! The encode stage: crawl results in, survey payload with outline and
//! digests out.

use std::sync::Arc;

use surveyor_core::ResultStore;
use surveyor_flow::{Node, NodeConfig, Sequential};
use surveyor_survey::{Digest, DigestPaper, Paper, RenderOptions, Survey, SurveyInput};

use crate::TRACING_TARGET;
use crate::error::PipelineError;
use crate::seam::{DigestSynthesizer, OutlineRefiner, with_compose_retry};
use crate::survey_pipeline::SurveyPipelineConfig;
use crate::unit::Unit;

fn digest_paper(paper: &Paper) -> DigestPaper {
    DigestPaper {
        title: paper.title.clone(),
        bibkey: paper.bibkey.clone(),
        abstract_text: paper.abstract_text.clone(),
        content: paper.text.clone(),
    }
}

/// Builds the encode composite: a load node resolving task handles into
/// survey payloads with a drafted outline, and a digest node grouping
/// papers into digest batches.
pub fn build(
    config: &SurveyPipelineConfig,
    results: Arc<dyn ResultStore>,
    outliner: Arc<dyn OutlineRefiner>,
    digester: Arc<dyn DigestSynthesizer>,
) -> Sequential<Unit> {
    let workers = config.worker_num;
    let queue = config.queue_size;
    let compose_retries = config.compose_retries;
    let group_size = config.digest_group_size.max(1);

    let load = {
        Node::new(
            "load_survey",
            NodeConfig::new()
                .with_workers(workers)
                .with_queue_size(queue),
            move |unit: Unit| {
                let results = results.clone();
                let outliner = outliner.clone();
                async move {
                    let Unit::Task(task_id) = unit else {
                        return Ok(Some(unit));
                    };
                    let Some(crawl) = results.get_crawl_results(&task_id).await? else {
                        return Err(PipelineError::MissingCrawlResults(task_id).into());
                    };
                    let input: SurveyInput = serde_json::from_value(crawl)
                        .map_err(surveyor_survey::Error::from)?;
                    let mut survey = Survey::from_input(input, Some(task_id.clone()))?;

                    let abstracts = survey.abstracts();
                    let outline = with_compose_retry("draft_outline", compose_retries, || {
                        outliner.draft(&survey.title, &abstracts)
                    })
                    .await?;
                    let title = survey.title.clone();
                    survey.skeleton.parse_outline(&title, &outline)?;

                    tracing::info!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        survey = %survey.title,
                        papers = survey.papers().len(),
                        "Survey loaded from crawl results"
                    );
                    Ok(Some(Unit::survey(survey)))
                }
            },
        )
    };

    let digest = {
        Node::new(
            "build_digests",
            NodeConfig::new()
                .with_workers(workers)
                .with_queue_size(queue),
            move |unit: Unit| {
                let digester = digester.clone();
                async move {
                    let Unit::Survey(mut survey) = unit else {
                        return Ok(Some(unit));
                    };
                    let outline = survey.outline_text(RenderOptions::guidance());
                    let papers: Vec<Paper> = survey.papers().to_vec();

                    let mut digests = Vec::new();
                    for group in papers.chunks(group_size) {
                        let markdown =
                            with_compose_retry("synthesize_digest", compose_retries, || {
                                digester.synthesize(&survey.title, &outline, group)
                            })
                            .await?;
                        let mut digest = Digest::new(
                            survey.title.clone(),
                            group.iter().map(digest_paper).collect(),
                        );
                        digest.parse_sections(&markdown, &survey.skeleton)?;
                        digests.push(digest);
                    }
                    let group_count = digests.len();
                    survey.update_digests(digests)?;
                    survey.stats.digest_batch_size = group_size as u32;

                    tracing::info!(
                        target: TRACING_TARGET,
                        survey = %survey.title,
                        digest_groups = group_count,
                        "Digests constructed"
                    );
                    Ok(Some(Unit::Survey(survey)))
                }
            },
        )
    };

    Sequential::new("encode", vec![load, digest])
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use surveyor_core::MemoryResultStore;

    use super::*;
    use crate::seam::{ComposeError, ComposeRequest, SectionComposer};

    pub(crate) struct StubOutliner;

    #[async_trait]
    impl OutlineRefiner for StubOutliner {
        async fn draft(
            &self,
            survey_title: &str,
            _abstracts: &std::collections::BTreeMap<String, (String, String)>,
        ) -> Result<String, ComposeError> {
            Ok(format!("# {survey_title}\n## Intro\n## Outlook\n"))
        }

        async fn refine(
            &self,
            _survey_title: &str,
            outline: &str,
            _digests: &str,
        ) -> Result<String, ComposeError> {
            Ok(outline.to_string())
        }
    }

    pub(crate) struct StubDigester;

    #[async_trait]
    impl DigestSynthesizer for StubDigester {
        async fn synthesize(
            &self,
            survey_title: &str,
            _outline: &str,
            _papers: &[Paper],
        ) -> Result<String, ComposeError> {
            Ok(format!(
                "# {survey_title}\n## Intro\nmotivations\n## Outlook\nfutures\n"
            ))
        }
    }

    pub(crate) struct StubComposer;

    #[async_trait]
    impl SectionComposer for StubComposer {
        async fn compose(&self, request: &ComposeRequest) -> Result<String, ComposeError> {
            let bibkey = request.bibkeys.first().cloned().unwrap_or_default();
            Ok(format!("{} body [{}].", request.section_title, bibkey))
        }
    }

    #[tokio::test]
    async fn missing_crawl_results_error_mentions_the_task() {
        let results = Arc::new(MemoryResultStore::new());
        let err = results.get_crawl_results("absent").await.unwrap();
        assert!(err.is_none());
        let wrapped = PipelineError::MissingCrawlResults("absent".into());
        assert!(wrapped.to_string().contains("absent"));
    }
}
