//! The streaming decode composite.
//!
//! Surveys entering decode are registered in an in-flight registry and
//! their content trees begin emitting ready sections: leaves first, a
//! parent as soon as every child qualifies. A harvester task drains
//! ready sections from all registered surveys into the compose node, so
//! sections of several surveys interleave freely. Once the root's
//! children all qualify, the survey leaves the registry and flows to
//! citation rewrite and the result store.

use std::collections::HashMap;
use std::sync::Arc;

use surveyor_core::ResultStore;
use surveyor_flow::{Node, NodeConfig, Sequential};
use surveyor_survey::{RenderOptions, Survey};

use crate::TRACING_TARGET;
use crate::error::{PipelineError, Result};
use crate::seam::{ComposeRequest, SectionComposer, with_compose_retry};
use crate::survey_pipeline::SurveyPipelineConfig;
use crate::unit::{SectionUnit, Unit};

/// Registry of surveys currently being decoded.
///
/// One coarse async lock guards the map; the harvester scans it once per
/// interval and the compose/assemble nodes take it briefly per section.
#[derive(Clone, Default)]
pub struct SurveyRegistry {
    inner: Arc<tokio::sync::Mutex<HashMap<String, Survey>>>,
}

impl SurveyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key for a survey. The task id is part of the key so two
    /// submissions with the same title never collide.
    fn key_for(survey: &Survey) -> String {
        match &survey.task_id {
            Some(task_id) => {
                format!("{task_id}(cycle {})", survey.stats.block_cycle_count)
            }
            None => survey.label(),
        }
    }

    /// Number of in-flight surveys.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Initializes the content tree and registers the survey.
    ///
    /// Returns the registry key, and the survey itself when its outline
    /// has no sections: such a survey is finished on arrival and never
    /// produces section units.
    pub async fn register(&self, mut survey: Survey) -> Result<(String, Option<Survey>)> {
        survey.init_content()?;
        let key = Self::key_for(&survey);
        if survey.is_content_finished() {
            tracing::warn!(
                target: TRACING_TARGET,
                survey = %key,
                "Survey has no composable sections, finishing immediately"
            );
            return Ok((key, Some(survey)));
        }
        tracing::info!(
            target: TRACING_TARGET,
            survey = %key,
            "Registered survey for decoding"
        );
        self.inner.lock().await.insert(key.clone(), survey);
        Ok((key, None))
    }

    /// Drains every currently-ready section across all surveys.
    pub async fn harvest(&self) -> Vec<SectionUnit> {
        let mut sections = Vec::new();
        let mut registry = self.inner.lock().await;
        for (key, survey) in registry.iter_mut() {
            let Some(content) = survey.content.as_mut() else {
                continue;
            };
            while let Some(section_id) = content.next_ready() {
                sections.push(SectionUnit::new(key.clone(), section_id));
            }
        }
        sections
    }

    /// Builds the compose request for a harvested section.
    pub async fn compose_request(&self, unit: &SectionUnit) -> Result<ComposeRequest> {
        let registry = self.inner.lock().await;
        let survey = registry
            .get(&unit.survey_key)
            .ok_or_else(|| PipelineError::Internal(format!(
                "survey {} is not registered",
                unit.survey_key
            )))?;
        let content = survey
            .content
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("content tree missing".into()))?;

        let arena = survey.skeleton.arena();
        let section_title = arena
            .get(unit.section_id)
            .map(|section| section.title.clone())
            .unwrap_or_default();
        let digests = survey
            .digests
            .digests()
            .iter()
            .map(|digest| digest.description())
            .filter(|description| !description.is_empty())
            .collect::<Vec<_>>()
            .join("\n------------------\n");

        Ok(ComposeRequest {
            survey_title: survey.title.clone(),
            section_title,
            outline: survey.skeleton.render(RenderOptions {
                analysis: true,
                ..RenderOptions::titles()
            }),
            digests,
            bibkeys: survey.bibkeys().into_iter().collect(),
            subcontents: content.subcontents(unit.section_id, &survey.skeleton),
            is_leaf: arena.is_leaf(unit.section_id),
            failure_count: content
                .section(unit.section_id)
                .map(|section| section.failure_count)
                .unwrap_or_default(),
        })
    }

    /// Records a compose failure against a section.
    pub async fn record_failure(&self, unit: &SectionUnit) {
        let mut registry = self.inner.lock().await;
        if let Some(survey) = registry.get_mut(&unit.survey_key)
            && let Some(content) = survey.content.as_mut()
        {
            content.record_failure(unit.section_id);
        }
    }

    /// Stores a composed section and marks it qualified.
    ///
    /// Returns the survey when this section completed the whole content
    /// tree; the survey is removed from the registry at that moment.
    pub async fn apply_composed(&self, unit: &SectionUnit, text: &str) -> Result<Option<Survey>> {
        let mut registry = self.inner.lock().await;
        let survey = registry
            .get_mut(&unit.survey_key)
            .ok_or_else(|| PipelineError::Internal(format!(
                "survey {} is not registered",
                unit.survey_key
            )))?;
        let legal = survey.bibkeys();
        let content = survey
            .content
            .as_mut()
            .ok_or_else(|| PipelineError::Internal("content tree missing".into()))?;
        content.update_section(unit.section_id, text, &legal)?;
        content.mark_qualified(unit.section_id)?;

        if content.is_finished() {
            let survey = registry
                .remove(&unit.survey_key)
                .expect("survey was present above");
            tracing::info!(
                target: TRACING_TARGET,
                survey = %unit.survey_key,
                "Survey content assembled"
            );
            return Ok(Some(survey));
        }
        Ok(None)
    }
}

/// The decode composite plus the node the harvester feeds.
pub struct DecodeStage {
    /// The sequential composite to splice into the pipeline.
    pub sequential: Sequential<Unit>,
    /// The compose node; harvested section units are put here.
    pub compose: Arc<Node<Unit>>,
}

impl DecodeStage {
    /// Builds the decode composite.
    pub fn build(
        config: &SurveyPipelineConfig,
        registry: SurveyRegistry,
        composer: Arc<dyn SectionComposer>,
        results: Arc<dyn ResultStore>,
    ) -> DecodeStage {
        let workers = config.worker_num;
        let queue = config.queue_size;
        let compose_retries = config.compose_retries;

        let register = {
            let registry = registry.clone();
            Node::new(
                "register_survey",
                NodeConfig::new()
                    .with_workers(workers)
                    .with_queue_size(queue)
                    .discard_none(),
                move |unit: Unit| {
                    let registry = registry.clone();
                    async move {
                        let Unit::Survey(survey) = unit else {
                            return Ok(Some(unit));
                        };
                        let (_, finished) = registry.register(*survey).await?;
                        Ok(finished.map(Unit::survey))
                    }
                },
            )
        };

        let compose = {
            let registry = registry.clone();
            Node::new(
                "compose_section",
                NodeConfig::new()
                    .with_workers(workers)
                    .with_queue_size(queue),
                move |unit: Unit| {
                    let registry = registry.clone();
                    let composer = composer.clone();
                    async move {
                        let Unit::Section(mut section) = unit else {
                            return Ok(Some(unit));
                        };
                        let request = registry.compose_request(&section).await?;
                        let composed = with_compose_retry(
                            "compose_section",
                            compose_retries,
                            || composer.compose(&request),
                        )
                        .await;
                        match composed {
                            Ok(text) => {
                                section.composed = Some(text);
                                Ok(Some(Unit::Section(section)))
                            }
                            Err(err) => {
                                registry.record_failure(&section).await;
                                Err(err.into())
                            }
                        }
                    }
                },
            )
        };

        let assemble = {
            let registry = registry.clone();
            Node::new(
                "assemble_survey",
                NodeConfig::new()
                    .with_workers(workers)
                    .with_queue_size(queue)
                    .discard_none(),
                move |unit: Unit| {
                    let registry = registry.clone();
                    async move {
                        let Unit::Section(section) = unit else {
                            return Ok(Some(unit));
                        };
                        let Some(text) = section.composed.clone() else {
                            return Err("section reached assemble without composed text".into());
                        };
                        let finished = registry.apply_composed(&section, &text).await?;
                        Ok(finished.map(Unit::survey))
                    }
                },
            )
        };

        let cite = Node::new(
            "rewrite_citations",
            NodeConfig::new()
                .with_workers(workers)
                .with_queue_size(queue),
            |unit: Unit| async move {
                let Unit::Survey(mut survey) = unit else {
                    return Ok(Some(unit));
                };
                survey.rewrite_citations()?;
                Ok(Some(Unit::Survey(survey)))
            },
        );

        let save = {
            Node::new(
                "save_survey",
                NodeConfig::new()
                    .with_workers(workers)
                    .with_queue_size(queue)
                    .no_output(),
                move |unit: Unit| {
                    let results = results.clone();
                    async move {
                        let Unit::Survey(mut survey) = unit else {
                            return Ok(None);
                        };
                        let Some(task_id) = survey.task_id.clone() else {
                            tracing::warn!(
                                target: TRACING_TARGET,
                                survey = %survey.title,
                                "Survey has no task id, dropping result"
                            );
                            return Ok(None);
                        };
                        let started = survey.snapshot_at;
                        survey.snapshot(started);
                        let mut blob = survey.to_value()?;
                        if let Some(object) = blob.as_object_mut() {
                            object.insert(
                                "content".to_string(),
                                serde_json::json!(survey.render()),
                            );
                        }
                        results.save(&task_id, blob).await?;
                        tracing::info!(
                            target: TRACING_TARGET,
                            task_id = %task_id,
                            survey = %survey.title,
                            "Survey saved to result store"
                        );
                        Ok(None)
                    }
                },
            )
        };

        let compose_handle = compose.clone();
        let sequential = Sequential::new(
            "decode",
            vec![register, compose, assemble, cite, save],
        );
        DecodeStage {
            sequential,
            compose: compose_handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use surveyor_survey::{PaperInput, SurveyInput};

    use super::*;

    fn survey() -> Survey {
        let input = SurveyInput {
            title: "S".into(),
            outline: vec![],
            text: String::new(),
            papers: vec![
                PaperInput {
                    title: "Alpha".into(),
                    text: "alpha".into(),
                    ..PaperInput::default()
                },
                PaperInput {
                    title: "Beta".into(),
                    text: "beta".into(),
                    ..PaperInput::default()
                },
            ],
        };
        let mut survey = Survey::from_input(input, Some("task".into())).unwrap();
        survey
            .skeleton
            .parse_outline("S", "# T\n## Intro\n## Outlook\n")
            .unwrap();
        survey
    }

    #[tokio::test]
    async fn harvest_emits_leaves_then_parents() {
        let registry = SurveyRegistry::new();
        let (key, finished) = registry.register(survey()).await.unwrap();
        assert!(finished.is_none());
        assert_eq!(key, "task(cycle 0)");

        let first = registry.harvest().await;
        assert_eq!(first.len(), 2);

        // Nothing new until sections qualify.
        assert!(registry.harvest().await.is_empty());

        for unit in &first {
            let done = registry.apply_composed(unit, "Body [alpha].").await.unwrap();
            if unit == first.last().unwrap() {
                // Both top-level children qualified: tree finished.
                let survey = done.expect("survey finishes with last section");
                assert_eq!(survey.task_id.as_deref(), Some("task"));
            } else {
                assert!(done.is_none());
            }
        }
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn compose_request_snapshots_section_context() {
        let registry = SurveyRegistry::new();
        registry.register(survey()).await.unwrap();
        let sections = registry.harvest().await;
        let request = registry.compose_request(&sections[0]).await.unwrap();
        assert_eq!(request.survey_title, "S");
        assert!(request.is_leaf);
        assert_eq!(request.bibkeys.len(), 2);
        assert!(request.outline.contains("Intro"));
    }
}
