//! The refine stage: outline refinement passes over the digest corpus.
//!
//! The convolution and scoring algorithms live behind the
//! [`OutlineRefiner`] seam; this stage owns the iteration and the
//! bookkeeping on the payload.

use std::sync::Arc;

use surveyor_flow::{Node, NodeConfig, Sequential};
use surveyor_survey::RenderOptions;

use crate::TRACING_TARGET;
use crate::seam::{OutlineRefiner, with_compose_retry};
use crate::survey_pipeline::SurveyPipelineConfig;
use crate::unit::Unit;

/// Builds the refine composite: one node applying the configured number
/// of refinement passes per survey.
pub fn build(
    config: &SurveyPipelineConfig,
    outliner: Arc<dyn OutlineRefiner>,
) -> Sequential<Unit> {
    let passes = config.refine_passes;
    let compose_retries = config.compose_retries;

    let refine = Node::new(
        "refine_outline",
        NodeConfig::new()
            .with_workers(config.worker_num)
            .with_queue_size(config.queue_size),
        move |unit: Unit| {
            let outliner = outliner.clone();
            async move {
                let Unit::Survey(mut survey) = unit else {
                    return Ok(Some(unit));
                };

                for pass in 0..passes {
                    let outline = survey.outline_text(RenderOptions::guidance());
                    let digests = survey
                        .digests
                        .digests()
                        .iter()
                        .map(|digest| digest.description())
                        .collect::<Vec<_>>()
                        .join("\n------------------\n");
                    let refined = with_compose_retry("refine_outline", compose_retries, || {
                        outliner.refine(&survey.title, &outline, &digests)
                    })
                    .await?;
                    survey.update_outline(&refined)?;
                    survey.stats.refine_count = pass as u32 + 1;
                    tracing::debug!(
                        target: TRACING_TARGET,
                        survey = %survey.title,
                        pass = pass + 1,
                        "Outline refinement pass applied"
                    );
                }

                Ok(Some(Unit::Survey(survey)))
            }
        },
    );

    Sequential::new("refine", vec![refine])
}
