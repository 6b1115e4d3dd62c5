#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod decode;
pub mod encode;
mod error;
pub mod refine;
pub mod seam;
pub mod survey_pipeline;
pub mod unit;

pub use decode::SurveyRegistry;
pub use error::{PipelineError, Result};
pub use seam::{
    ComposeError, ComposeRequest, DigestSynthesizer, OutlineRefiner, SectionComposer,
    TopicProcessor,
};
pub use survey_pipeline::{PipelineDeps, SurveyPipeline, SurveyPipelineConfig};
pub use unit::{SectionUnit, Unit};

/// Tracing target for pipeline stage operations.
pub const TRACING_TARGET: &str = "surveyor_pipeline";
