#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod citation;
pub mod content;
pub mod digest;
mod error;
pub mod skeleton;
pub mod survey;
pub mod tree;

pub use content::{ContentSection, ContentTree};
pub use digest::{Digest, DigestPaper, DigestRegistry, DigestSection};
pub use error::{Error, Result};
pub use skeleton::{RenderOptions, Section, Skeleton};
pub use survey::{Paper, PaperInput, RefinementStats, Survey, SurveyInput};
pub use tree::{Arena, NodeId};

/// Tracing target for payload operations.
pub const TRACING_TARGET: &str = "surveyor_survey";
