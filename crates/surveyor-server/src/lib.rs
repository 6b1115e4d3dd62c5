#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
pub mod handler;
pub mod manager;
pub mod service;

pub use error::{Error, ErrorKind, Result};
pub use manager::{ManagerConfig, PipelineTaskManager, Submission};
pub use service::ServiceState;

/// Tracing target for server operations.
pub const TRACING_TARGET: &str = "surveyor_server";
