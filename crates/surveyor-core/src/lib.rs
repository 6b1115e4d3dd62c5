#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod memory;
pub mod status;
pub mod store;
pub mod task;

pub use memory::{MemoryResultStore, MemoryTaskStore};
pub use status::TaskStatus;
pub use store::{
    ResultMetadata, ResultRecord, ResultStats, ResultStore, StoreError, StoreResult, TaskStore,
};
pub use task::{DEFAULT_EXPIRE_SECONDS, TaskRecord};

/// Tracing target for task lifecycle operations.
pub const TRACING_TARGET: &str = "surveyor_core";
