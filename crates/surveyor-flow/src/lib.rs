#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
pub mod monitor;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod retry;

pub use error::{BoxError, Error, NodeFailure, Result};
pub use monitor::{Monitor, NodeMetrics};
pub use node::{
    FlowItem, Middleware, Node, NodeConfig, Packet, PacketHandler, PacketHook, Predicate,
};
pub use pipeline::{Pipeline, Sequential, Stage};
pub use queue::{Queue, Signal};
pub use retry::RetryPolicy;

/// Tracing target for flow runtime operations.
pub const TRACING_TARGET: &str = "surveyor_flow";
