#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod codec;
mod store;

pub use store::{RedisConfig, RedisTaskStore};

/// Tracing target for Redis store operations.
pub const TRACING_TARGET: &str = "surveyor_redis";
