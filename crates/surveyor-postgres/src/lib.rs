#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Embeds all migrations into the final binary.
pub(crate) const MIGRATIONS: diesel_migrations::EmbeddedMigrations =
    diesel_migrations::embed_migrations!();

/// Tracing target for client and connection operations.
pub const TRACING_TARGET_CLIENT: &str = "surveyor_postgres::client";

/// Tracing target for query operations.
pub const TRACING_TARGET_QUERY: &str = "surveyor_postgres::query";

mod client;
mod error;
pub mod model;
pub mod query;
mod schema;
mod store;

pub use diesel_async::AsyncPgConnection as PgConnection;

pub use crate::client::{PgClient, PgConfig, PgPoolStatus, PooledConnection};
pub use crate::error::{PgError, PgResult};
pub use crate::store::{PgResultStore, PgTaskStore};
