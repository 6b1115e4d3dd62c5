//! CLI configuration.
//!
//! Everything can be set via flags or environment variables; `--help`
//! lists both. Missing required settings (a Postgres URL for the
//! postgres backend, for example) abort startup with a clear message.

use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use surveyor_pipeline::SurveyPipelineConfig;
use surveyor_redis::RedisConfig;
use surveyor_server::ManagerConfig;

/// Complete CLI configuration for the surveyor server.
#[derive(Debug, Clone, Parser)]
#[command(name = "surveyor")]
#[command(about = "Survey generation pipeline server")]
#[command(version)]
pub struct Cli {
    /// Network binding.
    #[clap(flatten)]
    pub server: ServerConfig,

    /// Task registry and result store backends.
    #[clap(flatten)]
    pub store: StoreConfig,

    /// Pipeline and watcher knobs.
    #[clap(flatten)]
    pub pipeline: PipelineConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct ServerConfig {
    /// Address to bind the HTTP server on.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the HTTP server on.
    #[arg(long, env = "PORT", default_value_t = 5001)]
    pub port: u16,
}

impl ServerConfig {
    /// The socket address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which backend holds the task registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskStoreBackend {
    /// Redis hashes with per-key TTL.
    Redis,
    /// The `tasks` table in PostgreSQL.
    Postgres,
    /// Process-local memory; for development only.
    Memory,
}

/// Store backend configuration.
#[derive(Debug, Clone, Args)]
pub struct StoreConfig {
    /// Task registry backend.
    #[arg(long = "task-store", env = "TASK_STORE", value_enum, default_value = "redis")]
    pub task_store: TaskStoreBackend,

    /// PostgreSQL connection URL. Required for the postgres task store
    /// and for the durable result store.
    #[arg(long = "postgres-url", env = "POSTGRES_URL")]
    pub postgres_url: Option<String>,

    /// Redis settings, used when the task store is `redis`.
    #[clap(flatten)]
    pub redis: RedisConfig,
}

/// Pipeline, manager and monitor knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct PipelineConfig {
    /// Workers per pipeline node.
    #[arg(long = "pipeline-workers", env = "PIPELINE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Payload capacity of each node queue.
    #[arg(long = "pipeline-queue-size", env = "PIPELINE_QUEUE_SIZE", default_value_t = 4)]
    pub queue_size: usize,

    /// Papers per digest group.
    #[arg(long = "digest-group-size", env = "DIGEST_GROUP_SIZE", default_value_t = 4)]
    pub digest_group_size: usize,

    /// Outline refinement passes per survey.
    #[arg(long = "refine-passes", env = "REFINE_PASSES", default_value_t = 1)]
    pub refine_passes: usize,

    /// Watcher poll interval in seconds.
    #[arg(long = "check-interval-secs", env = "CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub check_interval_secs: u64,

    /// Task timeout in seconds.
    #[arg(long = "task-timeout-secs", env = "TASK_TIMEOUT_SECS", default_value_t = 3600)]
    pub task_timeout_secs: u64,

    /// Interval between pipeline status reports in seconds.
    #[arg(long = "monitor-interval-secs", env = "MONITOR_INTERVAL_SECS", default_value_t = 60)]
    pub monitor_interval_secs: u64,
}

impl PipelineConfig {
    /// Maps the CLI knobs onto the pipeline configuration.
    pub fn survey_pipeline_config(&self) -> SurveyPipelineConfig {
        SurveyPipelineConfig {
            worker_num: self.workers,
            queue_size: self.queue_size,
            digest_group_size: self.digest_group_size,
            refine_passes: self.refine_passes,
            ..SurveyPipelineConfig::default()
        }
    }

    /// Maps the CLI knobs onto the manager configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            timeout: Duration::from_secs(self.task_timeout_secs),
        }
    }

    /// The monitor report interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_arguments() {
        let cli = Cli::parse_from(["surveyor"]);
        assert_eq!(cli.server.bind_addr(), "127.0.0.1:5001");
        assert_eq!(cli.store.task_store, TaskStoreBackend::Redis);
        assert_eq!(cli.pipeline.check_interval_secs, 30);
        assert_eq!(cli.pipeline.task_timeout_secs, 3600);
    }

    #[test]
    fn backend_flag_selects_the_store() {
        let cli = Cli::parse_from(["surveyor", "--task-store", "memory"]);
        assert_eq!(cli.store.task_store, TaskStoreBackend::Memory);
    }
}
