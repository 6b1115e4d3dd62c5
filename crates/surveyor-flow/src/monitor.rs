//! Node metrics and the periodic pipeline monitor.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;

/// Observable state of a single node, safe to sample while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Node name.
    pub name: String,
    /// Dotted topology serial number (`stage.node`).
    pub serial: String,
    /// Whether any worker of the node is alive.
    pub is_running: bool,
    /// Buffered signals in the input queue.
    pub queue_size: usize,
    /// Payload capacity of the input queue.
    pub max_queue_size: usize,
    /// Items currently being processed.
    pub executing_count: usize,
    /// Configured worker count.
    pub worker_count: usize,
}

/// Provider of metric snapshots, registered on a [`Monitor`].
pub type MetricsProvider = Arc<dyn Fn() -> Vec<NodeMetrics> + Send + Sync>;

/// Periodic reporter logging the registered pipelines' node metrics.
///
/// The report interval is coarse by design; the monitor is for operators
/// reading logs, not for scraping.
pub struct Monitor {
    interval: Duration,
    providers: Vec<(String, MetricsProvider)>,
}

impl Monitor {
    /// Creates a monitor with the given report interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            providers: Vec::new(),
        }
    }

    /// Registers a metrics provider under a pipeline name.
    pub fn register(&mut self, name: impl Into<String>, provider: MetricsProvider) {
        self.providers.push((name.into(), provider));
    }

    /// Spawns the reporting loop; it stops when the token is cancelled.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    () = cancel_token.cancelled() => {
                        tracing::debug!(
                            target: TRACING_TARGET,
                            "Monitor stopped"
                        );
                        break;
                    }

                    _ = ticker.tick() => self.report(),
                }
            }
        })
    }

    fn report(&self) {
        for (pipeline, provider) in &self.providers {
            for metrics in provider() {
                tracing::info!(
                    target: TRACING_TARGET,
                    pipeline = %pipeline,
                    node = %metrics.name,
                    serial = %metrics.serial,
                    is_running = metrics.is_running,
                    queue_size = metrics.queue_size,
                    max_queue_size = metrics.max_queue_size,
                    executing = metrics.executing_count,
                    workers = metrics.worker_count,
                    "Node status"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_stops_on_cancellation() {
        let mut monitor = Monitor::new(Duration::from_millis(5));
        monitor.register(
            "test",
            Arc::new(|| {
                vec![NodeMetrics {
                    name: "node".into(),
                    serial: "0".into(),
                    is_running: true,
                    queue_size: 0,
                    max_queue_size: 1,
                    executing_count: 0,
                    worker_count: 1,
                }]
            }),
        );

        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn metrics_serialize_to_snake_case_fields() {
        let metrics = NodeMetrics {
            name: "compose".into(),
            serial: "1.2".into(),
            is_running: true,
            queue_size: 3,
            max_queue_size: 8,
            executing_count: 2,
            worker_count: 4,
        };
        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["max_queue_size"], 8);
        assert_eq!(value["serial"], "1.2");
    }
}
