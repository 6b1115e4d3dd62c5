//! Sequential and pipeline composites.
//!
//! A [`Sequential`] chains nodes head-to-tail; a [`Pipeline`] chains
//! stages (sequentials or single nodes) the same way. Both expose the
//! head's `put`, end-of-stream via one stop at the head, and iteration
//! over member nodes for monitoring.

use std::sync::Arc;

use crate::TRACING_TARGET;
use crate::error::Result;
use crate::monitor::NodeMetrics;
use crate::node::{FlowItem, Node};

/// A composite member of a [`Pipeline`]: either a single node or a
/// [`Sequential`] of nodes, exposed as one head/tail pair.
pub trait Stage<T: FlowItem>: Send + Sync {
    /// Stage name for logs and metrics.
    fn name(&self) -> &str;

    /// The node receiving this stage's input.
    fn head(&self) -> &Arc<Node<T>>;

    /// The node producing this stage's output.
    fn tail(&self) -> &Arc<Node<T>>;

    /// All member nodes in topological order.
    fn nodes(&self) -> Vec<Arc<Node<T>>>;
}

impl<T: FlowItem> Stage<T> for Arc<Node<T>> {
    fn name(&self) -> &str {
        Node::name(self)
    }

    fn head(&self) -> &Arc<Node<T>> {
        self
    }

    fn tail(&self) -> &Arc<Node<T>> {
        self
    }

    fn nodes(&self) -> Vec<Arc<Node<T>>> {
        vec![Arc::clone(self)]
    }
}

/// An ordered chain of nodes connected head-to-tail.
pub struct Sequential<T: FlowItem> {
    name: String,
    nodes: Vec<Arc<Node<T>>>,
}

impl<T: FlowItem> Sequential<T> {
    /// Creates a sequential composite, connecting consecutive nodes.
    ///
    /// # Panics
    ///
    /// Panics when `nodes` is empty; a composite without a head has no
    /// meaningful contract.
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node<T>>>) -> Self {
        assert!(!nodes.is_empty(), "sequential composite requires nodes");
        for pair in nodes.windows(2) {
            pair[0].connect(&pair[1]);
        }
        for (index, node) in nodes.iter().enumerate() {
            node.set_serial(vec![index]);
        }
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Starts every member node, leaves (tail) first so an upstream never
    /// runs ahead of a downstream that is not yet accepting work.
    pub fn start(&self) -> Result<()> {
        for node in self.nodes.iter().rev() {
            node.start()?;
        }
        tracing::info!(
            target: TRACING_TARGET,
            composite = %self.name,
            nodes = self.nodes.len(),
            "Sequential started"
        );
        Ok(())
    }

    /// Enqueues one stop at the head; propagation does the rest.
    pub async fn end(&self) -> Result<()> {
        self.head().end().await
    }

    /// Delegates to the head node.
    pub async fn put(&self, value: T) -> Result<()> {
        self.head().put(value).await
    }

    /// Waits until every member node has fully stopped.
    pub async fn join(&self) {
        for node in &self.nodes {
            node.join().await;
        }
    }

    /// Returns whether any member node is still running.
    pub fn is_running(&self) -> bool {
        self.nodes.iter().any(|node| node.is_running())
    }

    /// Metrics for every member node.
    pub fn metrics(&self) -> Vec<NodeMetrics> {
        self.nodes.iter().map(|node| node.metrics()).collect()
    }
}

impl<T: FlowItem> Stage<T> for Sequential<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn head(&self) -> &Arc<Node<T>> {
        &self.nodes[0]
    }

    fn tail(&self) -> &Arc<Node<T>> {
        self.nodes.last().expect("sequential is never empty")
    }

    fn nodes(&self) -> Vec<Arc<Node<T>>> {
        self.nodes.clone()
    }
}

/// A chain of stages composed into one dataflow with a single head and
/// tail. The process-scoped survey pipeline is one of these.
pub struct Pipeline<T: FlowItem> {
    name: String,
    stages: Vec<Box<dyn Stage<T>>>,
}

impl<T: FlowItem> Pipeline<T> {
    /// Creates a pipeline, connecting each stage's tail to the next
    /// stage's head and assigning serial numbers by position.
    ///
    /// # Panics
    ///
    /// Panics when `stages` is empty.
    pub fn new(name: impl Into<String>, stages: Vec<Box<dyn Stage<T>>>) -> Self {
        assert!(!stages.is_empty(), "pipeline requires stages");
        for pair in stages.windows(2) {
            pair[0].tail().connect(pair[1].head());
        }
        for (stage_index, stage) in stages.iter().enumerate() {
            for (node_index, node) in stage.nodes().iter().enumerate() {
                node.set_serial(vec![stage_index, node_index]);
            }
        }
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts every node, last stage first.
    pub fn start(&self) -> Result<()> {
        for stage in self.stages.iter().rev() {
            for node in stage.nodes().iter().rev() {
                node.start()?;
            }
        }
        tracing::info!(
            target: TRACING_TARGET,
            pipeline = %self.name,
            stages = self.stages.len(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Enqueues one stop at the pipeline head.
    pub async fn end(&self) -> Result<()> {
        self.stages[0].head().end().await
    }

    /// Feeds a value into the pipeline head.
    pub async fn put(&self, value: T) -> Result<()> {
        self.stages[0].head().put(value).await
    }

    /// Waits until every node in every stage has stopped.
    pub async fn join(&self) {
        for stage in &self.stages {
            for node in stage.nodes() {
                node.join().await;
            }
        }
    }

    /// Returns whether any node of any stage is still running.
    pub fn is_running(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.nodes().iter().any(|node| node.is_running()))
    }

    /// The node producing the pipeline output.
    pub fn tail(&self) -> &Arc<Node<T>> {
        self.stages.last().expect("pipeline is never empty").tail()
    }

    /// All member nodes across stages.
    pub fn nodes(&self) -> Vec<Arc<Node<T>>> {
        self.stages.iter().flat_map(|stage| stage.nodes()).collect()
    }

    /// Metrics for every member node across stages.
    pub fn metrics(&self) -> Vec<NodeMetrics> {
        self.nodes().iter().map(|node| node.metrics()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::node::NodeConfig;
    use crate::retry::RetryPolicy;

    fn identity(name: &str, workers: usize, queue_size: usize) -> Arc<Node<i64>> {
        Node::new(
            name,
            NodeConfig::new()
                .with_workers(workers)
                .with_queue_size(queue_size)
                .with_idle_poll(Duration::from_millis(10)),
            |value: i64| async move { Ok(Some(value)) },
        )
    }

    fn counting_sink(
        name: &str,
        workers: usize,
        queue_size: usize,
        sink: Arc<Mutex<Vec<i64>>>,
    ) -> Arc<Node<i64>> {
        Node::new(
            name,
            NodeConfig::new()
                .with_workers(workers)
                .with_queue_size(queue_size)
                .with_idle_poll(Duration::from_millis(10))
                .no_output(),
            move |value: i64| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(value);
                    Ok(None)
                }
            },
        )
    }

    #[tokio::test]
    async fn sequential_propagates_stop_and_loses_nothing() {
        // Stop under load: 3 producer workers, 4 consumer workers, queue
        // capacity 2, 1000 items.
        let received = Arc::new(Mutex::new(Vec::new()));
        let producer = identity("producer", 3, 2);
        let middle = identity("middle", 4, 2);
        let sink = counting_sink("sink", 4, 2, received.clone());

        let chain = Sequential::new("chain", vec![producer, middle, sink]);
        chain.start().unwrap();

        for value in 0..1000 {
            chain.put(value).await.unwrap();
        }
        chain.end().await.unwrap();
        chain.join().await;

        let mut received = received.lock().unwrap().clone();
        received.sort_unstable();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
        assert!(!chain.is_running());
        for metrics in chain.metrics() {
            assert!(!metrics.is_running);
            assert_eq!(metrics.executing_count, 0);
        }
    }

    #[tokio::test]
    async fn pipeline_chains_stages() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let double = Node::new(
            "double",
            NodeConfig::new().with_idle_poll(Duration::from_millis(10)),
            |value: i64| async move { Ok(Some(value * 2)) },
        );
        let add_one = Node::new(
            "add_one",
            NodeConfig::new().with_idle_poll(Duration::from_millis(10)),
            |value: i64| async move { Ok(Some(value + 1)) },
        );
        let sink = counting_sink("sink", 1, 1, received.clone());

        let front = Sequential::new("front", vec![double, add_one]);
        let pipeline = Pipeline::new("pipeline", vec![Box::new(front), Box::new(sink)]);
        pipeline.start().unwrap();

        for value in [1, 2, 3] {
            pipeline.put(value).await.unwrap();
        }
        pipeline.end().await.unwrap();
        pipeline.join().await;

        assert_eq!(*received.lock().unwrap(), vec![3, 5, 7]);
    }

    #[tokio::test]
    async fn error_quarantine_keeps_successful_items_flowing() {
        // Items divisible by 3 fail; everything else must still reach the
        // tail through skip_errors relays.
        let received = Arc::new(Mutex::new(Vec::new()));
        let shaky = Node::new(
            "shaky",
            NodeConfig::new()
                .with_workers(2)
                .with_queue_size(2)
                .with_idle_poll(Duration::from_millis(10))
                .with_retry(RetryPolicy::none()),
            |value: i64| async move {
                if value % 3 == 0 {
                    Err::<Option<i64>, crate::BoxError>("mod three".into())
                } else {
                    Ok(Some(value))
                }
            },
        );
        let relay = identity("relay", 2, 2);
        let sink = counting_sink("sink", 2, 2, received.clone());

        let chain = Sequential::new("chain", vec![shaky, relay, sink]);
        chain.start().unwrap();

        for value in 1..=30 {
            chain.put(value).await.unwrap();
        }
        chain.end().await.unwrap();
        chain.join().await;

        let mut received = received.lock().unwrap().clone();
        received.sort_unstable();
        let expected: Vec<i64> = (1..=30).filter(|value| value % 3 != 0).collect();
        assert_eq!(received, expected);
    }
}
