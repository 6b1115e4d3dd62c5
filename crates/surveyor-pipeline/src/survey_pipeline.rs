//! The process-scoped survey pipeline.
//!
//! One pipeline instance serves every task in the process: encode →
//! refine → decode, plus the harvester task that feeds ready sections
//! into the decode interior. The pipeline is created with
//! [`SurveyPipeline::init`] and torn down with
//! [`SurveyPipeline::shutdown`]; nothing starts at module load.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use surveyor_core::ResultStore;
use surveyor_flow::{Node, NodeMetrics, Pipeline};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::TRACING_TARGET;
use crate::decode::{DecodeStage, SurveyRegistry};
use crate::error::Result;
use crate::seam::{
    DEFAULT_COMPOSE_RETRIES, DigestSynthesizer, OutlineRefiner, SectionComposer,
};
use crate::unit::Unit;
use crate::{encode, refine};

/// Knobs of the survey pipeline.
#[derive(Debug, Clone)]
pub struct SurveyPipelineConfig {
    /// Workers per node.
    pub worker_num: usize,
    /// Payload capacity of each node queue.
    pub queue_size: usize,
    /// Papers per digest group.
    pub digest_group_size: usize,
    /// Outline refinement passes per survey.
    pub refine_passes: usize,
    /// Retry budget for retryable compose errors.
    pub compose_retries: usize,
    /// Interval between harvester scans of the in-flight registry.
    pub harvest_interval: Duration,
}

impl Default for SurveyPipelineConfig {
    fn default() -> Self {
        Self {
            worker_num: 4,
            queue_size: 4,
            digest_group_size: 4,
            refine_passes: 1,
            compose_retries: DEFAULT_COMPOSE_RETRIES,
            harvest_interval: Duration::from_secs(1),
        }
    }
}

/// External collaborators the pipeline stages call into.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Result store: crawl results in, finished surveys out.
    pub results: Arc<dyn ResultStore>,
    /// Outline drafting and refinement.
    pub outliner: Arc<dyn OutlineRefiner>,
    /// Digest construction.
    pub digester: Arc<dyn DigestSynthesizer>,
    /// Section composition.
    pub composer: Arc<dyn SectionComposer>,
}

/// The assembled survey pipeline.
pub struct SurveyPipeline {
    pipeline: Pipeline<Unit>,
    registry: SurveyRegistry,
    compose_node: Arc<Node<Unit>>,
    harvest_interval: Duration,
    cancel_token: CancellationToken,
    harvester: Mutex<Option<JoinHandle<()>>>,
}

impl SurveyPipeline {
    /// Assembles the pipeline topology without starting any worker.
    pub fn init(config: SurveyPipelineConfig, deps: PipelineDeps) -> Result<Self> {
        let registry = SurveyRegistry::new();
        let encode_stage = encode::build(
            &config,
            deps.results.clone(),
            deps.outliner.clone(),
            deps.digester.clone(),
        );
        let refine_stage = refine::build(&config, deps.outliner.clone());
        let DecodeStage {
            sequential: decode_stage,
            compose: compose_node,
        } = DecodeStage::build(
            &config,
            registry.clone(),
            deps.composer.clone(),
            deps.results.clone(),
        );

        let pipeline = Pipeline::new(
            "survey",
            vec![
                Box::new(encode_stage),
                Box::new(refine_stage),
                Box::new(decode_stage),
            ],
        );

        Ok(Self {
            pipeline,
            registry,
            compose_node,
            harvest_interval: config.harvest_interval,
            cancel_token: CancellationToken::new(),
            harvester: Mutex::new(None),
        })
    }

    /// Starts every node and the section harvester.
    pub fn start(&self) -> Result<()> {
        self.pipeline.start()?;

        let registry = self.registry.clone();
        let compose_node = self.compose_node.clone();
        let interval = self.harvest_interval;
        let cancel_token = self.cancel_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    () = cancel_token.cancelled() => {
                        tracing::debug!(
                            target: TRACING_TARGET,
                            "Harvester stopped"
                        );
                        break;
                    }

                    _ = ticker.tick() => {
                        for section in registry.harvest().await {
                            if compose_node.put(Unit::Section(section)).await.is_err() {
                                tracing::warn!(
                                    target: TRACING_TARGET,
                                    "Compose queue closed, stopping harvester"
                                );
                                return;
                            }
                        }
                    }
                }
            }
        });
        *self
            .harvester
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            target: TRACING_TARGET,
            "Survey pipeline started"
        );
        Ok(())
    }

    /// Feeds a task handle into the pipeline head.
    pub async fn submit_task(&self, task_id: &str) -> Result<()> {
        self.pipeline.put(Unit::Task(task_id.to_string())).await?;
        Ok(())
    }

    /// Signals end-of-stream and waits for every node to drain.
    ///
    /// The harvester stops first, while the pipeline is still consuming,
    /// so it can never wedge on a queue without consumers. Surveys still
    /// in flight at this point are abandoned; their task records move to
    /// TIMEOUT through the watcher.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(
            target: TRACING_TARGET,
            "Shutting down survey pipeline"
        );
        self.cancel_token.cancel();
        let handle = self
            .harvester
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pipeline.end().await?;
        self.pipeline.join().await;
        Ok(())
    }

    /// Returns whether any pipeline node is running.
    pub fn is_running(&self) -> bool {
        self.pipeline.is_running()
    }

    /// Metrics for every node, for the status endpoints and monitor.
    pub fn metrics(&self) -> Vec<NodeMetrics> {
        self.pipeline.metrics()
    }

    /// Number of surveys currently being decoded.
    pub async fn in_flight(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use surveyor_core::{MemoryResultStore, ResultStore};

    use super::*;
    use crate::encode::tests::{StubComposer, StubDigester, StubOutliner};

    fn deps(results: Arc<MemoryResultStore>) -> PipelineDeps {
        PipelineDeps {
            results,
            outliner: Arc::new(StubOutliner),
            digester: Arc::new(StubDigester),
            composer: Arc::new(StubComposer),
        }
    }

    fn config() -> SurveyPipelineConfig {
        SurveyPipelineConfig {
            worker_num: 2,
            queue_size: 4,
            digest_group_size: 2,
            refine_passes: 1,
            compose_retries: 2,
            harvest_interval: Duration::from_millis(20),
        }
    }

    async fn crawl_blob(results: &MemoryResultStore, task_id: &str) {
        results
            .save_crawl_results(
                task_id,
                serde_json::json!({
                    "title": "Graph Surveys",
                    "papers": [
                        {"title": "Alpha Paper", "txt": "alpha body"},
                        {"title": "Beta Paper", "txt": "beta body"},
                    ],
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn task_flows_end_to_end_into_the_result_store() {
        let results = Arc::new(MemoryResultStore::new());
        crawl_blob(&results, "task-1").await;

        let pipeline = SurveyPipeline::init(config(), deps(results.clone())).unwrap();
        pipeline.start().unwrap();
        pipeline.submit_task("task-1").await.unwrap();

        let mut saved = None;
        for _ in 0..200 {
            if let Some(record) = results.get("task-1").await.unwrap() {
                saved = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let record = saved.expect("survey reaches the result store");
        assert!(record.is_completed());
        assert_eq!(record.title, "Graph Surveys");
        assert_eq!(record.metadata.references_count, 2);
        // The stub composer cites the first bibkey; renumbering makes it [1].
        let content = record.survey_data["content"].as_str().unwrap();
        assert!(content.contains("[1]"));
        assert!(content.contains("## References"));

        pipeline.shutdown().await.unwrap();
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.in_flight().await, 0);
    }

    #[tokio::test]
    async fn two_tasks_produce_two_distinct_results() {
        let results = Arc::new(MemoryResultStore::new());
        crawl_blob(&results, "task-a").await;
        crawl_blob(&results, "task-b").await;

        let pipeline = SurveyPipeline::init(config(), deps(results.clone())).unwrap();
        pipeline.start().unwrap();
        pipeline.submit_task("task-a").await.unwrap();
        pipeline.submit_task("task-b").await.unwrap();

        let mut found = 0;
        for _ in 0..200 {
            let mut count = 0;
            for id in ["task-a", "task-b"] {
                if results.get(id).await.unwrap().is_some() {
                    count += 1;
                }
            }
            found = count;
            if found == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(found, 2);

        let a = results.get("task-a").await.unwrap().unwrap();
        let b = results.get("task-b").await.unwrap().unwrap();
        assert_ne!(a.task_id, b.task_id);
        pipeline.shutdown().await.unwrap();
    }
}
