//! The pipeline task manager: submission, preparation, watching.
//!
//! `submit` creates the task record and returns immediately; a per-task
//! preparation worker assembles the input payload (topic search/crawl or
//! input file), hands the task to the shared pipeline, and a watcher
//! polls the result store until completion or timeout. The pipeline
//! runtime itself never touches task records; every status written here
//! goes through the registry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use jiff::Timestamp;
use serde_json::json;
use surveyor_core::{ResultStore, TaskStatus, TaskStore};
use surveyor_pipeline::{SurveyPipeline, TopicProcessor};
use tokio::time::Instant;
use uuid::Uuid;

use crate::TRACING_TARGET;
use crate::error::{ErrorKind, Result};

/// Default watcher poll interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default task timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timing knobs of the task manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between result store polls.
    pub check_interval: Duration,
    /// Ceiling on total task wall-clock time before TIMEOUT.
    pub timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// What `submit` returns to the API layer.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The new task id.
    pub task_id: String,
    /// Topic as submitted.
    pub original_topic: String,
    /// Unique result key: `<topic>_<task_id>_<timestamp>`.
    pub expected_result_key: String,
}

/// Drives submitted tasks through their lifecycle.
pub struct PipelineTaskManager {
    // Self-handle for spawning preparation and watcher tasks.
    this: Weak<PipelineTaskManager>,
    tasks: Arc<dyn TaskStore>,
    results: Arc<dyn ResultStore>,
    pipeline: Arc<SurveyPipeline>,
    topic_processor: Option<Arc<dyn TopicProcessor>>,
    config: ManagerConfig,
}

impl PipelineTaskManager {
    /// Creates a manager. Topic submissions require a topic processor;
    /// without one they fail at preparation time.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        results: Arc<dyn ResultStore>,
        pipeline: Arc<SurveyPipeline>,
        topic_processor: Option<Arc<dyn TopicProcessor>>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            tasks,
            results,
            pipeline,
            topic_processor,
            config,
        })
    }

    fn handle(&self) -> Result<Arc<Self>> {
        self.this.upgrade().ok_or_else(|| {
            ErrorKind::Internal.with_message("task manager has been dropped")
        })
    }

    /// Accepts a submission: creates the record, spawns preparation and
    /// returns the task id.
    pub async fn submit(&self, params: serde_json::Value) -> Result<Submission> {
        let task_id = Uuid::new_v4().to_string();
        let original_topic = params
            .get("topic")
            .and_then(|topic| topic.as_str())
            .unwrap_or("unnamed_survey")
            .to_string();
        let stamp = Timestamp::now().strftime("%Y%m%d_%H%M%S").to_string();
        let expected_result_key = format!("{original_topic}_{task_id}_{stamp}");

        let mut extended = params.clone();
        if let Some(object) = extended.as_object_mut() {
            object.insert("original_topic".to_string(), json!(original_topic));
            object.insert(
                "expected_result_key".to_string(),
                json!(expected_result_key),
            );
        }

        self.tasks.create(&task_id, extended).await?;
        self.tasks
            .update_field(&task_id, "original_topic", json!(original_topic))
            .await?;
        self.tasks
            .update_field(
                &task_id,
                "expected_result_key",
                json!(expected_result_key),
            )
            .await?;
        if let Some(user_id) = params.get("user_id").and_then(|user| user.as_str()) {
            self.tasks
                .update_field(&task_id, "user_id", json!(user_id))
                .await?;
        }

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %task_id,
            topic = %original_topic,
            "Task submitted"
        );

        let manager = self.handle()?;
        let spawn_id = task_id.clone();
        tokio::spawn(async move {
            manager.run_preparation(spawn_id).await;
        });

        Ok(Submission {
            task_id,
            original_topic,
            expected_result_key,
        })
    }

    /// Preparation worker body: build the input payload, then hand the
    /// task to the pipeline and start the watcher.
    async fn run_preparation(self: Arc<Self>, task_id: String) {
        if let Err(message) = self.prepare(&task_id).await {
            tracing::error!(
                target: TRACING_TARGET,
                task_id = %task_id,
                error = %message,
                "Task preparation failed"
            );
            let _ = self
                .tasks
                .update_status(&task_id, TaskStatus::Failed, Some(message))
                .await;
        }
    }

    async fn prepare(&self, task_id: &str) -> std::result::Result<(), String> {
        let record = self
            .tasks
            .get(task_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("task {task_id} does not exist"))?;
        let params = record.params;

        self.tasks
            .update_status(task_id, TaskStatus::Preparing, None)
            .await
            .map_err(|err| err.to_string())?;

        if let Some(topic) = params.get("topic").and_then(|topic| topic.as_str()) {
            let Some(processor) = &self.topic_processor else {
                return Err("topic submission is disabled: no search backend".to_string());
            };
            processor
                .process(task_id, topic, &params)
                .await
                .map_err(|err| format!("topic processing failed: {err}"))?;
        } else if let Some(path) = params.get("input_file").and_then(|path| path.as_str()) {
            let input = self.load_input_file(task_id, path).await?;
            self.results
                .save_crawl_results(task_id, input)
                .await
                .map_err(|err| err.to_string())?;
        } else {
            return Err("either topic or input_file must be provided".to_string());
        }

        // Both paths persist crawl results; an empty payload is a
        // preparation failure, not a pipeline failure.
        let crawl = self
            .results
            .get_crawl_results(task_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("no crawl results stored for task {task_id}"))?;
        let papers = crawl
            .get("papers")
            .and_then(|papers| papers.as_array())
            .map(Vec::len)
            .unwrap_or(0);
        if papers == 0 {
            return Err("input payload contains no papers".to_string());
        }

        self.tasks
            .update_status(task_id, TaskStatus::Processing, None)
            .await
            .map_err(|err| err.to_string())?;

        let manager = self.handle().map_err(|err| err.to_string())?;
        let watch_id = task_id.to_string();
        tokio::spawn(async move {
            manager.run_watcher(watch_id).await;
        });

        self.pipeline
            .submit_task(task_id)
            .await
            .map_err(|err| format!("pipeline submission failed: {err}"))?;

        tracing::info!(
            target: TRACING_TARGET,
            task_id = %task_id,
            papers,
            "Task submitted to pipeline"
        );
        Ok(())
    }

    /// Reads a JSONL input file into a crawl-results payload.
    ///
    /// Every line may carry a `papers` array; lines that fail to parse
    /// are skipped, matching the lenient legacy input format.
    async fn load_input_file(
        &self,
        task_id: &str,
        path: &str,
    ) -> std::result::Result<serde_json::Value, String> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| format!("failed to read input file {path}: {err}"))?;

        let mut title = String::new();
        let mut papers = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %task_id,
                    "Skipping unparsable input line"
                );
                continue;
            };
            if title.is_empty()
                && let Some(t) = value.get("title").and_then(|t| t.as_str())
            {
                title = t.to_string();
            }
            if let Some(found) = value.get("papers").and_then(|papers| papers.as_array()) {
                papers.extend(found.iter().cloned());
            }
        }

        Ok(json!({
            "title": if title.is_empty() { format!("survey_{task_id}") } else { title },
            "papers": papers,
        }))
    }

    /// Watcher body: poll the result store until completion or timeout,
    /// then clean per-task crawl artifacts.
    async fn run_watcher(self: Arc<Self>, task_id: String) {
        tracing::info!(
            target: TRACING_TARGET,
            task_id = %task_id,
            check_interval_secs = self.config.check_interval.as_secs_f64(),
            timeout_secs = self.config.timeout.as_secs_f64(),
            "Watcher started"
        );
        let started = Instant::now();

        loop {
            match self.results.get(&task_id).await {
                Ok(Some(record)) if record.is_completed() => {
                    let applied = self
                        .tasks
                        .update_status(&task_id, TaskStatus::Completed, None)
                        .await
                        .unwrap_or(false);
                    tracing::info!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        applied,
                        "Watcher observed completed result"
                    );
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        error = %err,
                        "Watcher failed to query result store"
                    );
                }
            }

            // A task already in a terminal state (failed elsewhere, or
            // deleted) no longer needs watching.
            match self.tasks.get(&task_id).await {
                Ok(Some(record)) if record.status.is_terminal() => {
                    tracing::info!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        status = %record.status,
                        "Watcher exiting on terminal task status"
                    );
                    break;
                }
                Ok(None) => {
                    tracing::info!(
                        target: TRACING_TARGET,
                        task_id = %task_id,
                        "Watcher exiting, task record is gone"
                    );
                    break;
                }
                _ => {}
            }

            if started.elapsed() >= self.config.timeout {
                let _ = self
                    .tasks
                    .update_status(
                        &task_id,
                        TaskStatus::Timeout,
                        Some("pipeline processing timed out".to_string()),
                    )
                    .await;
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %task_id,
                    "Watcher timed the task out"
                );
                break;
            }

            tokio::time::sleep(self.config.check_interval).await;
        }

        if let Err(err) = self.results.delete_crawl_results(&task_id).await {
            tracing::warn!(
                target: TRACING_TARGET,
                task_id = %task_id,
                error = %err,
                "Failed to clean crawl artifacts"
            );
        }
    }

    /// Watcher timing configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Convenience wrapper for handlers needing a 404 on unknown tasks.
    pub async fn require_task(
        &self,
        task_id: &str,
    ) -> Result<surveyor_core::TaskRecord> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| ErrorKind::NotFound.with_message(format!("task {task_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use async_trait::async_trait;
    use surveyor_core::{MemoryResultStore, MemoryTaskStore};
    use surveyor_pipeline::{
        ComposeError, ComposeRequest, DigestSynthesizer, OutlineRefiner, PipelineDeps,
        SectionComposer, SurveyPipelineConfig,
    };

    use super::*;

    struct StubOutliner;

    #[async_trait]
    impl OutlineRefiner for StubOutliner {
        async fn draft(
            &self,
            survey_title: &str,
            _abstracts: &std::collections::BTreeMap<String, (String, String)>,
        ) -> std::result::Result<String, ComposeError> {
            Ok(format!("# {survey_title}\n## Intro\n## Outlook\n"))
        }

        async fn refine(
            &self,
            _survey_title: &str,
            outline: &str,
            _digests: &str,
        ) -> std::result::Result<String, ComposeError> {
            Ok(outline.to_string())
        }
    }

    struct StubDigester;

    #[async_trait]
    impl DigestSynthesizer for StubDigester {
        async fn synthesize(
            &self,
            survey_title: &str,
            _outline: &str,
            _papers: &[surveyor_survey::Paper],
        ) -> std::result::Result<String, ComposeError> {
            Ok(format!("# {survey_title}\n## Intro\nfound\n## Outlook\nmore\n"))
        }
    }

    struct StubComposer;

    #[async_trait]
    impl SectionComposer for StubComposer {
        async fn compose(
            &self,
            request: &ComposeRequest,
        ) -> std::result::Result<String, ComposeError> {
            Ok(format!("{} body.", request.section_title))
        }
    }

    struct TestHarness {
        tasks: Arc<MemoryTaskStore>,
        results: Arc<MemoryResultStore>,
        pipeline: Arc<SurveyPipeline>,
        manager: Arc<PipelineTaskManager>,
    }

    fn harness(config: ManagerConfig) -> TestHarness {
        let tasks = Arc::new(MemoryTaskStore::default());
        let results = Arc::new(MemoryResultStore::new());
        let deps = PipelineDeps {
            results: results.clone(),
            outliner: Arc::new(StubOutliner),
            digester: Arc::new(StubDigester),
            composer: Arc::new(StubComposer),
        };
        let pipeline_config = SurveyPipelineConfig {
            worker_num: 2,
            queue_size: 4,
            harvest_interval: Duration::from_millis(20),
            ..SurveyPipelineConfig::default()
        };
        let pipeline =
            Arc::new(SurveyPipeline::init(pipeline_config, deps).expect("pipeline init"));
        pipeline.start().expect("pipeline start");
        let manager = PipelineTaskManager::new(
            tasks.clone(),
            results.clone(),
            pipeline.clone(),
            None,
            config,
        );
        TestHarness {
            tasks,
            results,
            pipeline,
            manager,
        }
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            check_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }

    fn input_file(papers: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        let papers: Vec<serde_json::Value> = (0..papers)
            .map(|index| {
                json!({"title": format!("Paper {index}"), "txt": format!("body {index}")})
            })
            .collect();
        writeln!(
            file,
            "{}",
            json!({"title": "File Survey", "papers": papers})
        )
        .expect("write temp file");
        file
    }

    async fn wait_for_status(
        tasks: &MemoryTaskStore,
        task_id: &str,
        status: TaskStatus,
        max: Duration,
    ) -> bool {
        let deadline = Instant::now() + max;
        while Instant::now() < deadline {
            if let Ok(Some(record)) = tasks.get(task_id).await
                && record.status == status
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn file_submission_completes_through_the_watcher() {
        let harness = harness(fast_config());
        let file = input_file(2);

        let submission = harness
            .manager
            .submit(json!({"input_file": file.path().to_string_lossy()}))
            .await
            .unwrap();
        assert!(submission.expected_result_key.contains(&submission.task_id));

        assert!(
            wait_for_status(
                &harness.tasks,
                &submission.task_id,
                TaskStatus::Completed,
                Duration::from_secs(15),
            )
            .await,
            "task should complete"
        );
        let record = harness.tasks.get(&submission.task_id).await.unwrap().unwrap();
        assert!(record.execution_seconds.is_some());
        assert!(harness.results.get(&submission.task_id).await.unwrap().is_some());
        // Crawl artifacts are swept once the watcher finishes.
        assert!(
            harness
                .results
                .get_crawl_results(&submission.task_id)
                .await
                .unwrap()
                .is_none()
        );
        harness.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_inputs_fail_preparation() {
        let harness = harness(fast_config());
        let submission = harness.manager.submit(json!({})).await.unwrap();
        assert!(
            wait_for_status(
                &harness.tasks,
                &submission.task_id,
                TaskStatus::Failed,
                Duration::from_secs(5),
            )
            .await
        );
        let record = harness.tasks.get(&submission.task_id).await.unwrap().unwrap();
        assert!(record.error.unwrap().contains("topic or input_file"));
        harness.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_input_files_fail_preparation() {
        let harness = harness(fast_config());
        let file = input_file(0);
        let submission = harness
            .manager
            .submit(json!({"input_file": file.path().to_string_lossy()}))
            .await
            .unwrap();
        assert!(
            wait_for_status(
                &harness.tasks,
                &submission.task_id,
                TaskStatus::Failed,
                Duration::from_secs(5),
            )
            .await
        );
        harness.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn watcher_times_out_when_no_result_appears() {
        // The payload never reaches the result store: crawl results are
        // planted directly and the task skips the pipeline entirely.
        let harness = harness(ManagerConfig {
            check_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
        });

        harness
            .tasks
            .create("stuck", json!({"topic": "t"}))
            .await
            .unwrap();
        let manager = harness.manager.clone();
        tokio::spawn(async move {
            manager.run_watcher("stuck".to_string()).await;
        });

        assert!(
            wait_for_status(
                &harness.tasks,
                "stuck",
                TaskStatus::Timeout,
                Duration::from_secs(4),
            )
            .await,
            "watcher must set TIMEOUT within twice the timeout"
        );

        // The terminal state is stable: no COMPLETED appears afterwards.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let record = harness.tasks.get("stuck").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Timeout);
        harness.pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn watcher_respects_foreign_terminal_states() {
        let harness = harness(ManagerConfig {
            check_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(30),
        });
        harness
            .tasks
            .create("doomed", json!({"topic": "t"}))
            .await
            .unwrap();
        harness
            .tasks
            .update_status("doomed", TaskStatus::Failed, Some("external".into()))
            .await
            .unwrap();

        let manager = harness.manager.clone();
        let watcher = tokio::spawn(async move {
            manager.run_watcher("doomed".to_string()).await;
        });
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher exits promptly on terminal status")
            .unwrap();

        let record = harness.tasks.get("doomed").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        harness.pipeline.shutdown().await.unwrap();
    }
}
