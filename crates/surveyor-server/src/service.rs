//! Shared service state for handlers and workers.

use std::sync::Arc;

use surveyor_core::{ResultStore, TaskStore};
use surveyor_pipeline::SurveyPipeline;

use crate::manager::PipelineTaskManager;

/// Application state shared by every handler.
#[derive(Clone)]
pub struct ServiceState {
    /// The durable task registry.
    pub tasks: Arc<dyn TaskStore>,
    /// The durable result store.
    pub results: Arc<dyn ResultStore>,
    /// The process-scoped survey pipeline.
    pub pipeline: Arc<SurveyPipeline>,
    /// The task lifecycle manager.
    pub manager: Arc<PipelineTaskManager>,
}

impl ServiceState {
    /// Bundles the service collaborators.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        results: Arc<dyn ResultStore>,
        pipeline: Arc<SurveyPipeline>,
        manager: Arc<PipelineTaskManager>,
    ) -> Self {
        Self {
            tasks,
            results,
            pipeline,
            manager,
        }
    }
}
