//! HTTP API handlers.
//!
//! Success envelopes carry `success: true`; failures use the shared
//! `{success: false, error}` shape with a matching 4xx/5xx status.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use surveyor_core::{ResultStats, ResultStore, TaskRecord, TaskStatus, TaskStore};
use surveyor_flow::NodeMetrics;

use crate::TRACING_TARGET;
use crate::error::{ErrorKind, Result};
use crate::service::ServiceState;

/// Builds the API router over the service state.
pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/api/task/submit", post(submit_task))
        .route("/api/task/{task_id}", get(get_task).delete(delete_task))
        .route("/api/task/{task_id}/pipeline_status", get(task_pipeline_status))
        .route("/api/global_pipeline_status", get(global_pipeline_status))
        .route("/api/tasks", get(list_tasks))
        .route("/api/output/{task_id}", get(task_output))
        .route("/api/database/stats", get(database_stats))
        .route("/api/database/health", get(database_health))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    success: bool,
    task_id: String,
    message: String,
    output_file: Option<String>,
    original_topic: String,
    unique_survey_title: String,
}

async fn submit_task(
    State(state): State<ServiceState>,
    Json(params): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    if !params.is_object() {
        return Err(ErrorKind::BadRequest.with_message("request body must be a JSON object"));
    }

    let submission = state.manager.submit(params).await?;
    tracing::info!(
        target: TRACING_TARGET,
        task_id = %submission.task_id,
        "Submission accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            success: true,
            task_id: submission.task_id,
            message: "task accepted".to_string(),
            output_file: None,
            original_topic: submission.original_topic,
            unique_survey_title: submission.expected_result_key,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct TaskEnvelope {
    success: bool,
    task: TaskRecord,
}

async fn get_task(
    State(state): State<ServiceState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskEnvelope>> {
    let task = state.manager.require_task(&task_id).await?;
    Ok(Json(TaskEnvelope {
        success: true,
        task,
    }))
}

async fn delete_task(
    State(state): State<ServiceState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let existed = state.tasks.delete(&task_id).await?;
    if !existed {
        return Err(ErrorKind::NotFound.with_message(format!("task {task_id} not found")));
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("task {task_id} deleted"),
    })))
}

#[derive(Debug, Serialize)]
struct PipelineStatusResponse {
    success: bool,
    pipeline_running: bool,
    surveys_in_flight: usize,
    nodes: Vec<NodeMetrics>,
}

async fn task_pipeline_status(
    State(state): State<ServiceState>,
    Path(task_id): Path<String>,
) -> Result<Json<PipelineStatusResponse>> {
    let task = state.manager.require_task(&task_id).await?;
    if task.status.is_terminal() {
        return Err(ErrorKind::BadRequest
            .with_message(format!("task {task_id} is no longer active ({})", task.status)));
    }
    Ok(Json(PipelineStatusResponse {
        success: true,
        pipeline_running: state.pipeline.is_running(),
        surveys_in_flight: state.pipeline.in_flight().await,
        nodes: state.pipeline.metrics(),
    }))
}

async fn global_pipeline_status(
    State(state): State<ServiceState>,
) -> Json<PipelineStatusResponse> {
    Json(PipelineStatusResponse {
        success: true,
        pipeline_running: state.pipeline.is_running(),
        surveys_in_flight: state.pipeline.in_flight().await,
        nodes: state.pipeline.metrics(),
    })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    success: bool,
    count: usize,
    tasks: Vec<TaskRecord>,
}

async fn list_tasks(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>> {
    let status = query
        .status
        .map(|label| {
            TaskStatus::from_str(&label)
                .map_err(|_| ErrorKind::BadRequest.with_message(format!("invalid status: {label}")))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(100).min(1000);

    let tasks = state.tasks.list(status, limit).await?;
    Ok(Json(ListResponse {
        success: true,
        count: tasks.len(),
        tasks,
    }))
}

#[derive(Debug, Serialize)]
struct OutputResponse {
    success: bool,
    task_id: String,
    title: String,
    status: String,
    survey_data: serde_json::Value,
}

async fn task_output(
    State(state): State<ServiceState>,
    Path(task_id): Path<String>,
) -> Result<Json<OutputResponse>> {
    let task = state.manager.require_task(&task_id).await?;
    if task.status != TaskStatus::Completed {
        return Err(ErrorKind::BadRequest.with_message(format!(
            "task {task_id} is not completed yet ({})",
            task.status
        )));
    }

    let Some(record) = state.results.get(&task_id).await? else {
        return Err(ErrorKind::NotFound
            .with_message(format!("no result stored for completed task {task_id}")));
    };
    Ok(Json(OutputResponse {
        success: true,
        task_id: record.task_id,
        title: record.title,
        status: record.status,
        survey_data: record.survey_data,
    }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    success: bool,
    stats: ResultStats,
}

async fn database_stats(State(state): State<ServiceState>) -> Result<Json<StatsResponse>> {
    let stats = state.results.stats().await?;
    Ok(Json(StatsResponse {
        success: true,
        stats,
    }))
}

async fn database_health(State(state): State<ServiceState>) -> Result<Json<serde_json::Value>> {
    state.results.health_check().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "result store reachable",
    })))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    success: bool,
    task_store: bool,
    result_store: bool,
    pipeline_running: bool,
    active_tasks: usize,
}

async fn health(State(state): State<ServiceState>) -> Result<Json<HealthResponse>> {
    let task_store = state.tasks.health_check().await.is_ok();
    let result_store = state.results.health_check().await.is_ok();
    let active_tasks = if task_store {
        state.tasks.active_count().await.unwrap_or(0)
    } else {
        0
    };
    Ok(Json(HealthResponse {
        success: true,
        task_store,
        result_store,
        pipeline_running: state.pipeline.is_running(),
        active_tasks,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use surveyor_core::{MemoryResultStore, MemoryTaskStore, ResultStore};
    use surveyor_pipeline::{
        ComposeError, ComposeRequest, DigestSynthesizer, OutlineRefiner, PipelineDeps,
        SectionComposer, SurveyPipeline, SurveyPipelineConfig,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::manager::{ManagerConfig, PipelineTaskManager};

    struct Stub;

    #[async_trait]
    impl OutlineRefiner for Stub {
        async fn draft(
            &self,
            survey_title: &str,
            _abstracts: &std::collections::BTreeMap<String, (String, String)>,
        ) -> std::result::Result<String, ComposeError> {
            Ok(format!("# {survey_title}\n## A\n"))
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

    #[async_trait]
    impl DigestSynthesizer for Stub {
        async fn synthesize(
            &self,
            survey_title: &str,
            _outline: &str,
            _papers: &[surveyor_survey::Paper],
        ) -> std::result::Result<String, ComposeError> {
            Ok(format!("# {survey_title}\n## A\nx\n"))
        }
    }

    #[async_trait]
    impl SectionComposer for Stub {
        async fn compose(
            &self,
            _request: &ComposeRequest,
        ) -> std::result::Result<String, ComposeError> {
            Ok("body".to_string())
        }
    }

    async fn state() -> ServiceState {
        let tasks = Arc::new(MemoryTaskStore::default());
        let results = Arc::new(MemoryResultStore::new());
        let deps = PipelineDeps {
            results: results.clone(),
            outliner: Arc::new(Stub),
            digester: Arc::new(Stub),
            composer: Arc::new(Stub),
        };
        let pipeline = Arc::new(
            SurveyPipeline::init(SurveyPipelineConfig::default(), deps).expect("init"),
        );
        pipeline.start().expect("start");
        let manager = PipelineTaskManager::new(
            tasks.clone(),
            results.clone(),
            pipeline.clone(),
            None,
            ManagerConfig {
                check_interval: Duration::from_millis(50),
                timeout: Duration::from_secs(5),
            },
        );
        ServiceState::new(tasks, results, pipeline, manager)
    }

    async fn response_json(
        router: Router,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.expect("router response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let value = serde_json::from_slice(&bytes).expect("json body");
        (status, value)
    }

    #[tokio::test]
    async fn unknown_tasks_return_not_found_shape() {
        let router = router(state().await);
        let (status, body) = response_json(
            router,
            Request::get("/api/task/missing").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn invalid_status_filter_is_a_bad_request() {
        let router = router(state().await);
        let (status, body) = response_json(
            router,
            Request::get("/api/tasks?status=exploded")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn health_reports_store_and_pipeline_state() {
        let router = router(state().await);
        let (status, body) = response_json(
            router,
            Request::get("/api/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["task_store"], true);
        assert_eq!(body["pipeline_running"], true);
    }

    #[tokio::test]
    async fn output_of_incomplete_task_is_a_bad_request() {
        let state = state().await;
        state
            .tasks
            .create("pending-task", serde_json::json!({}))
            .await
            .unwrap();
        let router = router(state);
        let (status, body) = response_json(
            router,
            Request::get("/api/output/pending-task")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn completed_output_round_trips_the_result_store() {
        let state = state().await;
        state
            .tasks
            .create("done-task", serde_json::json!({}))
            .await
            .unwrap();
        state
            .tasks
            .update_status("done-task", TaskStatus::Completed, None)
            .await
            .unwrap();
        state
            .results
            .save("done-task", serde_json::json!({"title": "S", "papers": []}))
            .await
            .unwrap();

        let router = router(state);
        let (status, body) = response_json(
            router,
            Request::get("/api/output/done-task")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["title"], "S");
        assert_eq!(body["survey_data"]["task_id"], "done-task");
    }

    #[tokio::test]
    async fn submission_returns_the_task_id_and_unique_title() {
        let router = router(state().await);
        let (status, body) = response_json(
            router,
            Request::post("/api/task/submit")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"topic": "graphs"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        let task_id = body["task_id"].as_str().unwrap();
        let title = body["unique_survey_title"].as_str().unwrap();
        assert!(title.contains(task_id));
        assert!(title.starts_with("graphs_"));
    }
}
