//! HTTP control plane for flowd.
//!
//! A thin read-through over the store plus action endpoints that enqueue
//! jobs. Mutating endpoints are guarded by an optional bearer token; a
//! secondary per-project token applies to project-scoped routes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use flow_core::spec::{protocol_spec_hash, PROTOCOL_SPEC_KEY};
use flow_core::types::{
    Event, Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus, StepType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::planner::spec_validation_status;
use crate::queue::{
    Job, JobStatus, EXECUTE_STEP_JOB, OPEN_PR_JOB, PLAN_PROTOCOL_JOB, RUN_QUALITY_JOB,
};
use crate::state::maybe_complete_protocol;
use crate::storage::{NewProject, NewProtocolRun, NewStepRun, StepUpdate, StorageError};
use crate::webhook::{handle_webhook, Provider, WebhookDelivery, WebhookError};
use crate::{AppContext, AppResult};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project))
        .route(
            "/projects/{id}/protocols",
            get(list_protocols).post(create_protocol),
        )
        .route("/protocols/{id}", get(get_protocol))
        .route("/protocols/{id}/actions/start", post(start_protocol))
        .route("/protocols/{id}/actions/pause", post(pause_protocol))
        .route("/protocols/{id}/actions/resume", post(resume_protocol))
        .route("/protocols/{id}/actions/cancel", post(cancel_protocol))
        .route("/protocols/{id}/actions/run-next", post(run_next_step))
        .route("/protocols/{id}/actions/retry-latest", post(retry_latest))
        .route("/protocols/{id}/actions/open-pr", post(open_pr))
        .route("/protocols/{id}/steps", get(list_steps).post(create_step))
        .route("/protocols/{id}/events", get(list_events))
        .route("/protocols/{id}/spec", get(get_spec))
        .route("/steps/{id}/actions/run", post(run_step))
        .route("/steps/{id}/actions/run_qa", post(run_step_qa))
        .route("/steps/{id}/actions/approve", post(approve_step))
        .route("/queues", get(queue_stats))
        .route("/queues/jobs", get(queue_jobs))
        .route("/webhooks/github", post(github_webhook))
        .route("/webhooks/gitlab", post(gitlab_webhook))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            count_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost.
pub async fn start_server(
    state: Arc<AppContext>,
    port: u16,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn count_requests(
    State(state): State<Arc<AppContext>>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    state.metrics.inc_request();
    next.run(request).await
}

// --- Request/response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub git_url: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub ci_provider: Option<String>,
    #[serde(default)]
    pub default_models: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub secrets: Option<BTreeMap<String, Value>>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Project representation for API consumers; secrets never leave the
/// store.
#[derive(Debug, Serialize)]
pub struct ProjectOut {
    pub id: i64,
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub ci_provider: Option<String>,
    pub default_models: Option<BTreeMap<String, String>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<Project> for ProjectOut {
    fn from(project: Project) -> Self {
        Self {
            id: project.id,
            name: project.name,
            git_url: project.git_url,
            base_branch: project.base_branch,
            ci_provider: project.ci_provider,
            default_models: project.default_models,
            created_at: project.created_at,
            updated_at: project.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateProtocolRequest {
    pub protocol_name: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub protocol_root: Option<String>,
    #[serde(default)]
    pub template_config: Option<Value>,
    #[serde(default)]
    pub template_source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateStepRequest {
    pub step_index: i64,
    pub step_name: String,
    #[serde(default)]
    pub step_type: Option<StepType>,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub policy: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
}

#[derive(Debug, Serialize)]
pub struct SpecResponse {
    pub spec: Option<Value>,
    pub spec_hash: Option<String>,
    pub validation_status: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct JobsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookQuery {
    #[serde(default)]
    pub protocol_run_id: Option<i64>,
}

// --- Auth ---

fn check_auth(state: &AppContext, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = &state.config.api_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(unauthorized("invalid auth token")),
        None => Err(unauthorized("missing auth token")),
    }
}

/// Optional per-project token check against `secrets.api_token`.
async fn check_project_access(
    state: &AppContext,
    project_id: i64,
    headers: &HeaderMap,
) -> ApiResult<Project> {
    let project = state
        .storage
        .get_project(project_id)
        .await
        .map_err(storage_error)?;
    if let Some(expected) = project.api_token() {
        let provided = headers
            .get("X-Project-Token")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return Err(unauthorized("project access denied"));
        }
    }
    Ok(project)
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn storage_error(e: StorageError) -> ApiError {
    if e.is_not_found() {
        warn!("not found: {e}");
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    } else {
        error!("storage error: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    }
}

fn queue_error(e: crate::queue::QueueError) -> ApiError {
    error!("queue error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// --- Handlers ---

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(State(state): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn create_project(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;

    let project = state
        .storage
        .create_project(NewProject {
            name: req.name,
            git_url: req.git_url,
            base_branch: req.base_branch,
            ci_provider: req.ci_provider,
            secrets: req.secrets,
            default_models: req.default_models,
        })
        .await
        .map_err(storage_error)?;

    info!(project_id = project.id, "created project");
    Ok((StatusCode::CREATED, Json(ProjectOut::from(project))))
}

async fn list_projects(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ProjectOut>>> {
    check_auth(&state, &headers)?;
    let projects = state.storage.list_projects().await.map_err(storage_error)?;
    Ok(Json(projects.into_iter().map(ProjectOut::from).collect()))
}

async fn get_project(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectOut>> {
    check_auth(&state, &headers)?;
    let project = check_project_access(&state, id, &headers).await?;
    Ok(Json(ProjectOut::from(project)))
}

async fn create_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateProtocolRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let project = check_project_access(&state, project_id, &headers).await?;

    let run = state
        .storage
        .create_protocol_run(NewProtocolRun {
            project_id,
            protocol_name: req.protocol_name,
            status: ProtocolStatus::Pending,
            base_branch: req.base_branch.unwrap_or(project.base_branch),
            worktree_path: req.worktree_path,
            protocol_root: req.protocol_root,
            description: req.description,
            template_config: req.template_config,
            template_source: req.template_source,
        })
        .await
        .map_err(storage_error)?;

    info!(protocol_run_id = run.id, "created protocol run");
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_protocols(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
) -> ApiResult<Json<Vec<ProtocolRun>>> {
    check_auth(&state, &headers)?;
    check_project_access(&state, project_id, &headers).await?;
    let runs = state
        .storage
        .list_protocol_runs(project_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(runs))
}

async fn get_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProtocolRun>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(&state, run.project_id, &headers).await?;
    Ok(Json(run))
}

async fn start_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(&state, run.project_id, &headers).await?;

    state
        .storage
        .update_protocol_status(id, ProtocolStatus::Running)
        .await
        .map_err(storage_error)?;
    let job = state
        .queue
        .enqueue(PLAN_PROTOCOL_JOB, serde_json::json!({"protocol_run_id": id}), None)
        .map_err(queue_error)?;

    Ok(Json(ActionResponse {
        message: "Protocol planning enqueued".to_string(),
        job: Some(job),
    }))
}

async fn set_protocol_status(
    state: &AppContext,
    headers: &HeaderMap,
    id: i64,
    status: ProtocolStatus,
    message: &str,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(state, headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(state, run.project_id, headers).await?;
    state
        .storage
        .update_protocol_status(id, status)
        .await
        .map_err(storage_error)?;
    Ok(Json(ActionResponse {
        message: message.to_string(),
        job: None,
    }))
}

async fn pause_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    set_protocol_status(&state, &headers, id, ProtocolStatus::Blocked, "Protocol paused").await
}

async fn resume_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    set_protocol_status(&state, &headers, id, ProtocolStatus::Running, "Protocol resumed").await
}

async fn cancel_protocol(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    set_protocol_status(
        &state,
        &headers,
        id,
        ProtocolStatus::Cancelled,
        "Protocol cancelled",
    )
    .await
}

async fn run_next_step(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(&state, run.project_id, &headers).await?;

    let steps = state.storage.list_step_runs(id).await.map_err(storage_error)?;
    let Some(next) = steps.iter().find(|s| s.status == StepStatus::Pending) else {
        return Ok(Json(ActionResponse {
            message: "No pending steps".to_string(),
            job: None,
        }));
    };

    state
        .storage
        .update_step_status(next.id, StepStatus::Running, StepUpdate::default())
        .await
        .map_err(storage_error)?;
    let job = state
        .queue
        .enqueue(
            EXECUTE_STEP_JOB,
            serde_json::json!({"step_run_id": next.id, "protocol_run_id": id}),
            None,
        )
        .map_err(queue_error)?;

    Ok(Json(ActionResponse {
        message: "Step execution enqueued".to_string(),
        job: Some(job),
    }))
}

async fn retry_latest(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(&state, run.project_id, &headers).await?;

    let Some(latest) = state.storage.latest_step_run(id).await.map_err(storage_error)? else {
        return Ok(Json(ActionResponse {
            message: "No steps to retry".to_string(),
            job: None,
        }));
    };

    state
        .storage
        .update_step_status(
            latest.id,
            StepStatus::Pending,
            StepUpdate {
                retries: Some(latest.retries + 1),
                ..StepUpdate::default()
            },
        )
        .await
        .map_err(storage_error)?;
    state
        .storage
        .update_protocol_status(id, ProtocolStatus::Running)
        .await
        .map_err(storage_error)?;
    let job = state
        .queue
        .enqueue(
            EXECUTE_STEP_JOB,
            serde_json::json!({"step_run_id": latest.id, "protocol_run_id": id}),
            None,
        )
        .map_err(queue_error)?;

    Ok(Json(ActionResponse {
        message: "Latest step requeued".to_string(),
        job: Some(job),
    }))
}

async fn open_pr(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    check_project_access(&state, run.project_id, &headers).await?;

    let job = state
        .queue
        .enqueue(OPEN_PR_JOB, serde_json::json!({"protocol_run_id": id}), None)
        .map_err(queue_error)?;
    Ok(Json(ActionResponse {
        message: "Open PR enqueued".to_string(),
        job: Some(job),
    }))
}

async fn create_step(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<CreateStepRequest>,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;

    let step = state
        .storage
        .create_step_run(NewStepRun {
            protocol_run_id: id,
            step_index: req.step_index,
            step_name: req.step_name.clone(),
            step_type: req
                .step_type
                .unwrap_or_else(|| StepType::infer(&req.step_name)),
            status: req.status.unwrap_or(StepStatus::Pending),
            model: req.model,
            engine_id: req.engine_id,
            policy: req.policy,
            summary: req.summary,
        })
        .await
        .map_err(storage_error)?;

    Ok((StatusCode::CREATED, Json(step)))
}

async fn list_steps(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<StepRun>>> {
    check_auth(&state, &headers)?;
    state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    let steps = state.storage.list_step_runs(id).await.map_err(storage_error)?;
    Ok(Json(steps))
}

async fn list_events(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Event>>> {
    check_auth(&state, &headers)?;
    state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;
    let events = state.storage.list_events(id).await.map_err(storage_error)?;
    Ok(Json(events))
}

async fn get_spec(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<SpecResponse>> {
    check_auth(&state, &headers)?;
    let run = state
        .storage
        .get_protocol_run(id)
        .await
        .map_err(storage_error)?;

    let spec = run
        .template_config
        .as_ref()
        .and_then(|t| t.get(PROTOCOL_SPEC_KEY))
        .filter(|v| !v.is_null())
        .cloned();
    let spec_hash = spec.as_ref().map(protocol_spec_hash);
    let validation_status =
        spec_validation_status(&run).unwrap_or_else(|| "unknown".to_string());

    Ok(Json(SpecResponse {
        spec,
        spec_hash,
        validation_status,
    }))
}

async fn run_step(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let step = state
        .storage
        .update_step_status(id, StepStatus::Running, StepUpdate::default())
        .await
        .map_err(storage_error)?;
    let job = state
        .queue
        .enqueue(
            EXECUTE_STEP_JOB,
            serde_json::json!({
                "step_run_id": step.id,
                "protocol_run_id": step.protocol_run_id,
            }),
            None,
        )
        .map_err(queue_error)?;

    Ok(Json(ActionResponse {
        message: "Step execution enqueued".to_string(),
        job: Some(job),
    }))
}

async fn run_step_qa(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<ActionResponse>> {
    check_auth(&state, &headers)?;
    let step = state
        .storage
        .update_step_status(id, StepStatus::NeedsQa, StepUpdate::default())
        .await
        .map_err(storage_error)?;
    let job = state
        .queue
        .enqueue(
            RUN_QUALITY_JOB,
            serde_json::json!({
                "step_run_id": step.id,
                "protocol_run_id": step.protocol_run_id,
            }),
            None,
        )
        .map_err(queue_error)?;

    Ok(Json(ActionResponse {
        message: "QA enqueued".to_string(),
        job: Some(job),
    }))
}

async fn approve_step(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<StepRun>> {
    check_auth(&state, &headers)?;
    let step = state
        .storage
        .update_step_status(id, StepStatus::Completed, StepUpdate::default())
        .await
        .map_err(storage_error)?;
    state
        .storage
        .append_event(
            step.protocol_run_id,
            Some(step.id),
            flow_core::events::EventKind::ManualApproval.as_str(),
            "Step marked as completed manually.",
            None,
        )
        .await
        .map_err(storage_error)?;
    if let Err(e) = maybe_complete_protocol(&state, step.protocol_run_id).await {
        error!(error = %e, "terminal-state propagation failed");
    }
    let step = state.storage.get_step_run(id).await.map_err(storage_error)?;
    Ok(Json(step))
}

async fn queue_stats(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    check_auth(&state, &headers)?;
    let stats = state.queue.stats().map_err(queue_error)?;
    Ok(Json(stats))
}

async fn queue_jobs(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    check_auth(&state, &headers)?;
    let status = match query.status.as_deref() {
        Some("queued") => Some(JobStatus::Queued),
        Some("in_progress") => Some(JobStatus::InProgress),
        Some("finished") => Some(JobStatus::Finished),
        Some("failed") => Some(JobStatus::Failed),
        _ => None,
    };
    let jobs = state.queue.list(status).map_err(queue_error)?;
    Ok(Json(jobs))
}

async fn github_webhook(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> ApiResult<Json<ActionResponse>> {
    deliver_webhook(&state, Provider::GitHub, &headers, query, body).await
}

async fn gitlab_webhook(
    State(state): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> ApiResult<Json<ActionResponse>> {
    deliver_webhook(&state, Provider::GitLab, &headers, query, body).await
}

async fn deliver_webhook(
    state: &Arc<AppContext>,
    provider: Provider,
    headers: &HeaderMap,
    query: WebhookQuery,
    body: Bytes,
) -> ApiResult<Json<ActionResponse>> {
    let (event_header, signature_header) = match provider {
        Provider::GitHub => ("X-GitHub-Event", "X-Hub-Signature-256"),
        Provider::GitLab => ("X-Gitlab-Event", "X-Gitlab-Token"),
    };
    let delivery = WebhookDelivery {
        body: body.to_vec(),
        event_type: headers
            .get(event_header)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        signature: headers
            .get(signature_header)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        protocol_run_id: query.protocol_run_id,
    };

    match handle_webhook(state, provider, delivery).await {
        Ok(()) => Ok(Json(ActionResponse {
            message: "Webhook recorded".to_string(),
            job: None,
        })),
        Err(WebhookError::Unauthorized) => Err(unauthorized("invalid webhook signature")),
        Err(WebhookError::RunNotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "protocol run not found for webhook".to_string(),
            }),
        )),
        Err(WebhookError::Handler(e)) => {
            error!(error = %e, "webhook handler failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}
