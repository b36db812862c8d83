//! HTTP broker API
//!
//! Thin JSON adapters over [`Broker`] methods. Status codes distinguish "no
//! work" (`204`) from a present payload (`200`) and "not found" (`404`);
//! schema conflicts are `409` and storage failures `5xx`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fuseline_core::WorkflowSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::broker::{Broker, BrokerError};
use crate::types::{RepositoryInfo, StepAssignment, StepReport, WorkerInfo, WorkflowInfo};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// Error wrapper mapping broker failures onto status codes.
pub struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::SchemaMismatch { .. } => StatusCode::CONFLICT,
            BrokerError::UnknownInstance { .. } => StatusCode::NOT_FOUND,
            BrokerError::Store(err) => {
                tracing::error!(error = %err, "storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WorkerIdResponse {
    pub worker_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DispatchResponse {
    pub instance_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct WorkerIdQuery {
    pub worker_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DispatchRequest {
    pub workflow: WorkflowSchema,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub inputs: Option<Map<String, Value>>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct RepositoryQuery {
    pub name: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// GET /status
#[utoipa::path(get, path = "/status", tag = "system",
    responses((status = 200, description = "Broker health", body = StatusResponse)))]
async fn status() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

/// POST /worker/register
#[utoipa::path(post, path = "/worker/register", tag = "worker",
    request_body = Vec<WorkflowSchema>,
    responses(
        (status = 200, description = "Worker registered", body = WorkerIdResponse),
        (status = 409, description = "Schema mismatch")
    ))]
async fn register_worker(
    State(state): State<AppState>,
    Json(schemas): Json<Vec<WorkflowSchema>>,
) -> Result<Json<WorkerIdResponse>, ApiError> {
    let worker_id = state.broker.register_worker(&schemas)?;
    Ok(Json(WorkerIdResponse { worker_id }))
}

/// POST /worker/keep-alive
#[utoipa::path(post, path = "/worker/keep-alive", tag = "worker",
    params(("worker_id" = String, Query, description = "Worker to refresh")),
    responses((status = 200, description = "Liveness refreshed")))]
async fn keep_alive(
    State(state): State<AppState>,
    Query(query): Query<WorkerIdQuery>,
) -> StatusCode {
    state.broker.keep_alive(&query.worker_id);
    StatusCode::OK
}

/// GET /workers
#[utoipa::path(get, path = "/workers", tag = "worker",
    responses((status = 200, description = "Connected workers", body = Vec<WorkerInfo>)))]
async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerInfo>> {
    Json(state.broker.list_workers())
}

/// POST /repository/register
#[utoipa::path(post, path = "/repository/register", tag = "repository",
    request_body = RepositoryInfo,
    responses((status = 200, description = "Repository stored")))]
async fn register_repository(
    State(state): State<AppState>,
    Json(repo): Json<RepositoryInfo>,
) -> StatusCode {
    state.broker.register_repository(repo);
    StatusCode::OK
}

/// GET /repository
#[utoipa::path(get, path = "/repository", tag = "repository",
    params(
        ("name" = Option<String>, Query, description = "Repository to look up"),
        ("page" = Option<usize>, Query, description = "Page number, 1-based"),
        ("page_size" = Option<usize>, Query, description = "Page size")
    ),
    responses(
        (status = 200, description = "Repository or page of repositories"),
        (status = 404, description = "Unknown repository")
    ))]
async fn get_repository(
    State(state): State<AppState>,
    Query(query): Query<RepositoryQuery>,
) -> Response {
    match query.name {
        Some(name) => match state.broker.get_repository(&name) {
            Some(repo) => Json(repo).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        None => Json(state.broker.list_repositories(query.page, query.page_size)).into_response(),
    }
}

/// POST /workflow/dispatch
#[utoipa::path(post, path = "/workflow/dispatch", tag = "workflow",
    request_body = DispatchRequest,
    responses(
        (status = 200, description = "Instance created", body = DispatchResponse),
        (status = 409, description = "Schema mismatch")
    ))]
async fn dispatch_workflow(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let instance_id = state
        .broker
        .dispatch_workflow(&request.workflow, request.inputs)
        .await?;
    Ok(Json(DispatchResponse { instance_id }))
}

/// GET /workflow/step
#[utoipa::path(get, path = "/workflow/step", tag = "workflow",
    params(("worker_id" = String, Query, description = "Requesting worker")),
    responses(
        (status = 200, description = "Next assignment", body = StepAssignment),
        (status = 204, description = "No work available")
    ))]
async fn get_step(
    State(state): State<AppState>,
    Query(query): Query<WorkerIdQuery>,
) -> Result<Response, ApiError> {
    match state.broker.get_step(&query.worker_id).await? {
        Some(assignment) => Ok((StatusCode::OK, Json(assignment)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// POST /workflow/step
#[utoipa::path(post, path = "/workflow/step", tag = "workflow",
    params(("worker_id" = String, Query, description = "Reporting worker")),
    request_body = StepReport,
    responses(
        (status = 200, description = "Report accepted"),
        (status = 404, description = "Unknown instance")
    ))]
async fn report_step(
    State(state): State<AppState>,
    Query(query): Query<WorkerIdQuery>,
    Json(report): Json<StepReport>,
) -> Result<StatusCode, ApiError> {
    state.broker.report_step(&query.worker_id, report).await?;
    Ok(StatusCode::OK)
}

/// GET /workflows
#[utoipa::path(get, path = "/workflows", tag = "workflow",
    responses((status = 200, description = "Registered workflows", body = Vec<WorkflowInfo>)))]
async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowInfo>> {
    Json(state.broker.list_workflows())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        status,
        register_worker,
        keep_alive,
        list_workers,
        register_repository,
        get_repository,
        dispatch_workflow,
        get_step,
        report_step,
        list_workflows,
    ),
    components(schemas(
        WorkerIdResponse,
        DispatchResponse,
        StatusResponse,
        DispatchRequest,
        StepAssignment,
        StepReport,
        WorkerInfo,
        RepositoryInfo,
        WorkflowInfo,
    )),
    tags(
        (name = "system", description = "Health endpoints"),
        (name = "worker", description = "Worker registration and liveness"),
        (name = "repository", description = "Workflow repository catalogue"),
        (name = "workflow", description = "Dispatch, assignment and reporting")
    ),
    info(title = "Fuseline Broker API", version = "0.2.0")
)]
struct ApiDoc;

/// Build the broker router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/worker/register", post(register_worker))
        .route("/worker/keep-alive", post(keep_alive))
        .route("/workers", get(list_workers))
        .route("/repository/register", post(register_repository))
        .route("/repository", get(get_repository))
        .route("/workflow/dispatch", post(dispatch_workflow))
        .route("/workflow/step", get(get_step).post(report_step))
        .route("/workflows", get(list_workflows))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
