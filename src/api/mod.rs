//! HTTP surface of the registry and of a runner.
//!
//! The registry router exposes job submission and listings. The runner router
//! exposes the callback endpoint the push dispatcher offers jobs to.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::dispatch::RUNNING_JOBS_PATH;
use crate::error::{MeshError, PoolError, StoreError};
use crate::scheduler::{Job, JobId, NewJob, RunStatus};
use crate::store::{JobFilter, PageRequest, SharedJobStore, SharedRunnerStore};
use crate::worker::WorkerPool;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct RegistryState {
    pub jobs: SharedJobStore,
    pub runners: SharedRunnerStore,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub run: Option<String>,
    pub category: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        let status = match &e {
            PoolError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_declined() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn registry_router(state: RegistryState) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler))
        .route("/api/runners", get(list_runners_handler))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn runner_router(pool: WorkerPool) -> Router {
    Router::new()
        .route(RUNNING_JOBS_PATH, put(put_running_job_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(pool)
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<(), MeshError> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!(addr = %addr, "HTTP server stopped");
    Ok(())
}

async fn create_job_handler(
    State(state): State<RegistryState>,
    Json(payload): Json<NewJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.jobs.create(payload).await?;
    tracing::info!(job_id = %job.id, category = %job.category, name = %job.name, "Job submitted");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<RegistryState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut filter = JobFilter::default();
    if let Some(run) = &query.run {
        let run: RunStatus = run
            .parse()
            .map_err(|e: String| ApiError::new(StatusCode::BAD_REQUEST, e))?;
        filter = filter.with_run_status(run);
    }
    if let Some(category) = query.category {
        filter = filter.with_category(category);
    }
    let page = PageRequest {
        index: query.page.unwrap_or(0),
        size: query.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    };

    Ok(Json(state.jobs.list(&filter, page).await?))
}

async fn get_job_handler(
    State(state): State<RegistryState>,
    Path(id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.jobs.get(id).await?))
}

async fn list_runners_handler(
    State(state): State<RegistryState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runners.list_all().await?))
}

async fn put_running_job_handler(
    State(pool): State<WorkerPool>,
    Json(job): Json<Job>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = job.id;
    match pool.submit(job).await {
        Ok(reserved) => Ok(Json(reserved)),
        Err(e) => {
            tracing::debug!(job_id = %job_id, error = %e, "Pushed job declined");
            Err(e.into())
        }
    }
}
