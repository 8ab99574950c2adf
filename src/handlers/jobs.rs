//! Job status/list/cancel endpoints over the in-process registry (C10,
//! spec §4.10). No persistence: job state does not survive a restart.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;
use crate::models::Job;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelJobResponse {
    pub cancelled: bool,
}

#[utoipa::path(
    get,
    path = "/api/jobs",
    responses((status = 200, description = "All known jobs", body = [Job])),
    security(("bearer_auth" = [])),
    tag = "Jobs"
)]
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.jobs.list())
}

#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    responses(
        (status = 200, description = "Job status", body = Job),
        (status = 404, description = "Unknown job id"),
    ),
    security(("bearer_auth" = [])),
    tag = "Jobs"
)]
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    state.jobs.get(id).map(Json).ok_or_else(|| ApiError::not_found("unknown job id"))
}

#[utoipa::path(
    post,
    path = "/api/jobs/{id}/cancel",
    responses((status = 200, description = "Cancellation requested", body = CancelJobResponse)),
    security(("bearer_auth" = [])),
    tag = "Jobs"
)]
pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Json<CancelJobResponse> {
    Json(CancelJobResponse { cancelled: state.jobs.cancel(id) })
}
