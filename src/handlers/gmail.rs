//! Gmail ingestion endpoints (C9, spec §4.9): OAuth handshake, inbox sweep
//! plus classification, and selected-attachment ingestion.

use std::sync::Arc;

use axum::{Extension, Json, extract::Query, extract::State};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::AppState;
use crate::middleware::auth::AuthContext;
use crate::models::{AttachmentIngestResult, BodyClassification, SelectAttachmentsRequest};
use crate::utils::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizeUrlResponse {
    pub url: String,
    pub state: String,
}

#[utoipa::path(
    get,
    path = "/api/gmail/oauth/authorize",
    responses((status = 200, description = "Gmail consent URL", body = AuthorizeUrlResponse)),
    security(("bearer_auth" = [])),
    tag = "Gmail"
)]
pub async fn authorize(State(state): State<Arc<AppState>>) -> Json<AuthorizeUrlResponse> {
    let (url, csrf_state) = state.gmail.authorize_url();
    Json(AuthorizeUrlResponse { url, state: csrf_state })
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: String,
    pub state: String,
}

#[utoipa::path(
    get,
    path = "/api/gmail/oauth/callback",
    responses((status = 200, description = "Account connected")),
    tag = "Gmail"
)]
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.gmail.handle_oauth_callback(&query.code, &query.state).await?;
    Ok(Json(serde_json::json!({ "connected": true })))
}

#[utoipa::path(
    post,
    path = "/api/gmail/sweep",
    responses((status = 200, description = "Candidate lab-report emails", body = [BodyClassification])),
    security(("bearer_auth" = [])),
    tag = "Gmail"
)]
pub async fn sweep_and_classify(
    State(state): State<Arc<AppState>>,
    Extension(_ctx): Extension<AuthContext>,
) -> ApiResult<Json<Vec<BodyClassification>>> {
    let results = state.gmail.sweep_and_classify().await?;
    Ok(Json(results))
}

#[utoipa::path(
    post,
    path = "/api/gmail/ingest",
    request_body = SelectAttachmentsRequest,
    responses((status = 200, description = "Per-attachment ingestion outcomes", body = [AttachmentIngestResult])),
    security(("bearer_auth" = [])),
    tag = "Gmail"
)]
pub async fn ingest_selected(
    State(state): State<Arc<AppState>>,
    Extension(_ctx): Extension<AuthContext>,
    Json(req): Json<SelectAttachmentsRequest>,
) -> ApiResult<Json<Vec<AttachmentIngestResult>>> {
    let results = state
        .gmail
        .ingest_selected(&state.db.admin, &state.report_processor, req.patient_id, &req.selections)
        .await?;
    Ok(Json(results))
}
