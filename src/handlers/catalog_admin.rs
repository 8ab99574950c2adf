//! Catalog maintenance endpoints, admin-only (§4.6 approve flow, §6). These
//! run against the admin pool directly since pending analytes, match
//! reviews and unit reviews are shared catalog state, not per-tenant data.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;
use crate::models::{ApproveAnalyteRequest, ApproveAnalyteResponse, MatchReview, PendingAnalyte, UnitReview};
use crate::utils::ApiResult;

#[utoipa::path(
    get,
    path = "/api/admin/pending-analytes",
    responses((status = 200, description = "Pending analyte proposals", body = [PendingAnalyte])),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn list_pending_analytes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<PendingAnalyte>>> {
    let rows: Vec<PendingAnalyte> =
        sqlx::query_as("SELECT * FROM pending_analytes WHERE status = 'pending' ORDER BY created_at")
            .fetch_all(&state.db.admin)
            .await?;
    Ok(Json(rows))
}

#[utoipa::path(
    post,
    path = "/api/admin/pending-analytes/{code}/approve",
    request_body = ApproveAnalyteRequest,
    responses((status = 200, description = "Promoted to a canonical analyte", body = ApproveAnalyteResponse)),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn approve_pending_analyte(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(req): Json<ApproveAnalyteRequest>,
) -> ApiResult<Json<ApproveAnalyteResponse>> {
    let (analyte_id, aliases_inserted, backfilled_by_alias, linked_by_match_review) = state
        .analyte_mapper
        .approve_pending_analyte(&code, req.canonical_name, req.canonical_unit, req.category)
        .await?;

    Ok(Json(ApproveAnalyteResponse { analyte_id, aliases_inserted, backfilled_by_alias, linked_by_match_review }))
}

#[utoipa::path(
    get,
    path = "/api/admin/match-reviews",
    responses((status = 200, description = "Unresolved mapping reviews", body = [MatchReview])),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn list_match_reviews(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<MatchReview>>> {
    let rows: Vec<MatchReview> =
        sqlx::query_as("SELECT * FROM match_reviews WHERE status = 'pending' ORDER BY created_at")
            .fetch_all(&state.db.admin)
            .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResolveReviewResponse {
    pub resolved: bool,
}

#[utoipa::path(
    post,
    path = "/api/admin/match-reviews/{id}/skip",
    responses((status = 200, description = "Review marked skipped", body = ResolveReviewResponse)),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn skip_match_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ResolveReviewResponse>> {
    let result = sqlx::query("UPDATE match_reviews SET status = 'skipped' WHERE id = $1 AND status = 'pending'")
        .bind(id)
        .execute(&state.db.admin)
        .await?;
    Ok(Json(ResolveReviewResponse { resolved: result.rows_affected() > 0 }))
}

#[utoipa::path(
    get,
    path = "/api/admin/unit-reviews",
    responses((status = 200, description = "Unresolved unit normalization reviews", body = [UnitReview])),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn list_unit_reviews(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<UnitReview>>> {
    let rows: Vec<UnitReview> =
        sqlx::query_as("SELECT * FROM unit_reviews WHERE status = 'pending' ORDER BY created_at")
            .fetch_all(&state.db.admin)
            .await?;
    Ok(Json(rows))
}

#[utoipa::path(
    post,
    path = "/api/admin/unit-reviews/{id}/resolve",
    responses((status = 200, description = "Review marked resolved", body = ResolveReviewResponse)),
    security(("bearer_auth" = [])),
    tag = "Catalog admin"
)]
pub async fn resolve_unit_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ResolveReviewResponse>> {
    let result = sqlx::query("UPDATE unit_reviews SET status = 'resolved' WHERE id = $1 AND status = 'pending'")
        .bind(id)
        .execute(&state.db.admin)
        .await?;
    Ok(Json(ResolveReviewResponse { resolved: result.rows_affected() > 0 }))
}
