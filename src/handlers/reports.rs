//! Report upload endpoint (C7, spec §4.7). Patient resolution reuses the
//! same find-or-create helper the Gmail ingestion path uses.

use std::sync::Arc;

use axum::{Extension, Json, extract::Multipart, extract::State};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;
use crate::handlers::patients;
use crate::middleware::auth::AuthContext;
use crate::utils::{ApiError, ApiResult};

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadReportResponse {
    pub report_id: Uuid,
    pub was_freshly_created: bool,
    pub lab_result_count: usize,
}

/// Multipart form: `patient_name` (text field) plus a single `file` field
/// carrying the raw PDF/image bytes. Patient is found-or-created in the same
/// RLS-scoped transaction that subsequently reads it back for the processor.
#[utoipa::path(
    post,
    path = "/api/reports",
    responses(
        (status = 200, description = "Report ingested", body = UploadReportResponse),
        (status = 400, description = "Unsupported mime type or malformed upload"),
    ),
    security(("bearer_auth" = [])),
    tag = "Reports"
)]
pub async fn upload_report(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadReportResponse>> {
    let mut patient_name: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut mime_type: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::validation_error(e.to_string()))?
    {
        match field.name() {
            Some("patient_name") => {
                patient_name =
                    Some(field.text().await.map_err(|e| ApiError::validation_error(e.to_string()))?);
            },
            Some("file") => {
                filename = field.file_name().map(|s| s.to_string());
                mime_type = field.content_type().map(|s| s.to_string());
                bytes = Some(field.bytes().await.map_err(|e| ApiError::validation_error(e.to_string()))?.to_vec());
            },
            _ => {},
        }
    }

    let patient_name = patient_name.ok_or_else(|| ApiError::validation_error("missing patient_name field"))?;
    let filename = filename.unwrap_or_else(|| "upload".to_string());
    let mime_type = mime_type.ok_or_else(|| ApiError::validation_error("missing file field"))?;
    let bytes = bytes.ok_or_else(|| ApiError::validation_error("missing file field"))?;

    let patient_id = state
        .db
        .with_user_transaction(ctx.user_id, async move |tx| {
            patients::find_or_create(tx, ctx.user_id, &patient_name).await.map(|p| p.id)
        })
        .await?;

    let outcome = state.report_processor.ingest(patient_id, &filename, &mime_type, &bytes).await?;

    Ok(Json(UploadReportResponse {
        report_id: outcome.report_id,
        was_freshly_created: outcome.was_freshly_created,
        lab_result_count: outcome.lab_result_ids.len(),
    }))
}
