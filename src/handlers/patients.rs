//! Patient lookup/creation scoped to the caller (§3, §4.1). Every write runs
//! inside `with_user_transaction` so the RLS policy on `patients` is bound
//! for the whole statement.

use std::sync::Arc;

use axum::{Extension, Json, extract::State};
use serde::Deserialize;
use sqlx::{Postgres, Transaction};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;
use crate::middleware::auth::AuthContext;
use crate::models::{Patient, PatientResponse, normalize_patient_name};
use crate::utils::ApiResult;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePatientRequest {
    pub display_name: String,
}

#[utoipa::path(
    get,
    path = "/api/patients",
    responses((status = 200, description = "Patients visible to the caller", body = [PatientResponse])),
    security(("bearer_auth" = [])),
    tag = "Patients"
)]
pub async fn list_patients(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<Vec<PatientResponse>>> {
    let patients = state
        .db
        .with_user_transaction(ctx.user_id, async move |tx| {
            let rows: Vec<Patient> =
                sqlx::query_as("SELECT * FROM patients ORDER BY display_name").fetch_all(&mut **tx).await?;
            Ok(rows)
        })
        .await?;

    Ok(Json(patients.into_iter().map(PatientResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/patients",
    request_body = CreatePatientRequest,
    responses((status = 200, description = "Patient found or created", body = PatientResponse)),
    security(("bearer_auth" = [])),
    tag = "Patients"
)]
pub async fn find_or_create_patient(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreatePatientRequest>,
) -> ApiResult<Json<PatientResponse>> {
    let patient = state
        .db
        .with_user_transaction(ctx.user_id, async move |tx| {
            find_or_create(tx, ctx.user_id, &req.display_name).await
        })
        .await?;

    Ok(Json(patient.into()))
}

/// Shared by the upload and Gmail ingestion handlers: a patient is keyed by
/// `(user_id, normalized_name)` within the caller's scope, created on first
/// use (§3).
pub async fn find_or_create(
    tx: &mut Transaction<'static, Postgres>,
    user_id: Uuid,
    display_name: &str,
) -> ApiResult<Patient> {
    let normalized = normalize_patient_name(display_name);

    if let Some(existing) =
        sqlx::query_as::<_, Patient>("SELECT * FROM patients WHERE user_id = $1 AND normalized_name = $2")
            .bind(user_id)
            .bind(&normalized)
            .fetch_optional(&mut **tx)
            .await?
    {
        return Ok(existing);
    }

    let patient: Patient = sqlx::query_as(
        r#"
        INSERT INTO patients (id, user_id, display_name, normalized_name)
        VALUES (gen_random_uuid(), $1, $2, $3)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(display_name)
    .bind(&normalized)
    .fetch_one(&mut **tx)
    .await?;

    Ok(patient)
}
