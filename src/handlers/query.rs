//! Conversational SQL endpoint (C8, spec §4.8). The agentic loop returns a
//! validated, read-only statement; the caller executes it under its own RLS
//! scope (§2 flow) -- this service never runs the generated SQL itself.

use std::sync::Arc;
use std::time::Instant;

use axum::{Extension, Json, extract::State};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::AppState;
use crate::middleware::auth::AuthContext;
use crate::models::{AskQuestionRequest, AskQuestionResponse, SqlGenerationStatus};
use crate::services::agentic::LoopOutcome;
use crate::utils::ApiResult;

#[utoipa::path(
    post,
    path = "/api/query/ask",
    request_body = AskQuestionRequest,
    responses((status = 200, description = "Generated query or a structured failure", body = AskQuestionResponse)),
    security(("bearer_auth" = [])),
    tag = "Query"
)]
pub async fn ask(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<AskQuestionRequest>,
) -> ApiResult<Json<AskQuestionResponse>> {
    let started = Instant::now();
    let session_id = req.session_id.unwrap_or_else(Uuid::new_v4);

    let (outcome, _transcript, iteration_count) = state
        .agentic
        .ask(&req.question, ctx.user_id, req.selected_patient_id, false)
        .await?;

    let duration_ms = started.elapsed().as_millis() as i64;

    let (status, sql, explanation, confidence, query_type, error) = match &outcome {
        LoopOutcome::Accepted(final_query) => (
            SqlGenerationStatus::Accepted,
            Some(final_query.sql.clone()),
            Some(final_query.explanation.clone()),
            Some(final_query.confidence),
            Some(final_query.query_type.clone()),
            None,
        ),
        LoopOutcome::ValidationFailed(violations) => {
            (SqlGenerationStatus::ValidationFailed, None, None, None, None, Some(violations.join("; ")))
        },
        LoopOutcome::NoFinalQuery => (
            SqlGenerationStatus::NoFinalQuery,
            None,
            None,
            None,
            None,
            Some("model never produced a final query".to_string()),
        ),
        LoopOutcome::Timeout => (
            SqlGenerationStatus::Timeout,
            None,
            None,
            None,
            None,
            Some("session exceeded its wall-clock budget".to_string()),
        ),
        LoopOutcome::Error(message) => (SqlGenerationStatus::Error, None, None, None, None, Some(message.clone())),
    };

    log_generation(&state, &ctx, session_id, &req.question, &status, sql.as_deref(), iteration_count, duration_ms)
        .await;

    Ok(Json(AskQuestionResponse {
        session_id,
        status: status_label(&status).to_string(),
        sql,
        explanation,
        confidence,
        query_type,
        error,
    }))
}

fn status_label(status: &SqlGenerationStatus) -> &'static str {
    match status {
        SqlGenerationStatus::Accepted => "accepted",
        SqlGenerationStatus::ValidationFailed => "validation_failed",
        SqlGenerationStatus::NoFinalQuery => "no_final_query",
        SqlGenerationStatus::Timeout => "timeout",
        SqlGenerationStatus::Error => "error",
    }
}

/// Best-effort audit row (§4.8, §8): failure to log never fails the request.
async fn log_generation(
    state: &AppState,
    ctx: &AuthContext,
    session_id: Uuid,
    prompt: &str,
    status: &SqlGenerationStatus,
    generated_sql: Option<&str>,
    iteration_count: u32,
    duration_ms: i64,
) {
    let user_hash = hex::encode(Sha256::digest(ctx.user_id.as_bytes()));
    let sql_hash = generated_sql.map(|sql| hex::encode(Sha256::digest(sql.as_bytes())));

    let result = sqlx::query(
        r#"
        INSERT INTO sql_generation_logs
            (id, status, user_hash, prompt, generated_sql, metadata, session_id, iteration_count,
             duration_ms, sql_hash)
        VALUES (gen_random_uuid(), $1, $2, $3, $4, '{}'::jsonb, $5, $6, $7, $8)
        "#,
    )
    .bind(status_label(status))
    .bind(&user_hash)
    .bind(prompt)
    .bind(generated_sql)
    .bind(session_id)
    .bind(iteration_count as i32)
    .bind(duration_ms)
    .bind(&sql_hash)
    .execute(&state.db.admin)
    .await;

    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to persist sql generation log");
    }
}
