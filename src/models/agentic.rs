use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Thread of conversational SQL queries (§3, C8).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AgenticSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub selected_patient_id: Option<Uuid>,
    pub turn_count: i32,
    pub transcript: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SqlGenerationStatus {
    Accepted,
    ValidationFailed,
    NoFinalQuery,
    Timeout,
    Error,
}

/// Audit trail for every generated statement, successful or not (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct SqlGenerationLog {
    pub id: Uuid,
    #[schema(value_type = String)]
    pub status: SqlGenerationStatus,
    pub user_hash: String,
    pub prompt: String,
    pub generated_sql: Option<String>,
    pub metadata: serde_json::Value,
    pub session_id: Option<Uuid>,
    pub iteration_count: i32,
    pub duration_ms: i64,
    pub sql_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AskQuestionRequest {
    pub question: String,
    pub session_id: Option<Uuid>,
    pub selected_patient_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AskQuestionResponse {
    pub session_id: Uuid,
    pub status: String,
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub confidence: Option<f64>,
    pub query_type: Option<String>,
    pub error: Option<String>,
}
