use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Promoted from a `PendingAnalyte` on admin approval (§4.6 approve flow).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Analyte {
    pub id: Uuid,
    pub code: String,
    pub canonical_name: String,
    pub canonical_unit: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// `(analyte, alias)` is unique. `source` documents provenance so a conflict
/// can be diagnosed later (§3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct AnalyteAlias {
    pub id: Uuid,
    pub analyte_id: Uuid,
    pub alias: String,
    pub display_text: String,
    pub language: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PendingAnalyteStatus {
    Pending,
    Approved,
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct PendingAnalyte {
    pub id: Uuid,
    pub proposed_code: String,
    pub proposed_name: String,
    pub unit: Option<String>,
    pub category: Option<String>,
    pub confidence: f64,
    pub evidence: serde_json::Value,
    pub parameter_variations: Vec<String>,
    #[schema(value_type = String)]
    pub status: PendingAnalyteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchReviewStatus {
    Pending,
    Resolved,
    Skipped,
}

/// Holds ambiguous or low-confidence mappings (§3). `result_id` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct MatchReview {
    pub id: Uuid,
    pub result_id: Uuid,
    pub candidates: serde_json::Value,
    #[schema(value_type = String)]
    pub status: MatchReviewStatus,
    pub source: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Per-row candidate surfaced during Tier B/C (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MatchCandidate {
    pub analyte_id: Option<Uuid>,
    pub code: String,
    pub name: String,
    pub confidence: f64,
    pub source: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApproveAnalyteRequest {
    pub canonical_name: Option<String>,
    pub canonical_unit: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApproveAnalyteResponse {
    pub analyte_id: Uuid,
    pub aliases_inserted: i64,
    pub backfilled_by_alias: i64,
    pub linked_by_match_review: i64,
}
