use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// One canonical per alias; `learn_count` increments only when a repeat
/// auto-learn agrees with the existing canonical (§3, §8 I4).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UnitAlias {
    pub alias: String,
    pub canonical: String,
    pub source: String,
    pub learn_count: i64,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitReviewStatus {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct UnitReview {
    pub id: Uuid,
    pub result_id: Uuid,
    pub raw_unit: String,
    pub normalized_input: String,
    pub llm_suggestion: Option<String>,
    pub confidence: Option<String>,
    pub issue_type: String,
    pub issue_details: serde_json::Value,
    #[schema(value_type = String)]
    pub status: UnitReviewStatus,
    pub created_at: DateTime<Utc>,
}

/// Confidence bucket returned by the LLM tier (§4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitConfidence {
    Low,
    Medium,
    High,
}

impl UnitConfidence {
    pub fn meets(&self, threshold: UnitConfidence) -> bool {
        self.rank() >= threshold.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTier {
    Exact,
    Llm,
    Raw,
}

#[derive(Debug, Clone)]
pub struct NormalizedUnit {
    pub canonical: String,
    pub tier: UnitTier,
    pub confidence: Option<UnitConfidence>,
}
