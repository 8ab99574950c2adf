use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

/// Identified by `(patient_id, checksum)`; re-ingesting the same bytes
/// updates the row in place rather than creating a duplicate (§3, §8 I2).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Report {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub source_filename: String,
    pub mime_type: String,
    pub checksum: String,
    pub parser_version: String,
    #[schema(value_type = String)]
    pub status: ReportStatus,
    pub recognized_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub test_date: Option<NaiveDate>,
    pub patient_snapshot: serde_json::Value,
    pub raw_model_output: Option<String>,
    pub missing_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// Timestamp-equality trick used by Gmail ingestion (§4.9 step 6) to
    /// distinguish a freshly inserted report from an update in place.
    pub fn was_freshly_created(&self) -> bool {
        self.created_at == self.updated_at
    }
}

/// Sanitized shape produced by C7 from the permissive vision-model JSON
/// (§9: "do not pipe the permissive form through the system").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedReport {
    pub patient_name: Option<String>,
    pub patient_age: Option<i32>,
    pub patient_dob: Option<NaiveDate>,
    pub patient_gender: Option<String>,
    pub test_date: Option<NaiveDate>,
    pub parameters: Vec<ExtractedParameter>,
    pub missing_data: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceInterval {
    pub lower: Option<f64>,
    pub lower_operator: Option<String>,
    pub upper: Option<f64>,
    pub upper_operator: Option<String>,
    pub text: Option<String>,
    pub full_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedParameter {
    pub parameter_name: String,
    pub result: String,
    pub unit: Option<String>,
    pub reference_interval: Option<ReferenceInterval>,
    pub is_value_out_of_range: Option<bool>,
    pub numeric_result: Option<f64>,
    pub specimen_type: Option<String>,
}
