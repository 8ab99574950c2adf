use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Created from vision output (raw `parameter_name`/`unit`); later annotated
/// in place by C5 (unit) and C6 (analyte). `analyte_id` is NULL until mapping
/// resolves (§3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct LabResult {
    pub id: Uuid,
    pub report_id: Uuid,
    pub position: i32,
    pub parameter_name: String,
    pub result_text: String,
    pub numeric_result: Option<f64>,
    pub unit_raw: Option<String>,
    pub reference_lower: Option<f64>,
    pub reference_lower_operator: Option<String>,
    pub reference_upper: Option<f64>,
    pub reference_upper_operator: Option<String>,
    pub reference_text: Option<String>,
    pub is_out_of_range: Option<bool>,
    pub specimen_type: Option<String>,
    pub analyte_id: Option<Uuid>,
    pub mapping_confidence: Option<f64>,
    pub mapping_source: Option<String>,
    pub mapped_at: Option<DateTime<Utc>>,
    pub unit_canonical: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LabResultResponse {
    pub id: Uuid,
    pub parameter_name: String,
    pub result_text: String,
    pub numeric_result: Option<f64>,
    pub unit_canonical: Option<String>,
    pub is_out_of_range: Option<bool>,
    pub analyte_id: Option<Uuid>,
    pub mapping_source: Option<String>,
}

impl From<LabResult> for LabResultResponse {
    fn from(r: LabResult) -> Self {
        Self {
            id: r.id,
            parameter_name: r.parameter_name,
            result_text: r.result_text,
            numeric_result: r.numeric_result,
            unit_canonical: r.unit_canonical,
            is_out_of_range: r.is_out_of_range,
            analyte_id: r.analyte_id,
            mapping_source: r.mapping_source,
        }
    }
}
