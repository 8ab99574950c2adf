use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Links a Gmail attachment to the report it produced. Unique on
/// `(message_id, attachment_id)`; also indexed by `attachment_checksum` for
/// checksum-based dedup (§3, §8 I8).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct GmailProvenance {
    pub id: Uuid,
    pub report_id: Uuid,
    pub message_id: String,
    pub attachment_id: String,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub email_date: Option<DateTime<Utc>>,
    pub attachment_checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GmailMessageHeader {
    pub message_id: String,
    pub subject: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubjectClassification {
    pub id: String,
    pub is_lab_likely: bool,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttachmentMetadata {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BodyClassification {
    pub message_id: String,
    pub accepted: bool,
    pub confidence: f64,
    pub attachments: Vec<AttachmentMetadata>,
    pub rejected_attachments: Vec<AttachmentMetadata>,
    pub attachment_issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentIngestStatus {
    Completed,
    Updated,
    Failed,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttachmentIngestResult {
    pub message_id: String,
    pub attachment_id: String,
    #[schema(value_type = String)]
    pub status: AttachmentIngestStatus,
    pub report_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OAuthCallbackRequest {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SelectAttachmentsRequest {
    pub patient_id: Uuid,
    pub selections: Vec<SelectedAttachment>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SelectedAttachment {
    pub message_id: String,
    pub attachment_id: String,
}
