//! Stage 3 (§4.9): batch attachment ingestion — dedup, download, checksum,
//! hand-off to the report processor (C7), provenance upsert.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use super::client::GmailApiClient;
use crate::models::{AttachmentIngestResult, AttachmentIngestStatus, SelectedAttachment};
use crate::services::report_processor::ReportProcessor;

pub async fn ingest_selected_attachments(
    pool: &PgPool,
    gmail: &Arc<dyn GmailApiClient>,
    report_processor: &Arc<ReportProcessor>,
    access_token: &str,
    patient_id: Uuid,
    selections: &[SelectedAttachment],
) -> Vec<AttachmentIngestResult> {
    let mut results = Vec::with_capacity(selections.len());
    for selection in selections {
        results.push(
            ingest_one(pool, gmail, report_processor, access_token, patient_id, selection).await,
        );
    }
    results
}

async fn ingest_one(
    pool: &PgPool,
    gmail: &Arc<dyn GmailApiClient>,
    report_processor: &Arc<ReportProcessor>,
    access_token: &str,
    patient_id: Uuid,
    selection: &SelectedAttachment,
) -> AttachmentIngestResult {
    let message_id = &selection.message_id;
    let attachment_id = &selection.attachment_id;

    if let Some(report_id) = already_seen_by_ids(pool, message_id, attachment_id).await {
        return duplicate_result(message_id, attachment_id, Some(report_id));
    }

    let bytes = match gmail.get_attachment_bytes(access_token, message_id, attachment_id).await {
        Ok(b) => b,
        Err(e) => return failed_result(message_id, attachment_id, e.to_string()),
    };

    let checksum = sha256_hex(&bytes);
    if let Some(report_id) = already_seen_by_checksum(pool, &checksum).await {
        return duplicate_result(message_id, attachment_id, Some(report_id));
    }

    let message = match gmail.get_message_body(access_token, message_id).await {
        Ok(m) => m,
        Err(e) => return failed_result(message_id, attachment_id, e.to_string()),
    };
    let detected_mime = message
        .attachments
        .iter()
        .find(|a| &a.attachment_id == attachment_id)
        .map(|a| a.mime_type.clone())
        .unwrap_or_default();
    let mime_type = normalize_mime(&detected_mime, attachment_id);

    let source_filename = message
        .attachments
        .iter()
        .find(|a| &a.attachment_id == attachment_id)
        .map(|a| a.filename.clone())
        .unwrap_or_else(|| format!("{attachment_id}.bin"));

    let outcome = match report_processor.ingest(patient_id, &source_filename, &mime_type, &bytes).await {
        Ok(o) => o,
        Err(e) => return failed_result(message_id, attachment_id, e.to_string()),
    };

    let header = gmail.get_message_header(access_token, message_id).await.ok();
    let _ = upsert_provenance(pool, outcome.report_id, message_id, attachment_id, &checksum, header.as_ref()).await;

    AttachmentIngestResult {
        message_id: message_id.clone(),
        attachment_id: attachment_id.clone(),
        status: if outcome.was_freshly_created {
            AttachmentIngestStatus::Completed
        } else {
            AttachmentIngestStatus::Updated
        },
        report_id: Some(outcome.report_id),
        error: None,
    }
}

async fn already_seen_by_ids(pool: &PgPool, message_id: &str, attachment_id: &str) -> Option<Uuid> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT report_id FROM gmail_report_provenance WHERE message_id = $1 AND attachment_id = $2",
    )
    .bind(message_id)
    .bind(attachment_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
}

async fn already_seen_by_checksum(pool: &PgPool, checksum: &str) -> Option<Uuid> {
    sqlx::query_scalar::<_, Uuid>("SELECT report_id FROM gmail_report_provenance WHERE attachment_checksum = $1")
        .bind(checksum)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
}

async fn upsert_provenance(
    pool: &PgPool,
    report_id: Uuid,
    message_id: &str,
    attachment_id: &str,
    checksum: &str,
    header: Option<&crate::models::GmailMessageHeader>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO gmail_report_provenance
            (id, report_id, message_id, attachment_id, sender_email, sender_name, subject, email_date, attachment_checksum)
        VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (message_id, attachment_id) DO NOTHING
        "#,
    )
    .bind(report_id)
    .bind(message_id)
    .bind(attachment_id)
    .bind(header.map(|h| h.from_email.clone()))
    .bind(header.and_then(|h| h.from_name.clone()))
    .bind(header.map(|h| h.subject.clone()))
    .bind(header.and_then(|h| h.date))
    .bind(checksum)
    .execute(pool)
    .await?;
    Ok(())
}

/// `application/octet-stream` (or anything blank) falls back to an
/// extension heuristic off the attachment id's conventional suffix; Gmail
/// attachment ids carry no extension, so the caller should prefer the
/// filename-derived mime where available and only reach this as a last
/// resort.
fn normalize_mime(detected: &str, filename_hint: &str) -> String {
    if !detected.is_empty() && detected != "application/octet-stream" {
        return detected.to_string();
    }
    match filename_hint.rsplit('.').next().map(|e| e.to_lowercase()) {
        Some(ext) if ext == "pdf" => "application/pdf".to_string(),
        Some(ext) if ext == "png" => "image/png".to_string(),
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg".to_string(),
        Some(ext) if ext == "heic" => "image/heic".to_string(),
        Some(ext) if ext == "webp" => "image/webp".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn duplicate_result(message_id: &str, attachment_id: &str, report_id: Option<Uuid>) -> AttachmentIngestResult {
    AttachmentIngestResult {
        message_id: message_id.to_string(),
        attachment_id: attachment_id.to_string(),
        status: AttachmentIngestStatus::Duplicate,
        report_id,
        error: None,
    }
}

fn failed_result(message_id: &str, attachment_id: &str, error: String) -> AttachmentIngestResult {
    AttachmentIngestResult {
        message_id: message_id.to_string(),
        attachment_id: attachment_id.to_string(),
        status: AttachmentIngestStatus::Failed,
        report_id: None,
        error: Some(error),
    }
}

/// Batch-level terminal state derived from the individual results (§4.9).
pub fn batch_status(results: &[AttachmentIngestResult]) -> &'static str {
    let failed = results.iter().any(|r| r.status == AttachmentIngestStatus::Failed);
    let succeeded = results
        .iter()
        .any(|r| matches!(r.status, AttachmentIngestStatus::Completed | AttachmentIngestStatus::Updated));
    match (failed, succeeded) {
        (true, true) => "partial_failure",
        (true, false) => "partial_failure",
        _ => "completed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_octet_stream_by_extension() {
        assert_eq!(normalize_mime("application/octet-stream", "report.pdf"), "application/pdf");
    }

    #[test]
    fn keeps_concrete_mime_type() {
        assert_eq!(normalize_mime("image/png", "scan"), "image/png");
    }

    #[test]
    fn batch_status_reports_partial_failure() {
        let results = vec![
            duplicate_result("m1", "a1", Some(Uuid::nil())),
            failed_result("m2", "a2", "boom".to_string()),
        ];
        assert_eq!(batch_status(&results), "partial_failure");
    }
}
