//! Stage 2 (§4.9): subject classifier (cheap triage) then body classifier
//! (full message + attachment validation) with a deterministic
//! no-body/attachments-only shortcut ahead of the LLM call.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::client::GmailApiClient;
use crate::models::{AttachmentMetadata, BodyClassification, GmailMessageHeader, SubjectClassification};
use crate::services::llm::{LlmClient, LlmEndpoint};
use crate::utils::ApiResult;

const SUBJECT_BATCH_SIZE: usize = 25;
const SUBJECT_BATCH_CONCURRENCY: usize = 3;
const BODY_BATCH_SIZE: usize = 25;
const BODY_BATCH_CONCURRENCY: usize = 3;

const OCR_ABLE_MIME: &[&str] = &["application/pdf", "image/png", "image/jpeg", "image/heic"];
const OCR_ABLE_EXT: &[&str] = &["pdf", "png", "jpg", "jpeg", "heic"];

#[derive(Debug, Serialize)]
struct SubjectClassifyRequest<'a> {
    headers: &'a [GmailMessageHeader],
}

#[derive(Debug, Deserialize)]
struct SubjectClassifyResponse {
    classifications: Vec<SubjectClassification>,
}

const SUBJECT_SYSTEM_PROMPT: &str = "Classify each email header by whether it is likely to contain a \
    laboratory test report attachment. Respond with JSON {\"classifications\": \
    [{\"id\", \"is_lab_likely\", \"confidence\", \"reason\"}, ...]} covering every input id.";

pub async fn subject_classify(
    llm: &LlmClient,
    endpoint: &LlmEndpoint,
    headers: &[GmailMessageHeader],
) -> Vec<SubjectClassification> {
    let limiter = Arc::new(Semaphore::new(SUBJECT_BATCH_CONCURRENCY));
    let tasks = headers.chunks(SUBJECT_BATCH_SIZE).map(|chunk| {
        let limiter = Arc::clone(&limiter);
        async move {
            let _permit = limiter.acquire().await.ok()?;
            classify_subject_batch_with_retry(llm, endpoint, chunk).await
        }
    });
    join_all(tasks).await.into_iter().flatten().flatten().collect()
}

async fn classify_subject_batch_with_retry(
    llm: &LlmClient,
    endpoint: &LlmEndpoint,
    chunk: &[GmailMessageHeader],
) -> Option<Vec<SubjectClassification>> {
    let backoff_policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(3)))
        .build();

    retry(backoff_policy, || async {
        let request = SubjectClassifyRequest { headers: chunk };
        llm.complete_json::<_, SubjectClassifyResponse>(endpoint, SUBJECT_SYSTEM_PROMPT, &request)
            .await
            .map(|r| r.classifications)
            .map_err(backoff::Error::transient)
    })
    .await
    .ok()
}

/// True if `mime_type` or `filename`'s extension is in the OCR-able set
/// (§4.9 Stage 2).
pub fn is_ocr_able(mime_type: &str, filename: &str) -> bool {
    if OCR_ABLE_MIME.contains(&mime_type) {
        return true;
    }
    filename
        .rsplit('.')
        .next()
        .map(|ext| OCR_ABLE_EXT.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Validates one attachment's metadata per §4.9 Stage 2; returns the issue
/// description if invalid.
fn validate_attachment(attachment: &AttachmentMetadata) -> Option<String> {
    if attachment.filename.is_empty() || attachment.filename.len() > 255 || attachment.filename.contains('\0') {
        return Some(format!("invalid filename for attachment {}", attachment.attachment_id));
    }
    if attachment.size < 0 {
        return Some(format!("negative size for attachment {}", attachment.attachment_id));
    }
    if attachment.attachment_id.is_empty() {
        return Some("empty attachment id".to_string());
    }
    if attachment.mime_type.is_empty() {
        return Some(format!("empty mime type for attachment {}", attachment.filename));
    }
    None
}

#[derive(Debug, Serialize)]
struct BodyClassifyRequest<'a> {
    message_id: &'a str,
    subject: &'a str,
    body: &'a str,
    attachments: &'a [AttachmentMetadata],
}

#[derive(Debug, Deserialize)]
struct BodyClassifyLlmResponse {
    accepted: bool,
    confidence: f64,
    attachment_decisions: Vec<AttachmentDecision>,
}

#[derive(Debug, Deserialize)]
struct AttachmentDecision {
    attachment_id: String,
    is_likely_lab_report: bool,
}

const BODY_SYSTEM_PROMPT: &str = "Decide whether this email is likely to contain a laboratory test \
    report and which attachments are likely to be that report. Respond with JSON {\"accepted\", \
    \"confidence\", \"attachment_decisions\": [{\"attachment_id\", \"is_likely_lab_report\"}, ...]}.";

pub async fn body_classify(
    gmail: &Arc<dyn GmailApiClient>,
    llm: &LlmClient,
    endpoint: &LlmEndpoint,
    access_token: &str,
    candidates: &[GmailMessageHeader],
    max_body_chars: usize,
) -> Vec<BodyClassification> {
    let limiter = Arc::new(Semaphore::new(BODY_BATCH_CONCURRENCY));
    let tasks = candidates.chunks(BODY_BATCH_SIZE).map(|chunk| {
        let limiter = Arc::clone(&limiter);
        let gmail = Arc::clone(gmail);
        async move {
            let _permit = limiter.acquire().await.ok();
            let mut results = Vec::with_capacity(chunk.len());
            for header in chunk {
                results.push(
                    classify_one_body(&gmail, llm, endpoint, access_token, header, max_body_chars).await,
                );
            }
            results
        }
    });
    join_all(tasks).await.into_iter().flatten().collect()
}

async fn classify_one_body(
    gmail: &Arc<dyn GmailApiClient>,
    llm: &LlmClient,
    endpoint: &LlmEndpoint,
    access_token: &str,
    header: &GmailMessageHeader,
    max_body_chars: usize,
) -> BodyClassification {
    let message = match gmail.get_message_body(access_token, &header.message_id).await {
        Ok(m) => m,
        Err(_) => {
            return BodyClassification {
                message_id: header.message_id.clone(),
                accepted: false,
                confidence: 0.0,
                attachments: Vec::new(),
                rejected_attachments: Vec::new(),
                attachment_issues: vec!["failed to fetch message body".to_string()],
            };
        },
    };

    let mut attachment_issues = Vec::new();
    let mut valid_attachments = Vec::new();
    for attachment in &message.attachments {
        match validate_attachment(attachment) {
            Some(issue) => attachment_issues.push(issue),
            None => valid_attachments.push(attachment.clone()),
        }
    }

    let body = message
        .text_body
        .as_deref()
        .map(|b| collapse_whitespace(b))
        .map(|b| truncate_chars(&b, max_body_chars));

    if body.as_deref().map(str::is_empty).unwrap_or(true) {
        let ocr_able: Vec<AttachmentMetadata> = valid_attachments
            .into_iter()
            .filter(|a| is_ocr_able(&a.mime_type, &a.filename))
            .collect();
        return if ocr_able.is_empty() {
            BodyClassification {
                message_id: header.message_id.clone(),
                accepted: false,
                confidence: 1.0,
                attachments: Vec::new(),
                rejected_attachments: Vec::new(),
                attachment_issues,
            }
        } else {
            BodyClassification {
                message_id: header.message_id.clone(),
                accepted: true,
                confidence: 0.75,
                attachments: ocr_able,
                rejected_attachments: Vec::new(),
                attachment_issues,
            }
        };
    }

    let body = body.unwrap_or_default();
    let request = BodyClassifyRequest {
        message_id: &header.message_id,
        subject: &header.subject,
        body: &body,
        attachments: &valid_attachments,
    };

    match llm.complete_json::<_, BodyClassifyLlmResponse>(endpoint, BODY_SYSTEM_PROMPT, &request).await {
        Ok(response) => {
            let mut attachments = Vec::new();
            let mut rejected_attachments = Vec::new();
            for attachment in valid_attachments {
                let likely = response
                    .attachment_decisions
                    .iter()
                    .find(|d| d.attachment_id == attachment.attachment_id)
                    .map(|d| d.is_likely_lab_report)
                    .unwrap_or(false);
                if likely {
                    attachments.push(attachment);
                } else {
                    rejected_attachments.push(attachment);
                }
            }
            BodyClassification {
                message_id: header.message_id.clone(),
                accepted: response.accepted,
                confidence: response.confidence,
                attachments,
                rejected_attachments,
                attachment_issues,
            }
        },
        Err(_) => BodyClassification {
            message_id: header.message_id.clone(),
            accepted: false,
            confidence: 0.0,
            attachments: Vec::new(),
            rejected_attachments: valid_attachments,
            attachment_issues,
        },
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_ocr_able_by_mime() {
        assert!(is_ocr_able("application/pdf", "report"));
    }

    #[test]
    fn recognizes_ocr_able_by_extension() {
        assert!(is_ocr_able("application/octet-stream", "report.PDF"));
    }

    #[test]
    fn rejects_non_ocr_able_attachment() {
        assert!(!is_ocr_able("text/plain", "notes.txt"));
    }

    #[test]
    fn rejects_attachment_with_null_byte_filename() {
        let attachment = AttachmentMetadata {
            attachment_id: "a1".to_string(),
            filename: "bad\0name.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 10,
        };
        assert!(validate_attachment(&attachment).is_some());
    }

    #[test]
    fn accepts_well_formed_attachment() {
        let attachment = AttachmentMetadata {
            attachment_id: "a1".to_string(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 10,
        };
        assert!(validate_attachment(&attachment).is_none());
    }
}
