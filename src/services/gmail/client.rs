//! Thin Gmail REST client behind a trait, mirroring `report_processor`'s
//! `VisionExtractor` seam: stages 1/3 depend only on this trait, so the
//! sweep/ingestion logic is testable without live Gmail credentials.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use std::time::Duration;

use crate::models::GmailMessageHeader;
use crate::utils::{ApiError, ApiResult};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const RATE_LIMIT_BASE_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: String,
    pub text_body: Option<String>,
    pub attachments: Vec<crate::models::AttachmentMetadata>,
}

#[async_trait]
pub trait GmailApiClient: Send + Sync {
    async fn list_message_ids(&self, access_token: &str, page_size: u32, page_token: Option<&str>)
    -> ApiResult<(Vec<String>, Option<String>)>;

    async fn get_message_header(&self, access_token: &str, message_id: &str) -> ApiResult<GmailMessageHeader>;

    async fn get_message_body(&self, access_token: &str, message_id: &str) -> ApiResult<RawMessage>;

    async fn get_attachment_bytes(
        &self,
        access_token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> ApiResult<Vec<u8>>;
}

pub struct HttpGmailClient {
    http: reqwest::Client,
}

impl Default for HttpGmailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpGmailClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Retries on HTTP 429 and 403 `rateLimitExceeded`, base 60s, ×2 backoff,
    /// capped at `max_retries` attempts (§4.9 Stage 1/3, §5).
    async fn get_with_backoff(&self, url: &str, access_token: &str, max_retries: u32) -> ApiResult<reqwest::Response> {
        let backoff_policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(RATE_LIMIT_BASE_SECS))
            .with_multiplier(2.0)
            .with_max_elapsed_time(Some(Duration::from_secs(RATE_LIMIT_BASE_SECS * (1 << max_retries.min(10)))))
            .build();

        retry(backoff_policy, || async {
            let response = self
                .http
                .get(url)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| backoff::Error::permanent(ApiError::internal_error(e.to_string())))?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                || response.status() == reqwest::StatusCode::FORBIDDEN
            {
                return Err(backoff::Error::transient(ApiError::internal_error(format!(
                    "gmail rate limited: {}",
                    response.status()
                ))));
            }

            if !response.status().is_success() {
                return Err(backoff::Error::permanent(ApiError::internal_error(format!(
                    "gmail api error: {}",
                    response.status()
                ))));
            }

            Ok(response)
        })
        .await
    }
}

#[async_trait]
impl GmailApiClient for HttpGmailClient {
    async fn list_message_ids(
        &self,
        access_token: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> ApiResult<(Vec<String>, Option<String>)> {
        let capped = page_size.min(500);
        let mut url = format!("{GMAIL_API_BASE}/messages?maxResults={capped}&q=in:inbox");
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={token}"));
        }
        let response = self.get_with_backoff(&url, access_token, 5).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| ApiError::internal_error(e.to_string()))?;

        let ids = body
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|i| i.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let next = body.get("nextPageToken").and_then(|t| t.as_str()).map(str::to_string);
        Ok((ids, next))
    }

    async fn get_message_header(&self, access_token: &str, message_id: &str) -> ApiResult<GmailMessageHeader> {
        let url = format!(
            "{GMAIL_API_BASE}/messages/{message_id}?format=metadata&metadataHeaders=Subject&metadataHeaders=From&metadataHeaders=Date"
        );
        let response = self.get_with_backoff(&url, access_token, 5).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(parse_header(message_id, &body))
    }

    async fn get_message_body(&self, access_token: &str, message_id: &str) -> ApiResult<RawMessage> {
        let url = format!("{GMAIL_API_BASE}/messages/{message_id}?format=full");
        let response = self.get_with_backoff(&url, access_token, 5).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| ApiError::internal_error(e.to_string()))?;
        Ok(parse_full_message(message_id, &body))
    }

    async fn get_attachment_bytes(
        &self,
        access_token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> ApiResult<Vec<u8>> {
        let url = format!("{GMAIL_API_BASE}/messages/{message_id}/attachments/{attachment_id}");
        let response = self.get_with_backoff(&url, access_token, 3).await?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| ApiError::internal_error(e.to_string()))?;
        let data = body
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or_else(|| ApiError::internal_error("attachment response missing data"))?;
        decode_base64url(data).map_err(ApiError::internal_error)
    }
}

fn parse_header(message_id: &str, body: &serde_json::Value) -> GmailMessageHeader {
    let headers = body.get("payload").and_then(|p| p.get("headers")).and_then(|h| h.as_array());
    let find = |name: &str| -> Option<String> {
        headers?.iter().find(|h| h.get("name").and_then(|n| n.as_str()) == Some(name))?
            .get("value")?.as_str().map(str::to_string)
    };

    let subject = find("Subject").map(|s| decode_mime_header(&s)).unwrap_or_default();
    let from_raw = find("From").unwrap_or_default();
    let (from_name, from_email) = split_from_header(&from_raw);
    let date = find("Date").and_then(|d| chrono::DateTime::parse_from_rfc2822(&d).ok()).map(|d| d.with_timezone(&chrono::Utc));

    GmailMessageHeader { message_id: message_id.to_string(), subject, from_email, from_name, date }
}

fn parse_full_message(message_id: &str, body: &serde_json::Value) -> RawMessage {
    let payload = body.get("payload");
    let text_body = payload.and_then(extract_text_body);
    let attachments = payload.map(|p| collect_attachments(p)).unwrap_or_default();
    RawMessage { message_id: message_id.to_string(), text_body, attachments }
}

fn extract_text_body(payload: &serde_json::Value) -> Option<String> {
    let mime_type = payload.get("mimeType").and_then(|m| m.as_str()).unwrap_or_default();
    if mime_type == "text/plain" {
        if let Some(data) = payload.get("body").and_then(|b| b.get("data")).and_then(|d| d.as_str()) {
            return decode_base64url(data).ok().and_then(|bytes| String::from_utf8(bytes).ok());
        }
    }
    if let Some(parts) = payload.get("parts").and_then(|p| p.as_array()) {
        for part in parts {
            if let Some(found) = extract_text_body(part) {
                return Some(found);
            }
        }
        for part in parts {
            let mime_type = part.get("mimeType").and_then(|m| m.as_str()).unwrap_or_default();
            if mime_type == "text/html" {
                if let Some(data) = part.get("body").and_then(|b| b.get("data")).and_then(|d| d.as_str()) {
                    if let Ok(bytes) = decode_base64url(data) {
                        if let Ok(html) = String::from_utf8(bytes) {
                            return Some(strip_html_tags(&html));
                        }
                    }
                }
            }
        }
    }
    None
}

fn collect_attachments(payload: &serde_json::Value) -> Vec<crate::models::AttachmentMetadata> {
    let mut out = Vec::new();
    collect_attachments_rec(payload, &mut out);
    out
}

fn collect_attachments_rec(payload: &serde_json::Value, out: &mut Vec<crate::models::AttachmentMetadata>) {
    if let Some(filename) = payload.get("filename").and_then(|f| f.as_str()) {
        if !filename.is_empty() {
            if let Some(attachment_id) =
                payload.get("body").and_then(|b| b.get("attachmentId")).and_then(|a| a.as_str())
            {
                let mime_type =
                    payload.get("mimeType").and_then(|m| m.as_str()).unwrap_or_default().to_string();
                let size = payload.get("body").and_then(|b| b.get("size")).and_then(|s| s.as_i64()).unwrap_or(0);
                out.push(crate::models::AttachmentMetadata {
                    attachment_id: attachment_id.to_string(),
                    filename: filename.to_string(),
                    mime_type,
                    size,
                });
            }
        }
    }
    if let Some(parts) = payload.get("parts").and_then(|p| p.as_array()) {
        for part in parts {
            collect_attachments_rec(part, out);
        }
    }
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {},
        }
    }
    out
}

fn decode_base64url(input: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE.decode(input.trim_end_matches('=')).or_else(|_| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input)
    }).map_err(|e| e.to_string())
}

/// Decodes RFC 2047 MIME-encoded headers (`=?charset?B?...?=` /
/// `=?charset?Q?...?=`). Unencoded headers pass through untouched.
pub fn decode_mime_header(raw: &str) -> String {
    let mut out = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let Some(encoded) = rest[start..].find("?=").map(|end| &rest[start..start + end + 2]) else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let parts: Vec<&str> = encoded.trim_start_matches("=?").trim_end_matches("?=").splitn(3, '?').collect();
        if parts.len() == 3 {
            let (_, encoding, text) = (parts[0], parts[1].to_uppercase(), parts[2]);
            let decoded = match encoding.as_str() {
                "B" => {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD
                        .decode(text)
                        .ok()
                        .and_then(|bytes| String::from_utf8(bytes).ok())
                },
                "Q" => Some(decode_quoted_printable(text)),
                _ => None,
            };
            out.push_str(&decoded.unwrap_or_else(|| encoded.to_string()));
        } else {
            out.push_str(encoded);
        }
        rest = &rest[start + encoded.len()..];
    }
    out.push_str(rest);
    out
}

fn decode_quoted_printable(text: &str) -> String {
    let mut out = String::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                out.push(' ');
                i += 1;
            },
            b'=' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&text[i + 1..i + 3], 16) {
                    out.push(byte as char);
                }
                i += 3;
            },
            b => {
                out.push(b as char);
                i += 1;
            },
        }
    }
    out
}

fn split_from_header(raw: &str) -> (Option<String>, String) {
    let decoded = decode_mime_header(raw);
    if let Some(lt) = decoded.find('<') {
        let name = decoded[..lt].trim().trim_matches('"').to_string();
        let email = decoded[lt + 1..].trim_end_matches('>').trim().to_string();
        (if name.is_empty() { None } else { Some(name) }, email)
    } else {
        (None, decoded.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_mime_header() {
        assert_eq!(decode_mime_header("=?UTF-8?B?SGVsbG8=?="), "Hello");
    }

    #[test]
    fn passes_through_plain_header() {
        assert_eq!(decode_mime_header("Lab Results"), "Lab Results");
    }

    #[test]
    fn splits_name_and_email() {
        let (name, email) = split_from_header("Acme Labs <no-reply@acmelabs.test>");
        assert_eq!(name.as_deref(), Some("Acme Labs"));
        assert_eq!(email, "no-reply@acmelabs.test");
    }
}
