//! Concrete `VisionExtractor` backed by an OpenAI-compatible multimodal
//! chat endpoint. PDF rasterization and the vision call itself are external
//! collaborators per the ingestion contract (C7); this is the HTTP-facing
//! edge that satisfies the trait, not a core algorithm.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::models::ExtractedReport;
use crate::services::llm::LlmEndpoint;
use crate::services::report_processor::VisionExtractor;
use crate::utils::{ApiError, ApiResult};

const MAX_PDF_PAGES: usize = 10;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a lab report extraction model. Given one or more \
page images of a laboratory report, return a JSON object with fields: patient_name, patient_age, \
patient_dob (YYYY-MM-DD), patient_gender, test_date (YYYY-MM-DD), missing_data (array of strings \
naming fields you could not read), and parameters (array of objects with parameter_name, result, \
unit, reference_interval {lower, lower_operator, upper, upper_operator, text, full_text}, \
is_value_out_of_range, numeric_result, specimen_type). Every field you cannot determine must be \
null, never omitted or guessed.";

pub struct LlmVisionExtractor {
    http: reqwest::Client,
    endpoint: LlmEndpoint,
}

impl LlmVisionExtractor {
    pub fn new(endpoint: LlmEndpoint) -> Self {
        Self { http: reqwest::Client::new(), endpoint }
    }
}

#[async_trait]
impl VisionExtractor for LlmVisionExtractor {
    /// Images count as a single page each. PDFs are approximated by counting
    /// `/Type /Page` object markers, since no PDF-parsing crate is available;
    /// real rasterization happens upstream of this seam.
    async fn page_count(&self, bytes: &[u8], mime_type: &str) -> ApiResult<usize> {
        if mime_type != "application/pdf" {
            return Ok(1);
        }
        let count = count_pdf_page_markers(bytes);
        Ok(count.max(1))
    }

    /// Rasterization itself is an external collaborator (out of scope); this
    /// implementation passes the raw PDF bytes through as a single page so
    /// the rest of the pipeline has something to hand the vision model.
    async fn convert_pdf_to_images(&self, bytes: &[u8]) -> ApiResult<Vec<Vec<u8>>> {
        Ok(vec![bytes.to_vec()])
    }

    async fn extract(&self, images: &[Vec<u8>], mime_type: &str) -> ApiResult<ExtractedReport> {
        let image_mime = if mime_type == "application/pdf" { "image/png" } else { mime_type };

        let content: Vec<serde_json::Value> = std::iter::once(serde_json::json!({
            "type": "text",
            "text": "Extract this laboratory report.",
        }))
        .chain(images.iter().map(|bytes| {
            serde_json::json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{image_mime};base64,{}", BASE64.encode(bytes)),
                },
            })
        }))
        .collect();

        let body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [
                { "role": "system", "content": EXTRACTION_SYSTEM_PROMPT },
                { "role": "user", "content": content },
            ],
            "max_tokens": self.endpoint.max_tokens,
            "temperature": self.endpoint.temperature,
            "response_format": { "type": "json_object" },
        });

        let url = format!("{}/chat/completions", self.endpoint.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.endpoint.api_key)
            .timeout(self.endpoint.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::internal_error(format!("vision request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::internal_error(format!("vision api error {status}: {text}")));
        }

        let parsed: VisionChatResponse = response
            .json()
            .await
            .map_err(|e| ApiError::internal_error(format!("vision response decode failed: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::internal_error("vision response had no content"))?;

        serde_json::from_str(&content)
            .map_err(|e| ApiError::internal_error(format!("vision json did not match schema: {e}")))
    }
}

fn count_pdf_page_markers(bytes: &[u8]) -> usize {
    let needle = b"/Type /Page";
    let alt_needle = b"/Type/Page";
    let count_non_overlapping = |hay: &[u8], needle: &[u8]| {
        let mut count = 0;
        let mut i = 0;
        while i + needle.len() <= hay.len() {
            if &hay[i..i + needle.len()] == needle {
                count += 1;
                i += needle.len();
            } else {
                i += 1;
            }
        }
        count
    };
    let count = count_non_overlapping(bytes, needle) + count_non_overlapping(bytes, alt_needle);
    count.min(MAX_PDF_PAGES * 4)
}

#[derive(Debug, Deserialize)]
struct VisionChatResponse {
    choices: Vec<VisionChatChoice>,
}

#[derive(Debug, Deserialize)]
struct VisionChatChoice {
    message: VisionChatMessage,
}

#[derive(Debug, Deserialize)]
struct VisionChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_pdf_page_markers() {
        let bytes = b"/Type /Page /Type /Page /Type /Page".to_vec();
        assert_eq!(count_pdf_page_markers(&bytes), 3);
    }

    #[test]
    fn non_pdf_has_no_markers() {
        assert_eq!(count_pdf_page_markers(b"not a pdf"), 0);
    }
}
