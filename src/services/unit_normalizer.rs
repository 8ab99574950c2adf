//! Tiered unit resolution (C5, spec §4.5): exact alias lookup, LLM fallback,
//! UCUM validation, advisory-locked auto-learn, review queue. Grounded on
//! `db.rs`'s advisory-lock discipline and `services::llm::LlmClient`'s
//! JSON-mode transport.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::UnitNormalizationConfig;
use crate::db::Db;
use crate::models::{NormalizedUnit, UnitConfidence, UnitTier};
use crate::services::llm::{LlmClient, LlmEndpoint};
use crate::utils::ApiResult;

const MAX_LLM_INPUT_CHARS: usize = 100;
const MAX_LLM_OUTPUT_CHARS: usize = 50;

const SYSTEM_PROMPT: &str = "You normalize laboratory unit strings to UCUM-style canonical \
form. Respond only with the requested JSON object.";

#[derive(Debug, Serialize)]
struct UnitCanonicalizationRequest {
    raw_unit: String,
}

#[derive(Debug, Deserialize)]
struct UnitCanonicalizationResponse {
    canonical: String,
    confidence: UnitConfidence,
}

pub struct UnitNormalizer {
    db: Db,
    llm: Arc<LlmClient>,
    endpoint: LlmEndpoint,
    config: UnitNormalizationConfig,
}

impl UnitNormalizer {
    pub fn new(db: Db, llm: Arc<LlmClient>, endpoint: LlmEndpoint, config: UnitNormalizationConfig) -> Self {
        Self { db, llm, endpoint, config }
    }

    /// Deduplicates `raw_units` within the batch, resolves each unique value
    /// once, and fans the result back out. `global_limit`, when given, caps
    /// concurrency across overlapping batches (e.g. a Gmail sweep ingesting
    /// several reports at once); the per-report cap always applies too.
    pub async fn normalize_units_batch(
        &self,
        raw_units: &[(Uuid, String)],
        global_limit: Option<&Semaphore>,
    ) -> HashMap<Uuid, NormalizedUnit> {
        let report_limit = Semaphore::new(self.config.max_concurrency);
        let report_limit = &report_limit;

        let mut unique: HashMap<String, Vec<Uuid>> = HashMap::new();
        for (result_id, raw) in raw_units {
            unique.entry(raw.clone()).or_default().push(*result_id);
        }

        let mut resolved = HashMap::new();
        let mut tasks = Vec::new();
        for (raw, result_ids) in unique {
            tasks.push(async move {
                let _report_permit = report_limit.acquire().await;
                let _global_permit = match global_limit {
                    Some(sem) => Some(sem.acquire().await),
                    None => None,
                };
                let outcome = self.normalize_one(&raw, result_ids.first().copied()).await.unwrap_or_else(|_| {
                    NormalizedUnit { canonical: raw.clone(), tier: UnitTier::Raw, confidence: None }
                });
                (result_ids, outcome)
            });
        }

        for (result_ids, outcome) in futures::future::join_all(tasks).await {
            for id in result_ids {
                resolved.insert(id, outcome.clone());
            }
        }

        resolved
    }

    /// Single-unit pipeline (§4.5 steps 1-8). `result_id` is used only to
    /// attribute a review-queue row if resolution fails to reach a confident
    /// canonical form.
    pub async fn normalize_one(&self, raw_unit: &str, result_id: Option<Uuid>) -> ApiResult<NormalizedUnit> {
        if raw_unit.trim().is_empty() {
            return Ok(NormalizedUnit { canonical: String::new(), tier: UnitTier::Raw, confidence: None });
        }

        let normalized: Option<String> =
            sqlx::query_scalar("SELECT normalize_unit_text($1)").bind(raw_unit).fetch_one(&self.db.app).await?;
        let Some(normalized) = normalized else {
            return Ok(NormalizedUnit { canonical: String::new(), tier: UnitTier::Raw, confidence: None });
        };

        if let Some(canonical) =
            sqlx::query_scalar::<_, String>("SELECT canonical FROM unit_aliases WHERE alias = $1")
                .bind(&normalized)
                .fetch_optional(&self.db.app)
                .await?
        {
            return Ok(NormalizedUnit { canonical, tier: UnitTier::Exact, confidence: None });
        }

        self.resolve_via_llm(&normalized, raw_unit, result_id).await
    }

    async fn resolve_via_llm(
        &self,
        normalized: &str,
        raw_unit: &str,
        result_id: Option<Uuid>,
    ) -> ApiResult<NormalizedUnit> {
        let sanitized = sanitize_for_llm(normalized);

        let Ok(response) = self
            .llm
            .complete_json::<_, UnitCanonicalizationResponse>(
                &self.endpoint,
                SYSTEM_PROMPT,
                &UnitCanonicalizationRequest { raw_unit: sanitized },
            )
            .await
        else {
            self.queue_review(result_id, raw_unit, normalized, None, None, "llm_error").await;
            return Ok(NormalizedUnit { canonical: raw_unit.to_string(), tier: UnitTier::Raw, confidence: None });
        };

        let mut canonical = ascii_preprocess(&response.canonical);
        if canonical.chars().count() > MAX_LLM_OUTPUT_CHARS {
            canonical.truncate(MAX_LLM_OUTPUT_CHARS);
        }

        match validate_ucum(&canonical) {
            UcumOutcome::Valid => {
                self.finish(&canonical, response.confidence, raw_unit, normalized, result_id).await
            },
            UcumOutcome::AutoCorrected(corrected) => {
                self.finish(&corrected, response.confidence, raw_unit, normalized, result_id).await
            },
            UcumOutcome::Suggestions(suggestions) => {
                if let Some(retry) = self.retry_with_suggestions(&sanitized_retry(raw_unit), &suggestions).await {
                    self.finish(&retry.canonical, retry.confidence, raw_unit, normalized, result_id).await
                } else {
                    self.queue_review(
                        result_id,
                        raw_unit,
                        normalized,
                        Some(&canonical),
                        Some(response.confidence),
                        "ucum_invalid",
                    )
                    .await;
                    Ok(NormalizedUnit { canonical: raw_unit.to_string(), tier: UnitTier::Raw, confidence: None })
                }
            },
        }
    }

    async fn retry_with_suggestions(
        &self,
        raw_unit: &str,
        suggestions: &[String],
    ) -> Option<UnitCanonicalizationResponse> {
        let prompt = format!(
            "{SYSTEM_PROMPT} The prior answer was invalid UCUM. Pick exactly one of: {}.",
            suggestions.join(", ")
        );
        self.llm
            .complete_json::<_, UnitCanonicalizationResponse>(
                &self.endpoint,
                &prompt,
                &UnitCanonicalizationRequest { raw_unit: raw_unit.to_string() },
            )
            .await
            .ok()
    }

    async fn finish(
        &self,
        canonical: &str,
        confidence: UnitConfidence,
        raw_unit: &str,
        normalized: &str,
        result_id: Option<Uuid>,
    ) -> ApiResult<NormalizedUnit> {
        if !confidence.meets(self.config.auto_learn_confidence) {
            self.queue_review(result_id, raw_unit, normalized, Some(canonical), Some(confidence), "low_confidence")
                .await;
            return Ok(NormalizedUnit { canonical: raw_unit.to_string(), tier: UnitTier::Raw, confidence: None });
        }

        match self.auto_learn(normalized, canonical).await {
            Ok(AutoLearnOutcome::Learned) | Ok(AutoLearnOutcome::Reinforced) => Ok(NormalizedUnit {
                canonical: canonical.to_string(),
                tier: UnitTier::Llm,
                confidence: Some(confidence),
            }),
            Ok(AutoLearnOutcome::Conflict { existing_canonical }) => {
                self.queue_review_with_conflict(
                    result_id,
                    raw_unit,
                    normalized,
                    Some(canonical),
                    Some(confidence),
                    "alias_conflict",
                    Some(&existing_canonical),
                )
                .await;
                Ok(NormalizedUnit { canonical: raw_unit.to_string(), tier: UnitTier::Raw, confidence: None })
            },
            Err(_) => Ok(NormalizedUnit {
                canonical: canonical.to_string(),
                tier: UnitTier::Llm,
                confidence: Some(confidence),
            }),
        }
    }

    /// §4.5 step 7: session-bound advisory lock keyed by the 32-bit hash of
    /// the alias, re-checked under the lock.
    async fn auto_learn(&self, alias: &str, canonical: &str) -> ApiResult<AutoLearnOutcome> {
        let mut tx: Transaction<'static, Postgres> = self.db.admin.begin().await?;
        let outcome = self
            .db
            .with_advisory_lock(&mut tx, alias, async move |tx| {
                let alias = alias.to_string();
                let canonical = canonical.to_string();
                let existing: Option<String> =
                    sqlx::query_scalar("SELECT canonical FROM unit_aliases WHERE alias = $1")
                        .bind(&alias)
                        .fetch_optional(&mut **tx)
                        .await?;

                match existing {
                    None => {
                        sqlx::query(
                            "INSERT INTO unit_aliases (alias, canonical, source, learn_count, last_used_at) \
                             VALUES ($1, $2, 'llm', 1, now())",
                        )
                        .bind(&alias)
                        .bind(&canonical)
                        .execute(&mut **tx)
                        .await?;
                        Ok(AutoLearnOutcome::Learned)
                    },
                    Some(existing_canonical) if existing_canonical == canonical => {
                        sqlx::query(
                            "UPDATE unit_aliases SET learn_count = learn_count + 1, last_used_at = now() \
                             WHERE alias = $1",
                        )
                        .bind(&alias)
                        .execute(&mut **tx)
                        .await?;
                        Ok(AutoLearnOutcome::Reinforced)
                    },
                    Some(existing_canonical) => Ok(AutoLearnOutcome::Conflict { existing_canonical }),
                }
            })
            .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// §4.5: only one pending review per raw unit at a time; queue failure
    /// is non-fatal.
    async fn queue_review(
        &self,
        result_id: Option<Uuid>,
        raw_unit: &str,
        normalized_input: &str,
        llm_suggestion: Option<&str>,
        confidence: Option<UnitConfidence>,
        issue_type: &str,
    ) {
        self.queue_review_with_conflict(result_id, raw_unit, normalized_input, llm_suggestion, confidence, issue_type, None)
            .await;
    }

    /// Same as `queue_review`, but for the `alias_conflict` issue type: the
    /// schema has no dedicated column for the canonical unit the new alias
    /// collided with (§8 S4), so it travels in `issue_details` instead.
    #[allow(clippy::too_many_arguments)]
    async fn queue_review_with_conflict(
        &self,
        result_id: Option<Uuid>,
        raw_unit: &str,
        normalized_input: &str,
        llm_suggestion: Option<&str>,
        confidence: Option<UnitConfidence>,
        issue_type: &str,
        existing_canonical: Option<&str>,
    ) {
        let Some(result_id) = result_id else { return };
        let confidence_text = confidence.map(|c| format!("{c:?}").to_lowercase());
        let issue_details = build_issue_details(existing_canonical);
        let _ = sqlx::query(
            "INSERT INTO unit_reviews \
             (id, result_id, raw_unit, normalized_input, llm_suggestion, confidence, issue_type, issue_details, status) \
             VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, 'pending') \
             ON CONFLICT DO NOTHING",
        )
        .bind(result_id)
        .bind(raw_unit)
        .bind(normalized_input)
        .bind(llm_suggestion)
        .bind(confidence_text)
        .bind(issue_type)
        .bind(issue_details)
        .execute(&self.db.admin)
        .await;
    }
}

/// §8 S4: `alias_conflict` reviews carry the canonical the new alias
/// collided with; every other issue type gets an empty object.
fn build_issue_details(existing_canonical: Option<&str>) -> serde_json::Value {
    match existing_canonical {
        Some(existing) => serde_json::json!({ "existing_canonical": existing }),
        None => serde_json::json!({}),
    }
}

enum AutoLearnOutcome {
    Learned,
    Reinforced,
    Conflict { existing_canonical: String },
}

enum UcumOutcome {
    Valid,
    AutoCorrected(String),
    Suggestions(Vec<String>),
}

/// §4.5 step 4: whitelist to letters (all scripts), digits, whitespace, and
/// a small punctuation set including `^` for `10^9/L`-style units.
fn sanitize_for_llm(input: &str) -> String {
    let allowed_punct = ['^', '/', '%', '.', '-', 'µ', 'μ', 'Ω', '°'];
    let filtered: String = input
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || allowed_punct.contains(c))
        .collect();
    let mut truncated = filtered;
    if truncated.chars().count() > MAX_LLM_INPUT_CHARS {
        truncated = truncated.chars().take(MAX_LLM_INPUT_CHARS).collect();
    }
    truncated
}

fn sanitized_retry(raw_unit: &str) -> String {
    sanitize_for_llm(raw_unit)
}

/// §4.5 step 5: ASCII preprocessing of LLM output (`μ/µ → u`, `Ω → Ohm`,
/// `° → deg`).
fn ascii_preprocess(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            'μ' | 'µ' => out.push('u'),
            'Ω' => out.push_str("Ohm"),
            '°' => out.push_str("deg"),
            other => out.push(other),
        }
    }
    out
}

/// Minimal UCUM surface: a lightweight allow-list plus common
/// auto-correctable spellings, kept local since no UCUM crate exists in the
/// dependency pack. Exhaustive UCUM grammar validation is out of scope
/// (§9 Non-goals carry over to this ambient concern as "best-effort").
const KNOWN_UNITS: &[&str] = &[
    "mg/dL", "g/dL", "mmol/L", "umol/L", "IU/L", "U/L", "mEq/L", "ng/mL", "pg/mL", "mIU/mL",
    "10^9/L", "10^12/L", "%", "mm/h", "fL", "pg", "mmHg", "ratio", "g/L", "mg/L",
];

const AUTO_CORRECTIONS: &[(&str, &str)] = &[
    ("mg/dl", "mg/dL"),
    ("mmol/l", "mmol/L"),
    ("g/dl", "g/dL"),
    ("iu/l", "IU/L"),
    ("u/l", "U/L"),
];

fn validate_ucum(candidate: &str) -> UcumOutcome {
    if KNOWN_UNITS.iter().any(|u| *u == candidate) {
        return UcumOutcome::Valid;
    }

    let lowered = candidate.to_lowercase();
    for (bad, good) in AUTO_CORRECTIONS {
        if lowered == bad.to_lowercase() {
            return UcumOutcome::AutoCorrected(good.to_string());
        }
    }

    let suggestions: Vec<String> = KNOWN_UNITS
        .iter()
        .filter(|u| u.to_lowercase().starts_with(&lowered.chars().take(2).collect::<String>()))
        .map(|u| u.to_string())
        .collect();

    if suggestions.is_empty() { UcumOutcome::Valid } else { UcumOutcome::Suggestions(suggestions) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_corrects_lowercase_mg_dl() {
        match validate_ucum("mg/dl") {
            UcumOutcome::AutoCorrected(c) => assert_eq!(c, "mg/dL"),
            _ => panic!("expected auto-correction"),
        }
    }

    #[test]
    fn accepts_known_unit() {
        assert!(matches!(validate_ucum("mmol/L"), UcumOutcome::Valid));
    }

    #[test]
    fn sanitizes_llm_input_to_whitelist() {
        let sanitized = sanitize_for_llm("10^9/L; DROP TABLE");
        assert!(!sanitized.contains(';'));
        assert!(sanitized.contains("10^9/L"));
    }

    #[test]
    fn conflict_issue_details_carries_existing_canonical() {
        let details = build_issue_details(Some("U/L"));
        assert_eq!(details["existing_canonical"], "U/L");
    }

    #[test]
    fn non_conflict_issue_details_is_empty() {
        assert_eq!(build_issue_details(None), serde_json::json!({}));
    }
}
