//! Per-row tiered analyte resolution (C6, spec §4.6): exact alias lookup,
//! `pg_trgm` fuzzy scoring, LLM batch adjudication, then a write/queue
//! policy. Grounded on `db.rs`'s RLS-scoped transaction helper and
//! `services::llm::LlmClient`'s JSON-mode transport.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::config::MappingConfig;
use crate::db::Db;
use crate::services::llm::{LlmClient, LlmEndpoint};
use crate::utils::ApiResult;

const SYSTEM_PROMPT: &str = "You map laboratory test names to a canonical analyte catalog. \
Respond only with the requested JSON array, one entry per row, in the same order.";

/// §4.6: lowercase; preserve Cyrillic codepoints; strip Latin diacritics
/// (NFKD + combining marks) only when no Cyrillic is present; unify
/// `μ→micro`; collapse non-letter/non-digit runs to single spaces.
pub fn normalize_label(label: &str) -> String {
    let unified: String = label
        .chars()
        .flat_map(|c| if c == 'μ' || c == 'µ' { "micro".chars().collect::<Vec<_>>() } else { vec![c] })
        .collect();

    let has_cyrillic = unified.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c));

    let folded: String = if has_cyrillic {
        unified
    } else {
        unified
            .nfd()
            .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
            .collect()
    };

    let lowered = folded.to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut last_was_sep = false;
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push(' ');
            last_was_sep = true;
        }
    }
    out.trim().to_string()
}

#[derive(Debug, Clone)]
pub struct FuzzyCandidate {
    pub analyte_id: Uuid,
    pub code: String,
    pub name: String,
    pub similarity: f64,
}

#[derive(Debug, Clone)]
pub enum InitialDecision {
    MatchExact { analyte_id: Uuid },
    MatchFuzzy { candidate: FuzzyCandidate },
    AmbiguousFuzzy { candidates: Vec<FuzzyCandidate> },
    NeedsLlmReview { candidate: FuzzyCandidate },
    Unmapped { low_confidence_suggestions: Vec<FuzzyCandidate> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    MatchExact,
    MatchFuzzy,
    MatchFuzzyConfirmed,
    MatchLlm,
    ConflictFuzzyLlm,
    NewLlm,
    AbstainLlm,
    Unmapped,
}

#[derive(Debug)]
pub struct RowOutcome {
    pub result_id: Uuid,
    pub bucket: Bucket,
    pub analyte_id: Option<Uuid>,
    pub code: Option<String>,
    pub confidence: Option<f64>,
    pub candidates: Vec<FuzzyCandidate>,
    pub llm_alternative: Option<LlmRowResponse>,
    pub comment: Option<String>,
}

#[derive(Debug, Default)]
pub struct MappingSummary {
    pub buckets: HashMap<String, usize>,
}

impl MappingSummary {
    pub fn record(&mut self, bucket: Bucket) {
        *self.buckets.entry(bucket_label(bucket).to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.buckets.values().sum()
    }

    /// Tallies a batch of row outcomes. `unaccounted_rows` covers input rows
    /// that never produced an outcome (e.g. classification failed outright)
    /// so the bucket total always equals the input row count (§8 Testable
    /// Property #3).
    pub fn tally(outcomes: &[RowOutcome], unaccounted_rows: usize) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.record(outcome.bucket);
        }
        if unaccounted_rows > 0 {
            *summary.buckets.entry(bucket_label(Bucket::Unmapped).to_string()).or_insert(0) += unaccounted_rows;
        }
        summary
    }
}

fn bucket_label(bucket: Bucket) -> &'static str {
    match bucket {
        Bucket::MatchExact => "match_exact",
        Bucket::MatchFuzzy => "match_fuzzy",
        Bucket::MatchFuzzyConfirmed => "match_fuzzy_confirmed",
        Bucket::MatchLlm => "match_llm",
        Bucket::ConflictFuzzyLlm => "conflict_fuzzy_llm",
        Bucket::NewLlm => "new_llm",
        Bucket::AbstainLlm => "abstain_llm",
        Bucket::Unmapped => "unmapped",
    }
}

#[derive(Debug, Serialize)]
struct LlmRowRequest {
    result_id: Uuid,
    raw_label: String,
    unit: Option<String>,
    reference_hint: Option<String>,
    provisional_code: Option<String>,
    candidates: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LlmMappingRequest {
    approved_analytes: Vec<String>,
    pending_analytes: Vec<String>,
    report_context: Vec<String>,
    rows: Vec<LlmRowRequest>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LlmDecision {
    Match,
    New,
    Abstain,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmRowResponse {
    pub result_id: Uuid,
    pub decision: LlmDecision,
    pub code: Option<String>,
    pub name: Option<String>,
    pub confidence: f64,
    pub comment: String,
}

#[derive(Debug, Deserialize)]
struct LlmMappingResponse {
    rows: Vec<LlmRowResponse>,
}

pub struct AnalyteMapper {
    db: Db,
    llm: Arc<LlmClient>,
    endpoint: LlmEndpoint,
    config: MappingConfig,
}

impl AnalyteMapper {
    pub fn new(db: Db, llm: Arc<LlmClient>, endpoint: LlmEndpoint, config: MappingConfig) -> Self {
        Self { db, llm, endpoint, config }
    }

    /// Tier A + B for a single row, run against the `app` pool so callers
    /// can compose it inside an RLS-scoped transaction if desired; read-only,
    /// so a bare pool reference is enough here.
    pub async fn classify_row(&self, pool: &PgPool, raw_label: &str) -> ApiResult<InitialDecision> {
        let normalized = normalize_label(raw_label);
        if normalized.is_empty() {
            return Ok(InitialDecision::Unmapped { low_confidence_suggestions: Vec::new() });
        }

        if let Some(analyte_id) = sqlx::query_scalar::<_, Uuid>(
            "SELECT analyte_id FROM analyte_aliases WHERE lower(alias) = $1 LIMIT 1",
        )
        .bind(&normalized)
        .fetch_optional(pool)
        .await?
        {
            return Ok(InitialDecision::MatchExact { analyte_id });
        }

        let rows: Vec<(Uuid, String, String, f64)> = sqlx::query_as(
            r#"
            SELECT a.id, a.code, a.canonical_name, similarity(aa.alias, $1) AS sim
            FROM analyte_aliases aa
            JOIN analytes a ON a.id = aa.analyte_id
            WHERE aa.alias % $1
            ORDER BY sim DESC
            LIMIT 5
            "#,
        )
        .bind(&normalized)
        .fetch_all(pool)
        .await?;

        let mut by_analyte: HashMap<Uuid, FuzzyCandidate> = HashMap::new();
        for (analyte_id, code, name, sim) in rows {
            by_analyte
                .entry(analyte_id)
                .and_modify(|existing| {
                    if sim > existing.similarity {
                        existing.similarity = sim;
                    }
                })
                .or_insert(FuzzyCandidate { analyte_id, code, name, similarity: sim });
        }

        let mut candidates: Vec<FuzzyCandidate> = by_analyte.into_values().collect();
        candidates.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(2);

        let t_fuzzy = self.config.backfill_similarity_threshold;
        let t_auto = self.config.auto_accept;
        let t_queue = self.config.queue_lower;
        let delta = self.config.ambiguity_delta;

        let top = candidates.first().cloned();
        let second = candidates.get(1).cloned();

        match (top, second) {
            (Some(top), Some(second)) if top.similarity >= t_auto && (top.similarity - second.similarity) > delta => {
                Ok(InitialDecision::MatchFuzzy { candidate: top })
            },
            (Some(top), None) if top.similarity >= t_auto => Ok(InitialDecision::MatchFuzzy { candidate: top }),
            (Some(top), Some(second)) if (top.similarity - second.similarity).abs() <= delta && top.similarity >= t_fuzzy => {
                Ok(InitialDecision::AmbiguousFuzzy { candidates: vec![top, second] })
            },
            (Some(top), _) if top.similarity >= t_queue && top.similarity < t_auto => {
                Ok(InitialDecision::NeedsLlmReview { candidate: top })
            },
            (Some(top), _) if top.similarity > 0.0 && top.similarity < t_queue => {
                Ok(InitialDecision::Unmapped { low_confidence_suggestions: candidates })
            },
            _ => Ok(InitialDecision::Unmapped { low_confidence_suggestions: Vec::new() }),
        }
    }

    /// Tier C: batch all rows needing LLM adjudication in one prompt, then
    /// apply the merge-rule table (§4.6) per row.
    pub async fn adjudicate_batch(
        &self,
        raw_labels: &[(Uuid, String, Option<String>, Option<String>)],
        initial: &HashMap<Uuid, InitialDecision>,
        report_context: &[String],
        approved_analytes: &[String],
        pending_analytes: &[String],
    ) -> Vec<RowOutcome> {
        let needs_llm: Vec<&(Uuid, String, Option<String>, Option<String>)> = raw_labels
            .iter()
            .filter(|(result_id, ..)| {
                matches!(
                    initial.get(result_id),
                    Some(InitialDecision::Unmapped { .. })
                        | Some(InitialDecision::AmbiguousFuzzy { .. })
                        | Some(InitialDecision::NeedsLlmReview { .. })
                )
            })
            .collect();

        if needs_llm.is_empty() {
            return Vec::new();
        }

        let rows: Vec<LlmRowRequest> = needs_llm
            .iter()
            .map(|(result_id, label, unit, reference_hint)| {
                let decision = initial.get(result_id);
                let (provisional_code, candidates) = match decision {
                    Some(InitialDecision::NeedsLlmReview { candidate }) => {
                        (Some(candidate.code.clone()), vec![format!("{} ({})", candidate.code, candidate.similarity)])
                    },
                    Some(InitialDecision::AmbiguousFuzzy { candidates }) => {
                        (None, candidates.iter().map(|c| format!("{} ({})", c.code, c.similarity)).collect())
                    },
                    Some(InitialDecision::Unmapped { low_confidence_suggestions }) => (
                        None,
                        low_confidence_suggestions.iter().map(|c| format!("{} ({})", c.code, c.similarity)).collect(),
                    ),
                    _ => (None, Vec::new()),
                };
                LlmRowRequest {
                    result_id: *result_id,
                    raw_label: label.clone(),
                    unit: unit.clone(),
                    reference_hint: reference_hint.clone(),
                    provisional_code,
                    candidates,
                }
            })
            .collect();

        let request = LlmMappingRequest {
            approved_analytes: approved_analytes.to_vec(),
            pending_analytes: pending_analytes.to_vec(),
            report_context: report_context.to_vec(),
            rows,
        };

        let llm_responses: HashMap<Uuid, LlmRowResponse> = match self
            .llm
            .complete_json::<_, LlmMappingResponse>(&self.endpoint, SYSTEM_PROMPT, &request)
            .await
        {
            Ok(response) => response.rows.into_iter().map(|r| (r.result_id, r)).collect(),
            Err(_) => HashMap::new(),
        };

        needs_llm
            .iter()
            .map(|(result_id, ..)| {
                let decision = initial.get(result_id);
                let llm = llm_responses.get(result_id).cloned();
                merge_decision(*result_id, decision, llm, self.config.auto_accept)
            })
            .collect()
    }

    /// Write/queue policy (§4.6). `dry_run = true` computes the outcome
    /// without mutating storage, used for invariant testing.
    pub async fn apply_outcome(&self, outcome: &RowOutcome, dry_run: bool) -> ApiResult<()> {
        if dry_run {
            return Ok(());
        }

        let mut tx: Transaction<'static, Postgres> = self.db.admin.begin().await?;

        match outcome.bucket {
            Bucket::MatchExact => {
                write_mapping(&mut tx, outcome.result_id, outcome.analyte_id, 1.0, "auto_exact").await?;
            },
            Bucket::MatchFuzzy => {
                let confidence = outcome.confidence.unwrap_or(0.0);
                write_mapping(&mut tx, outcome.result_id, outcome.analyte_id, confidence, "auto_fuzzy").await?;
            },
            Bucket::MatchFuzzyConfirmed => {
                let confidence = outcome.confidence.unwrap_or(0.0);
                write_mapping(&mut tx, outcome.result_id, outcome.analyte_id, confidence, "auto_fuzzy_llm_confirmed")
                    .await?;
            },
            Bucket::MatchLlm => {
                let confidence = outcome.confidence.unwrap_or(0.0);
                if let Some(code) = &outcome.code {
                    let approved: Option<Uuid> =
                        sqlx::query_scalar("SELECT id FROM analytes WHERE code = $1").bind(code).fetch_optional(&mut *tx).await?;
                    if let Some(analyte_id) = approved {
                        write_mapping(&mut tx, outcome.result_id, Some(analyte_id), confidence, "auto_llm").await?;
                        if !outcome.candidates.is_empty() {
                            if let Some(alias) = sqlx::query_scalar::<_, String>(
                                "SELECT parameter_name FROM lab_results WHERE id = $1",
                            )
                            .bind(outcome.result_id)
                            .fetch_optional(&mut *tx)
                            .await?
                            {
                                let normalized = normalize_label(&alias);
                                sqlx::query(
                                    "INSERT INTO analyte_aliases \
                                     (id, analyte_id, alias, display_text, confidence, source) \
                                     VALUES (gen_random_uuid(), $1, $2, $3, $4, 'llm_semantic_match') \
                                     ON CONFLICT (analyte_id, alias) DO NOTHING",
                                )
                                .bind(analyte_id)
                                .bind(&normalized)
                                .bind(&alias)
                                .bind(confidence)
                                .execute(&mut *tx)
                                .await?;
                            }
                        }
                    } else {
                        let pending_exists: Option<Uuid> =
                            sqlx::query_scalar("SELECT id FROM pending_analytes WHERE proposed_code = $1")
                                .bind(code)
                                .fetch_optional(&mut *tx)
                                .await?;
                        if pending_exists.is_some() {
                            queue_match_review(&mut tx, outcome.result_id, outcome, "pending_analyte").await?;
                        }
                    }
                }
            },
            Bucket::ConflictFuzzyLlm => {
                queue_match_review(&mut tx, outcome.result_id, outcome, "conflict_fuzzy_llm").await?;
            },
            Bucket::AbstainLlm => {
                let comment = outcome.comment.clone();
                sqlx::query(
                    "INSERT INTO match_reviews (id, result_id, candidates, status, source, comment) \
                     VALUES (gen_random_uuid(), $1, '[]'::jsonb, 'pending', 'abstain', $2) \
                     ON CONFLICT (result_id) DO NOTHING",
                )
                .bind(outcome.result_id)
                .bind(comment)
                .execute(&mut *tx)
                .await?;
            },
            Bucket::NewLlm => {
                if let Some(code) = &outcome.code {
                    let already_approved: Option<Uuid> =
                        sqlx::query_scalar("SELECT id FROM analytes WHERE code = $1").bind(code).fetch_optional(&mut *tx).await?;
                    if already_approved.is_none() {
                        let alias: Option<String> =
                            sqlx::query_scalar("SELECT parameter_name FROM lab_results WHERE id = $1")
                                .bind(outcome.result_id)
                                .fetch_optional(&mut *tx)
                                .await?;
                        let name = outcome.comment.clone().unwrap_or_else(|| code.clone());
                        sqlx::query(
                            r#"
                            INSERT INTO pending_analytes
                                (id, proposed_code, proposed_name, confidence, evidence, parameter_variations, status)
                            VALUES (gen_random_uuid(), $1, $2, $3, jsonb_build_array($4::text), ARRAY[$4]::text[], 'pending')
                            ON CONFLICT (proposed_code) DO UPDATE SET
                                evidence = pending_analytes.evidence || jsonb_build_array($4::text),
                                parameter_variations = array_append(
                                    array_remove(pending_analytes.parameter_variations, $4),
                                    $4
                                ),
                                updated_at = now()
                            "#,
                        )
                        .bind(code)
                        .bind(&name)
                        .bind(outcome.confidence.unwrap_or(0.0))
                        .bind(alias.unwrap_or_default())
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            },
            Bucket::Unmapped => {},
        }

        tx.commit().await?;
        Ok(())
    }

    /// Admin-triggered approve flow (§4.6 approve flow). Transactional.
    pub async fn approve_pending_analyte(
        &self,
        proposed_code: &str,
        canonical_name: Option<String>,
        canonical_unit: Option<String>,
        category: Option<String>,
    ) -> ApiResult<(Uuid, i64, i64, i64)> {
        let mut tx: Transaction<'static, Postgres> = self.db.admin.begin().await?;

        let pending: (Uuid, String, Vec<String>, Option<String>) = sqlx::query_as(
            "SELECT id, proposed_name, parameter_variations, unit FROM pending_analytes WHERE proposed_code = $1",
        )
        .bind(proposed_code)
        .fetch_one(&mut *tx)
        .await?;

        let analyte_id: Uuid = sqlx::query_scalar(
            "INSERT INTO analytes (id, code, canonical_name, canonical_unit, category) \
             VALUES (gen_random_uuid(), $1, $2, $3, $4) RETURNING id",
        )
        .bind(proposed_code)
        .bind(canonical_name.unwrap_or(pending.1))
        .bind(canonical_unit.unwrap_or_else(|| pending.3.unwrap_or_default()))
        .bind(category)
        .fetch_one(&mut *tx)
        .await?;

        let mut aliases_inserted = 0i64;
        for variation in &pending.2 {
            let normalized = normalize_label(variation);
            let result = sqlx::query(
                "INSERT INTO analyte_aliases (id, analyte_id, alias, display_text, confidence, source) \
                 VALUES (gen_random_uuid(), $1, $2, $3, 1.0, 'approved_from_pending') \
                 ON CONFLICT (analyte_id, alias) DO NOTHING",
            )
            .bind(analyte_id)
            .bind(&normalized)
            .bind(variation)
            .execute(&mut *tx)
            .await?;
            aliases_inserted += result.rows_affected() as i64;
        }

        sqlx::query("UPDATE pending_analytes SET status = 'approved', updated_at = now() WHERE id = $1")
            .bind(pending.0)
            .execute(&mut *tx)
            .await?;

        let backfilled = sqlx::query(
            r#"
            UPDATE lab_results
            SET analyte_id = $1, mapping_source = 'manual_approved', mapping_confidence = 1.0, mapped_at = now()
            WHERE analyte_id IS NULL
              AND EXISTS (
                  SELECT 1 FROM analyte_aliases aa
                  WHERE aa.analyte_id = $1 AND similarity(aa.alias, lower(parameter_name)) >= $2
              )
            "#,
        )
        .bind(analyte_id)
        .bind(self.config.backfill_similarity_threshold)
        .execute(&mut *tx)
        .await;

        let backfilled_count = backfilled.map(|r| r.rows_affected() as i64).unwrap_or(0);

        let linked = sqlx::query(
            r#"
            UPDATE lab_results lr
            SET analyte_id = $1, mapping_source = 'manual_approved', mapping_confidence = 1.0, mapped_at = now()
            FROM match_reviews mr
            WHERE mr.result_id = lr.id AND mr.status = 'pending' AND lr.analyte_id IS NULL
              AND mr.candidates::text ILIKE '%' || $2 || '%'
            "#,
        )
        .bind(analyte_id)
        .bind(proposed_code)
        .execute(&mut *tx)
        .await;

        let linked_count = linked.map(|r| r.rows_affected() as i64).unwrap_or(0);

        sqlx::query(
            "UPDATE match_reviews SET status = 'resolved', resolved_at = now() \
             WHERE status = 'pending' AND candidates::text ILIKE '%' || $1 || '%'",
        )
        .bind(proposed_code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((analyte_id, aliases_inserted, backfilled_count, linked_count))
    }
}

async fn write_mapping(
    tx: &mut Transaction<'static, Postgres>,
    result_id: Uuid,
    analyte_id: Option<Uuid>,
    confidence: f64,
    source: &str,
) -> ApiResult<()> {
    sqlx::query(
        "UPDATE lab_results SET analyte_id = $1, mapping_confidence = $2, mapping_source = $3, mapped_at = now() \
         WHERE id = $4",
    )
    .bind(analyte_id)
    .bind(confidence)
    .bind(source)
    .bind(result_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn queue_match_review(
    tx: &mut Transaction<'static, Postgres>,
    result_id: Uuid,
    outcome: &RowOutcome,
    source: &str,
) -> ApiResult<()> {
    let candidates = serde_json::to_value(&outcome.candidates.iter().map(|c| {
        serde_json::json!({ "code": c.code, "name": c.name, "confidence": c.similarity })
    }).collect::<Vec<_>>()).unwrap_or(serde_json::Value::Null);

    sqlx::query(
        "INSERT INTO match_reviews (id, result_id, candidates, status, source, comment) \
         VALUES (gen_random_uuid(), $1, $2, 'pending', $3, $4) \
         ON CONFLICT (result_id) DO UPDATE SET candidates = $2, source = $3, comment = $4",
    )
    .bind(result_id)
    .bind(candidates)
    .bind(source)
    .bind(outcome.comment.clone())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Merge-rule table (§4.6). `initial` is `None` only for rows the exact tier
/// already handled, which never reach this function.
fn merge_decision(
    result_id: Uuid,
    initial: Option<&InitialDecision>,
    llm: Option<LlmRowResponse>,
    t_auto: f64,
) -> RowOutcome {
    let candidates = match initial {
        Some(InitialDecision::AmbiguousFuzzy { candidates }) => candidates.clone(),
        Some(InitialDecision::NeedsLlmReview { candidate }) => vec![candidate.clone()],
        Some(InitialDecision::Unmapped { low_confidence_suggestions }) => low_confidence_suggestions.clone(),
        _ => Vec::new(),
    };

    let provisional = match initial {
        Some(InitialDecision::NeedsLlmReview { candidate }) => Some(candidate.clone()),
        Some(InitialDecision::AmbiguousFuzzy { candidates }) => candidates.first().cloned(),
        _ => None,
    };
    let is_provisional = provisional.is_some();

    let Some(llm) = llm else {
        return match provisional {
            Some(candidate) => RowOutcome {
                result_id,
                bucket: Bucket::MatchFuzzy,
                analyte_id: Some(candidate.analyte_id),
                code: Some(candidate.code),
                confidence: Some(candidate.similarity),
                candidates,
                llm_alternative: None,
                comment: Some("llm adjudication unavailable, fell back to fuzzy candidate".to_string()),
            },
            None => RowOutcome {
                result_id,
                bucket: Bucket::AbstainLlm,
                analyte_id: None,
                code: None,
                confidence: None,
                candidates,
                llm_alternative: None,
                comment: Some("llm adjudication unavailable".to_string()),
            },
        };
    };

    match &llm.decision {
        LlmDecision::Match => {
            let fuzzy_conf = provisional.as_ref().map(|c| c.similarity).unwrap_or(0.0);
            let fuzzy_code = provisional.as_ref().map(|c| c.code.clone());

            let confirms_existing = fuzzy_code.as_deref() == llm.code.as_deref();

            if confirms_existing && provisional.is_some() {
                let candidate = provisional.unwrap();
                RowOutcome {
                    result_id,
                    bucket: Bucket::MatchFuzzyConfirmed,
                    analyte_id: Some(candidate.analyte_id),
                    code: Some(candidate.code),
                    confidence: Some(llm.confidence.max(fuzzy_conf).max(t_auto)),
                    candidates,
                    llm_alternative: None,
                    comment: Some(llm.comment.clone()),
                }
            } else if llm.confidence > fuzzy_conf {
                RowOutcome {
                    result_id,
                    bucket: Bucket::MatchLlm,
                    analyte_id: None,
                    code: llm.code.clone(),
                    confidence: Some(llm.confidence),
                    candidates,
                    llm_alternative: None,
                    comment: Some(llm.comment.clone()),
                }
            } else if is_provisional {
                let candidate = provisional.unwrap();
                RowOutcome {
                    result_id,
                    bucket: Bucket::ConflictFuzzyLlm,
                    analyte_id: Some(candidate.analyte_id),
                    code: Some(candidate.code),
                    confidence: Some(candidate.similarity),
                    candidates,
                    llm_alternative: Some(llm.clone()),
                    comment: Some(llm.comment.clone()),
                }
            } else {
                RowOutcome {
                    result_id,
                    bucket: Bucket::MatchLlm,
                    analyte_id: None,
                    code: llm.code.clone(),
                    confidence: Some(llm.confidence),
                    candidates,
                    llm_alternative: None,
                    comment: Some(llm.comment.clone()),
                }
            }
        },
        LlmDecision::New => RowOutcome {
            result_id,
            bucket: Bucket::NewLlm,
            analyte_id: None,
            code: llm.code.clone(),
            confidence: Some(llm.confidence),
            candidates,
            llm_alternative: None,
            comment: llm.name.clone().or(Some(llm.comment.clone())),
        },
        LlmDecision::Abstain => {
            if let Some(candidate) = provisional {
                RowOutcome {
                    result_id,
                    bucket: Bucket::MatchFuzzy,
                    analyte_id: Some(candidate.analyte_id),
                    code: Some(candidate.code),
                    confidence: Some(candidate.similarity),
                    candidates,
                    llm_alternative: None,
                    comment: Some(llm.comment.clone()),
                }
            } else {
                RowOutcome {
                    result_id,
                    bucket: Bucket::AbstainLlm,
                    analyte_id: None,
                    code: None,
                    confidence: None,
                    candidates,
                    llm_alternative: None,
                    comment: Some(llm.comment.clone()),
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_latin_diacritics() {
        assert_eq!(normalize_label("Glücose, Free"), "glucose free");
    }

    #[test]
    fn preserves_cyrillic() {
        assert_eq!(normalize_label("ЛПВП холестерин"), "лпвп холестерин");
    }

    #[test]
    fn unifies_micro_prefix() {
        assert!(normalize_label("μ-globulin").starts_with("micro"));
    }

    #[test]
    fn unifies_micro_mid_string() {
        assert_eq!(normalize_label("Alpha μ-globulin"), "alpha micro globulin");
    }

    #[test]
    fn merge_rule_confirms_provisional_match() {
        let candidate = FuzzyCandidate {
            analyte_id: Uuid::nil(),
            code: "HDL".to_string(),
            name: "HDL Cholesterol".to_string(),
            similarity: 0.75,
        };
        let initial = InitialDecision::NeedsLlmReview { candidate: candidate.clone() };
        let llm = LlmRowResponse {
            result_id: Uuid::nil(),
            decision: LlmDecision::Match,
            code: Some("HDL".to_string()),
            name: Some("HDL Cholesterol".to_string()),
            confidence: 0.9,
            comment: "confirmed".to_string(),
        };
        let outcome = merge_decision(Uuid::nil(), Some(&initial), Some(llm), 0.80);
        assert_eq!(outcome.bucket, Bucket::MatchFuzzyConfirmed);
        assert_eq!(outcome.confidence, Some(0.9));
    }

    #[test]
    fn merge_rule_keeps_fuzzy_on_low_confidence_conflict() {
        let candidate = FuzzyCandidate {
            analyte_id: Uuid::nil(),
            code: "HDL".to_string(),
            name: "HDL Cholesterol".to_string(),
            similarity: 0.75,
        };
        let initial = InitialDecision::NeedsLlmReview { candidate: candidate.clone() };
        let llm = LlmRowResponse {
            result_id: Uuid::nil(),
            decision: LlmDecision::Match,
            code: Some("LDL".to_string()),
            name: Some("LDL Cholesterol".to_string()),
            confidence: 0.5,
            comment: "uncertain".to_string(),
        };
        let outcome = merge_decision(Uuid::nil(), Some(&initial), Some(llm), 0.80);
        assert_eq!(outcome.bucket, Bucket::ConflictFuzzyLlm);
        assert_eq!(outcome.code, Some("HDL".to_string()));
    }

    fn bare_outcome(bucket: Bucket) -> RowOutcome {
        RowOutcome {
            result_id: Uuid::nil(),
            bucket,
            analyte_id: None,
            code: None,
            confidence: None,
            candidates: Vec::new(),
            llm_alternative: None,
            comment: None,
        }
    }

    #[test]
    fn mapping_summary_total_matches_input_row_count() {
        let input_row_count = 5;
        let outcomes = vec![
            bare_outcome(Bucket::MatchExact),
            bare_outcome(Bucket::MatchFuzzy),
            bare_outcome(Bucket::NewLlm),
        ];
        let unaccounted = input_row_count - outcomes.len();
        let summary = MappingSummary::tally(&outcomes, unaccounted);
        assert_eq!(summary.total(), input_row_count);
        assert_eq!(summary.buckets.get("unmapped"), Some(&unaccounted));
    }
}
