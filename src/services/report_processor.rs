//! Report ingestion pipeline (C7, spec §4.7): validate → extract → sanitize
//! → persist → fan out to C5/C6. Vision extraction and PDF handling are
//! behind a trait so the pipeline is testable without a live model, mirroring
//! the teacher's pattern of keeping external I/O behind a narrow trait seam
//! (its `StarRocksClient` trait plays the same role for cluster calls).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::db::Db;
use crate::models::{ExtractedParameter, ExtractedReport, Report};
use crate::services::analyte_mapper::AnalyteMapper;
use crate::services::unit_normalizer::UnitNormalizer;
use crate::utils::{ApiError, ApiResult};

const ALLOWED_MIME_TYPES: &[&str] =
    &["application/pdf", "image/png", "image/jpeg", "image/heic", "image/webp"];
const MAX_PDF_PAGES: usize = 10;

/// External collaborator interface: vision extraction and PDF→image
/// conversion are provided by whatever model/library backs the real
/// deployment; the processor only depends on this trait.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn page_count(&self, bytes: &[u8], mime_type: &str) -> ApiResult<usize>;
    async fn convert_pdf_to_images(&self, bytes: &[u8]) -> ApiResult<Vec<Vec<u8>>>;
    async fn extract(&self, images: &[Vec<u8>], mime_type: &str) -> ApiResult<ExtractedReport>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub report_id: Uuid,
    pub was_freshly_created: bool,
    pub lab_result_ids: Vec<Uuid>,
}

pub struct ReportProcessor {
    db: Db,
    vision: Arc<dyn VisionExtractor>,
    unit_normalizer: Arc<UnitNormalizer>,
    analyte_mapper: Arc<AnalyteMapper>,
}

impl ReportProcessor {
    pub fn new(
        db: Db,
        vision: Arc<dyn VisionExtractor>,
        unit_normalizer: Arc<UnitNormalizer>,
        analyte_mapper: Arc<AnalyteMapper>,
    ) -> Self {
        Self { db, vision, unit_normalizer, analyte_mapper }
    }

    pub async fn ingest(
        &self,
        patient_id: Uuid,
        source_filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> ApiResult<IngestOutcome> {
        if !ALLOWED_MIME_TYPES.contains(&mime_type) {
            return Err(ApiError::validation_error(format!("unsupported mime type: {mime_type}")));
        }

        if mime_type == "application/pdf" {
            let pages = self.vision.page_count(bytes, mime_type).await?;
            if pages > MAX_PDF_PAGES {
                return Err(ApiError::validation_error(format!("PDF exceeds {MAX_PDF_PAGES} page cap")));
            }
        }

        let images = if mime_type == "application/pdf" {
            self.vision.convert_pdf_to_images(bytes).await?
        } else {
            vec![bytes.to_vec()]
        };

        let extracted = self.vision.extract(&images, mime_type).await?;
        let sanitized = sanitize(extracted);

        let checksum = sha256_hex(bytes);

        let (report, lab_result_ids) =
            self.persist(patient_id, source_filename, mime_type, &checksum, &sanitized).await?;

        let summary = self.run_mapping(report.id, &lab_result_ids).await;
        tracing::debug!(report_id = %report.id, buckets = ?summary.buckets, "analyte mapping settled");

        Ok(IngestOutcome {
            report_id: report.id,
            was_freshly_created: report.was_freshly_created(),
            lab_result_ids,
        })
    }

    async fn persist(
        &self,
        patient_id: Uuid,
        source_filename: &str,
        mime_type: &str,
        checksum: &str,
        sanitized: &ExtractedReport,
    ) -> ApiResult<(Report, Vec<Uuid>)> {
        let mut tx: Transaction<'static, Postgres> = self.db.admin.begin().await?;

        let missing_data = serde_json::to_value(&sanitized.missing_data).unwrap_or_default();
        let patient_snapshot = serde_json::json!({
            "patient_name": sanitized.patient_name,
            "patient_age": sanitized.patient_age,
            "patient_dob": sanitized.patient_dob,
            "patient_gender": sanitized.patient_gender,
        });

        let report: Report = sqlx::query_as(
            r#"
            INSERT INTO patient_reports
                (id, patient_id, source_filename, mime_type, checksum, parser_version, status,
                 recognized_at, processed_at, test_date, patient_snapshot, missing_data)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, 'v1', 'processed', now(), now(), $5, $6, $7)
            ON CONFLICT (patient_id, checksum) DO UPDATE SET
                source_filename = EXCLUDED.source_filename,
                status = 'processed',
                processed_at = now(),
                test_date = EXCLUDED.test_date,
                patient_snapshot = EXCLUDED.patient_snapshot,
                missing_data = EXCLUDED.missing_data,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(patient_id)
        .bind(source_filename)
        .bind(mime_type)
        .bind(checksum)
        .bind(sanitized.test_date)
        .bind(patient_snapshot)
        .bind(missing_data)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM lab_results WHERE report_id = $1").bind(report.id).execute(&mut *tx).await?;

        let mut lab_result_ids = Vec::with_capacity(sanitized.parameters.len());
        for (position, param) in sanitized.parameters.iter().enumerate() {
            let id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO lab_results
                    (id, report_id, position, parameter_name, result_text, numeric_result, unit_raw,
                     reference_lower, reference_lower_operator, reference_upper, reference_upper_operator,
                     reference_text, is_out_of_range, specimen_type)
                VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING id
                "#,
            )
            .bind(report.id)
            .bind(position as i32)
            .bind(&param.parameter_name)
            .bind(&param.result)
            .bind(param.numeric_result)
            .bind(&param.unit)
            .bind(param.reference_interval.as_ref().and_then(|r| r.lower))
            .bind(param.reference_interval.as_ref().and_then(|r| r.lower_operator.clone()))
            .bind(param.reference_interval.as_ref().and_then(|r| r.upper))
            .bind(param.reference_interval.as_ref().and_then(|r| r.upper_operator.clone()))
            .bind(param.reference_interval.as_ref().and_then(|r| r.text.clone()))
            .bind(param.is_value_out_of_range)
            .bind(&param.specimen_type)
            .fetch_one(&mut *tx)
            .await?;
            lab_result_ids.push(id);
        }

        tx.commit().await?;
        Ok((report, lab_result_ids))
    }

    /// Mapping failures are non-fatal: the report is retained regardless
    /// (§4.7). Each row is handled independently so one bad row doesn't
    /// block the rest. Returns a per-bucket tally (§8 Testable Property #3).
    async fn run_mapping(
        &self,
        report_id: Uuid,
        lab_result_ids: &[Uuid],
    ) -> crate::services::analyte_mapper::MappingSummary {
        let Ok(rows) = sqlx::query_as::<_, (Uuid, String, Option<String>)>(
            "SELECT id, parameter_name, unit_raw FROM lab_results WHERE report_id = $1",
        )
        .bind(report_id)
        .fetch_all(&self.db.admin)
        .await
        else {
            return crate::services::analyte_mapper::MappingSummary::default();
        };

        let raw_units: Vec<(Uuid, String)> =
            rows.iter().filter_map(|(id, _, unit)| unit.clone().map(|u| (*id, u))).collect();
        let normalized_units = self.unit_normalizer.normalize_units_batch(&raw_units, None).await;

        for (id, canonical) in &normalized_units {
            let _ = sqlx::query("UPDATE lab_results SET unit_canonical = $1 WHERE id = $2")
                .bind(&canonical.canonical)
                .bind(id)
                .execute(&self.db.admin)
                .await;
        }

        let raw_labels: Vec<(Uuid, String, Option<String>, Option<String>)> =
            rows.iter().map(|(id, name, unit)| (*id, name.clone(), unit.clone(), None)).collect();

        let mut initial = std::collections::HashMap::new();
        for (id, name, ..) in &raw_labels {
            if let Ok(decision) = self.analyte_mapper.classify_row(&self.db.admin, name).await {
                initial.insert(*id, decision);
            }
        }

        let mut settled = Vec::new();
        for (id, decision) in &initial {
            use crate::services::analyte_mapper::{Bucket, InitialDecision, RowOutcome};
            let outcome = match decision {
                InitialDecision::MatchExact { analyte_id } => Some(RowOutcome {
                    result_id: *id,
                    bucket: Bucket::MatchExact,
                    analyte_id: Some(*analyte_id),
                    code: None,
                    confidence: Some(1.0),
                    candidates: Vec::new(),
                    llm_alternative: None,
                    comment: None,
                }),
                InitialDecision::MatchFuzzy { candidate } => Some(RowOutcome {
                    result_id: *id,
                    bucket: Bucket::MatchFuzzy,
                    analyte_id: Some(candidate.analyte_id),
                    code: Some(candidate.code.clone()),
                    confidence: Some(candidate.similarity),
                    candidates: vec![candidate.clone()],
                    llm_alternative: None,
                    comment: None,
                }),
                _ => None,
            };
            if let Some(outcome) = outcome {
                let _ = self.analyte_mapper.apply_outcome(&outcome, false).await;
                settled.push(outcome);
            }
        }

        let context: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT coalesce(a.category, a.canonical_name)
            FROM lab_results lr
            JOIN analytes a ON a.id = lr.analyte_id
            WHERE lr.report_id = $1 AND lr.analyte_id IS NOT NULL
            "#,
        )
        .bind(report_id)
        .fetch_all(&self.db.admin)
        .await
        .unwrap_or_default();

        let approved: Vec<String> = sqlx::query_scalar(
            "SELECT code || ' | ' || canonical_name || ' | ' || coalesce(canonical_unit, '') \
             || ' | ' || coalesce(category, '') FROM analytes",
        )
        .fetch_all(&self.db.admin)
        .await
        .unwrap_or_default();
        let pending: Vec<String> = sqlx::query_scalar(
            "SELECT proposed_code || ' | ' || proposed_name || ' | ' || coalesce(unit, '') \
             || ' | ' || coalesce(category, '') FROM pending_analytes WHERE status = 'pending'",
        )
        .fetch_all(&self.db.admin)
        .await
        .unwrap_or_default();

        let outcomes = self.analyte_mapper.adjudicate_batch(&raw_labels, &initial, &context, &approved, &pending).await;
        for outcome in &outcomes {
            let _ = self.analyte_mapper.apply_outcome(outcome, false).await;
        }
        settled.extend(outcomes);

        let unaccounted = raw_labels.len().saturating_sub(settled.len());
        let _ = lab_result_ids;
        crate::services::analyte_mapper::MappingSummary::tally(&settled, unaccounted)
    }
}

/// §4.7 sanitization: normalizes units/operators/reference/specimen forms
/// coming out of the permissive vision-model JSON before anything is
/// persisted (§9: never pipe the raw form through the system).
fn sanitize(extracted: ExtractedReport) -> ExtractedReport {
    ExtractedReport {
        patient_name: extracted.patient_name.map(|s| s.trim().to_string()),
        patient_age: extracted.patient_age,
        patient_dob: extracted.patient_dob,
        patient_gender: extracted.patient_gender.map(|g| g.trim().to_lowercase()),
        test_date: extracted.test_date,
        parameters: extracted.parameters.into_iter().map(sanitize_parameter).collect(),
        missing_data: extracted.missing_data,
    }
}

fn sanitize_parameter(mut param: ExtractedParameter) -> ExtractedParameter {
    param.parameter_name = param.parameter_name.trim().to_string();
    param.unit = param.unit.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    if let Some(reference) = param.reference_interval.as_mut() {
        reference.lower_operator = reference.lower_operator.as_ref().map(|op| normalize_operator(op));
        reference.upper_operator = reference.upper_operator.as_ref().map(|op| normalize_operator(op));
    }
    param.specimen_type = param.specimen_type.map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty());
    param
}

fn normalize_operator(op: &str) -> String {
    match op.trim() {
        "<=" | "≤" => "<=".to_string(),
        ">=" | "≥" => ">=".to_string(),
        "<" => "<".to_string(),
        ">" => ">".to_string(),
        other => other.to_string(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_comparator_variants() {
        assert_eq!(normalize_operator("≤"), "<=");
        assert_eq!(normalize_operator("≥"), ">=");
    }

    #[test]
    fn sanitizes_specimen_case() {
        let param = ExtractedParameter {
            parameter_name: "  HDL ".to_string(),
            result: "45".to_string(),
            unit: Some(" mg/dL ".to_string()),
            reference_interval: None,
            is_value_out_of_range: None,
            numeric_result: Some(45.0),
            specimen_type: Some("  SERUM ".to_string()),
        };
        let sanitized = sanitize_parameter(param);
        assert_eq!(sanitized.parameter_name, "HDL");
        assert_eq!(sanitized.specimen_type, Some("serum".to_string()));
    }
}
