//! Bounded agentic SQL loop (C8, spec §4.8). Grounded on `services::llm`'s
//! tool-calling transport and `services::sql_validator` for the terminal
//! validation gate.

pub mod tools;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

use crate::config::AgenticConfig;
use crate::db::Db;
use crate::services::llm::{ChatMessage, LlmClient, LlmEndpoint, ResponseMessage};
use crate::services::schema_snapshot::SchemaCache;
use crate::services::sql_validator::{LimitCeilings, SqlValidator};
use crate::utils::ApiResult;

use tools::{FinalQuery, parse_query_type};

/// Domain vocabulary → table name, feeding the alias-hit ranking signal in
/// `SchemaCache::build_schema_section` (§4.4).
const DOMAIN_ALIAS_MAP: &[(&str, &str)] = &[
    ("result", "lab_results"),
    ("results", "lab_results"),
    ("test", "lab_results"),
    ("tests", "lab_results"),
    ("report", "patient_reports"),
    ("reports", "patient_reports"),
    ("patient", "patients"),
    ("patients", "patients"),
    ("analyte", "analytes"),
    ("analytes", "analytes"),
    ("unit", "unit_aliases"),
    ("units", "unit_aliases"),
    ("review", "match_reviews"),
    ("reviews", "match_reviews"),
    ("pending", "pending_analytes"),
    ("gmail", "gmail_report_provenance"),
    ("email", "gmail_report_provenance"),
];

#[derive(Debug, Clone, serde::Serialize)]
pub enum LoopOutcome {
    Accepted(FinalQuery),
    ValidationFailed(Vec<String>),
    NoFinalQuery,
    Timeout,
    Error(String),
}

pub struct AgenticSession {
    db: Db,
    llm: Arc<LlmClient>,
    endpoint: LlmEndpoint,
    schema_cache: Arc<SchemaCache>,
    config: AgenticConfig,
}

impl AgenticSession {
    pub fn new(
        db: Db,
        llm: Arc<LlmClient>,
        endpoint: LlmEndpoint,
        schema_cache: Arc<SchemaCache>,
        config: AgenticConfig,
    ) -> Self {
        Self { db, llm, endpoint, schema_cache, config }
    }

    pub async fn ask(
        &self,
        question: &str,
        user_id: Uuid,
        selected_patient_id: Option<Uuid>,
        multiple_patients: bool,
    ) -> ApiResult<(LoopOutcome, Vec<ChatMessage>, u32)> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let ceilings = LimitCeilings {
            explore: self.config.explore_limit,
            table: self.config.table_limit,
            plot: self.config.plot_limit,
            default: self.config.default_limit,
        };
        let validator = SqlValidator::new(&self.db.app, ceilings);

        let schema_section = self.schema_cache.build_schema_section(question, DOMAIN_ALIAS_MAP);
        let system_prompt = build_system_prompt(&schema_section, selected_patient_id);

        let mut transcript = vec![ChatMessage::system(&system_prompt), ChatMessage::user(question)];

        let mut iteration: u32 = 0;
        let mut validation_retry_used = false;

        loop {
            if started.elapsed() > timeout {
                return Ok((LoopOutcome::Timeout, transcript, iteration));
            }
            if iteration >= self.config.max_iterations {
                return Ok((
                    self.forced_completion(&mut transcript).await,
                    transcript,
                    iteration,
                ));
            }
            iteration += 1;

            let tool_specs = tools::tool_specs();
            let response = self.llm.complete_with_tools(&self.endpoint, transcript.clone(), tool_specs, None).await;
            let response = match response {
                Ok(r) => r,
                Err(e) => return Ok((LoopOutcome::Error(e.to_string()), transcript, iteration)),
            };

            transcript.push(ChatMessage::assistant(response.clone()));

            let Some(tool_calls) = response.tool_calls.clone() else {
                transcript.push(ChatMessage::user(
                    "Please call a tool: explore further or call generate_final_query when ready.",
                ));
                continue;
            };

            let mut saw_final = None;
            for call in tool_calls {
                let result = self
                    .dispatch_tool(&call, &validator, selected_patient_id, multiple_patients)
                    .await;
                match result {
                    ToolDispatch::Final(final_query) => saw_final = Some(final_query),
                    ToolDispatch::Output(output) => {
                        transcript.push(ChatMessage::tool_result(&call.id, &output));
                    },
                }
            }

            if let Some(final_query) = saw_final {
                match self.validate_final(&final_query, &validator, selected_patient_id, multiple_patients).await {
                    Ok(()) => {
                        self.touch_mru_for_sql(&final_query.sql);
                        return Ok((LoopOutcome::Accepted(final_query), transcript, iteration));
                    },
                    Err(violations) if !validation_retry_used => {
                        validation_retry_used = true;
                        transcript.push(ChatMessage::user(&format!(
                            "The generated SQL failed validation: {}. Emit a corrected generate_final_query call.",
                            violations.join("; ")
                        )));
                        continue;
                    },
                    Err(violations) => return Ok((LoopOutcome::ValidationFailed(violations), transcript, iteration)),
                }
            }
        }
    }

    async fn dispatch_tool(
        &self,
        call: &crate::services::llm::ToolCall,
        validator: &SqlValidator<'_>,
        selected_patient_id: Option<Uuid>,
        multiple_patients: bool,
    ) -> ToolDispatch {
        use tools::*;

        match call.function.name.as_str() {
            FUZZY_SEARCH_PARAMETER_NAMES => {
                let args: Result<FuzzySearchArgs, _> = serde_json::from_str(&call.function.arguments);
                match args {
                    Ok(args) => ToolDispatch::Output(
                        fuzzy_search_parameter_names(&self.db.app, &args.term, args.limit.unwrap_or(50))
                            .await
                            .unwrap_or_else(|e| e),
                    ),
                    Err(e) => ToolDispatch::Output(format!("invalid arguments: {e}")),
                }
            },
            FUZZY_SEARCH_ANALYTE_NAMES => {
                let args: Result<FuzzySearchArgs, _> = serde_json::from_str(&call.function.arguments);
                match args {
                    Ok(args) => ToolDispatch::Output(
                        fuzzy_search_analyte_names(&self.db.app, &args.term, args.limit.unwrap_or(50))
                            .await
                            .unwrap_or_else(|e| e),
                    ),
                    Err(e) => ToolDispatch::Output(format!("invalid arguments: {e}")),
                }
            },
            EXECUTE_SQL => {
                let args: Result<ExecuteSqlArgs, _> = serde_json::from_str(&call.function.arguments);
                match args {
                    Ok(args) => {
                        let query_type = parse_query_type(&args.query_type);
                        let result = execute_validated_sql(
                            validator,
                            &self.db.app,
                            &args.sql,
                            query_type,
                            selected_patient_id,
                            multiple_patients,
                        )
                        .await;
                        if result.is_ok() {
                            self.touch_mru_for_sql(&args.sql);
                        }
                        ToolDispatch::Output(result.unwrap_or_else(|e| format!("execution failed: {e}")))
                    },
                    Err(e) => ToolDispatch::Output(format!("invalid arguments: {e}")),
                }
            },
            SHOW_PLOT | SHOW_TABLE => ToolDispatch::Output("displayed".to_string()),
            GENERATE_FINAL_QUERY => match serde_json::from_str::<FinalQuery>(&call.function.arguments) {
                Ok(final_query) => ToolDispatch::Final(final_query),
                Err(e) => ToolDispatch::Output(format!("invalid final query payload: {e}")),
            },
            other => ToolDispatch::Output(format!("unknown tool: {other}")),
        }
    }

    /// Records tables mentioned in executed/accepted SQL in the MRU ring so
    /// future `ask` calls in the same process bias toward them (§4.4).
    fn touch_mru_for_sql(&self, sql: &str) {
        let Some(snapshot) = self.schema_cache.current() else { return };
        let lower = sql.to_lowercase();
        let used: Vec<String> =
            snapshot.tables.iter().filter(|t| lower.contains(&t.name.to_lowercase())).map(|t| t.name.clone()).collect();
        if !used.is_empty() {
            self.schema_cache.touch_mru(&used);
        }
    }

    async fn validate_final(
        &self,
        final_query: &FinalQuery,
        validator: &SqlValidator<'_>,
        selected_patient_id: Option<Uuid>,
        multiple_patients: bool,
    ) -> Result<(), Vec<String>> {
        let query_type = parse_query_type(&final_query.query_type);
        let outcome = validator.validate(&final_query.sql, query_type, selected_patient_id, multiple_patients).await;
        if outcome.valid {
            Ok(())
        } else {
            Err(outcome.violations.into_iter().map(|v| v.message).collect())
        }
    }

    /// §4.8 step 5: forced-completion fallback restricting the model to
    /// `generate_final_query` only.
    async fn forced_completion(&self, transcript: &mut Vec<ChatMessage>) -> LoopOutcome {
        transcript.push(ChatMessage::user(
            "You must call generate_final_query now with your best answer so far.",
        ));
        let tool_specs = tools::tool_specs();
        let response = self
            .llm
            .complete_with_tools(
                &self.endpoint,
                transcript.clone(),
                tool_specs,
                Some(tools::GENERATE_FINAL_QUERY),
            )
            .await;

        let Ok(response) = response else { return LoopOutcome::NoFinalQuery };
        let Some(calls) = response.tool_calls else { return LoopOutcome::NoFinalQuery };
        let Some(call) = calls.into_iter().find(|c| c.function.name == tools::GENERATE_FINAL_QUERY) else {
            return LoopOutcome::NoFinalQuery;
        };
        match serde_json::from_str::<FinalQuery>(&call.function.arguments) {
            Ok(final_query) => LoopOutcome::Accepted(final_query),
            Err(_) => LoopOutcome::NoFinalQuery,
        }
    }
}

enum ToolDispatch {
    Output(String),
    Final(FinalQuery),
}

fn build_system_prompt(
    schema_section: &crate::models::RankedSchemaSection,
    selected_patient_id: Option<Uuid>,
) -> String {
    let schema_json = serde_json::to_string(schema_section).unwrap_or_default();
    let scope_hint = match selected_patient_id {
        Some(id) => format!("The active patient is {id}; every query must filter by this patient_id."),
        None => "Multiple patients may be in scope; filter patient_id explicitly.".to_string(),
    };
    format!(
        "You answer questions about laboratory results by writing read-only SQL. \
         Use the provided tools to explore, then call generate_final_query. {scope_hint}\n\nSchema:\n{schema_json}"
    )
}

/// Converts a dynamic result row into a JSON object using the column's
/// reported Postgres type, since ad hoc exploratory SQL has no fixed shape.
pub fn row_to_json(row: &sqlx::postgres::PgRow) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().to_string();
        let value = match type_name.as_str() {
            "INT4" | "INT2" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(|v| json!(v)),
            "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(|v| json!(v)),
            "FLOAT4" | "FLOAT8" | "NUMERIC" => {
                row.try_get::<Option<f64>, _>(i).ok().flatten().map(|v| json!(v))
            },
            "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(|v| json!(v)),
            "UUID" => row.try_get::<Option<Uuid>, _>(i).ok().flatten().map(|v| json!(v.to_string())),
            "TIMESTAMPTZ" | "TIMESTAMP" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .ok()
                .flatten()
                .map(|v| json!(v.to_rfc3339())),
            "JSONB" | "JSON" => row.try_get::<Option<serde_json::Value>, _>(i).ok().flatten(),
            _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(|v| json!(v)),
        };
        map.insert(name, value.unwrap_or(serde_json::Value::Null));
    }
    serde_json::Value::Object(map)
}
