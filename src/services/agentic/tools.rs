//! Tool specs and dispatch for the agentic SQL loop (§4.8).

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::llm::{ToolFunctionSpec, ToolSpec};
use crate::services::sql_validator::{QueryType, SqlValidator};

pub const FUZZY_SEARCH_PARAMETER_NAMES: &str = "fuzzy_search_parameter_names";
pub const FUZZY_SEARCH_ANALYTE_NAMES: &str = "fuzzy_search_analyte_names";
pub const EXECUTE_SQL: &str = "execute_sql";
pub const SHOW_PLOT: &str = "show_plot";
pub const SHOW_TABLE: &str = "show_table";
pub const GENERATE_FINAL_QUERY: &str = "generate_final_query";

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: FUZZY_SEARCH_PARAMETER_NAMES.to_string(),
                description: "Fuzzy search lab_results.parameter_name within the caller's RLS scope."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "term": {"type": "string"},
                        "limit": {"type": "integer", "maximum": 50}
                    },
                    "required": ["term"]
                }),
            },
        },
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: FUZZY_SEARCH_ANALYTE_NAMES.to_string(),
                description: "Fuzzy search the shared analyte catalog by name or alias.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "term": {"type": "string"},
                        "limit": {"type": "integer", "maximum": 50}
                    },
                    "required": ["term"]
                }),
            },
        },
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: EXECUTE_SQL.to_string(),
                description: "Execute a read-only exploratory SQL statement, validated through the \
                    SQL validator with a limit ceiling matching query_type."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "sql": {"type": "string"},
                        "reasoning": {"type": "string"},
                        "query_type": {"type": "string", "enum": ["explore", "plot", "table"]}
                    },
                    "required": ["sql", "reasoning", "query_type"]
                }),
            },
        },
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: SHOW_PLOT.to_string(),
                description: "Display pre-fetched data as a plot. Display-only, does not query.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "data": {"type": "array"},
                        "plot_title": {"type": "string"},
                        "replace_previous": {"type": "boolean"},
                        "thumbnail": {"type": "boolean"}
                    },
                    "required": ["data", "plot_title"]
                }),
            },
        },
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: SHOW_TABLE.to_string(),
                description: "Display pre-fetched data as a table. Display-only, does not query.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "data": {"type": "array"},
                        "table_title": {"type": "string"},
                        "replace_previous": {"type": "boolean"}
                    },
                    "required": ["data", "table_title"]
                }),
            },
        },
        ToolSpec {
            r#type: "function".to_string(),
            function: ToolFunctionSpec {
                name: GENERATE_FINAL_QUERY.to_string(),
                description: "Terminal tool: emit the final validated SQL answering the user's question."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "sql": {"type": "string"},
                        "explanation": {"type": "string"},
                        "confidence": {"type": "number"},
                        "query_type": {"type": "string", "enum": ["explore", "plot", "table", "data"]},
                        "plot_metadata": {"type": "object"},
                        "plot_title": {"type": "string"}
                    },
                    "required": ["sql", "explanation", "confidence", "query_type"]
                }),
            },
        },
    ]
}

#[derive(Debug, Deserialize)]
pub struct ExecuteSqlArgs {
    pub sql: String,
    #[allow(dead_code)]
    pub reasoning: String,
    pub query_type: String,
}

#[derive(Debug, Deserialize)]
pub struct FuzzySearchArgs {
    pub term: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FinalQuery {
    pub sql: String,
    pub explanation: String,
    pub confidence: f64,
    pub query_type: String,
    pub plot_metadata: Option<serde_json::Value>,
    pub plot_title: Option<String>,
}

pub fn parse_query_type(raw: &str) -> QueryType {
    match raw {
        "plot" => QueryType::Plot,
        "table" => QueryType::Table,
        "data" => QueryType::Data,
        _ => QueryType::Explore,
    }
}

pub async fn fuzzy_search_parameter_names(pool: &PgPool, term: &str, limit: i64) -> Result<String, String> {
    let limit = limit.clamp(1, 50);
    let rows: Vec<(String, f64)> = sqlx::query_as(
        "SELECT DISTINCT parameter_name, similarity(parameter_name, $1) AS sim FROM lab_results \
         WHERE parameter_name % $1 ORDER BY sim DESC LIMIT $2",
    )
    .bind(term)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| e.to_string())?;
    serde_json::to_string(&rows).map_err(|e| e.to_string())
}

pub async fn fuzzy_search_analyte_names(pool: &PgPool, term: &str, limit: i64) -> Result<String, String> {
    let limit = limit.clamp(1, 50);
    let rows: Vec<(String, String, f64)> = sqlx::query_as(
        "SELECT a.code, a.canonical_name, similarity(aa.alias, $1) AS sim FROM analyte_aliases aa \
         JOIN analytes a ON a.id = aa.analyte_id WHERE aa.alias % $1 ORDER BY sim DESC LIMIT $2",
    )
    .bind(term)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| e.to_string())?;
    serde_json::to_string(&rows).map_err(|e| e.to_string())
}

pub async fn execute_validated_sql(
    validator: &SqlValidator<'_>,
    pool: &PgPool,
    sql: &str,
    query_type: QueryType,
    selected_patient_id: Option<Uuid>,
    multiple_patients: bool,
) -> Result<String, String> {
    let outcome = validator.validate(sql, query_type, selected_patient_id, multiple_patients).await;
    if !outcome.valid {
        return Err(serde_json::to_string(&outcome.violations).unwrap_or_default());
    }

    let rows = sqlx::query(&outcome.sql_with_limit).fetch_all(pool).await.map_err(|e| e.to_string())?;
    let json_rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| crate::services::agentic::row_to_json(row))
        .collect();
    serde_json::to_string(&json_rows).map_err(|e| e.to_string())
}
