//! Multi-layer validator for a single agent-generated SQL statement (C3).
//! Layers run in order; any failure short-circuits with a structured list of
//! violations. Grounded on the teacher's `handlers/query.rs` limit-clamp and
//! multi-statement splitting helpers, generalized into L1/L3 here and
//! extended with plot-shape (L2), dynamic EXPLAIN (L4), and patient-scope
//! (L5) layers the teacher never needed.

mod lexical;
mod limit;
mod patient_scope;
mod plot_shape;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

pub use lexical::check_lexical;
pub use limit::apply_limit_clamp;
pub use patient_scope::check_patient_scope;
pub use plot_shape::check_plot_shape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Explore,
    Table,
    Plot,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub message: String,
}

impl Violation {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self { code: code.to_string(), message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub violations: Vec<Violation>,
    pub sql_with_limit: String,
    pub rule_version: &'static str,
    pub strategy: &'static str,
}

const RULE_VERSION: &str = "v1";

pub struct LimitCeilings {
    pub explore: i64,
    pub table: i64,
    pub plot: i64,
    pub default: i64,
}

impl QueryType {
    fn ceiling(self, ceilings: &LimitCeilings) -> i64 {
        match self {
            Self::Explore => ceilings.explore,
            Self::Table => ceilings.table,
            Self::Plot => ceilings.plot,
            Self::Data => ceilings.default,
        }
    }
}

pub struct SqlValidator<'a> {
    pool: &'a PgPool,
    ceilings: LimitCeilings,
}

impl<'a> SqlValidator<'a> {
    pub fn new(pool: &'a PgPool, ceilings: LimitCeilings) -> Self {
        Self { pool, ceilings }
    }

    /// Runs L1 through L5. `selected_patient_id` and `multiple_patients` feed
    /// L5; `query_type == Plot` triggers L2.
    pub async fn validate(
        &self,
        sql: &str,
        query_type: QueryType,
        selected_patient_id: Option<uuid::Uuid>,
        multiple_patients: bool,
    ) -> ValidationOutcome {
        let mut violations = Vec::new();

        let stripped = strip_trailing_comment(sql);

        if let Err(mut v) = check_lexical(&stripped) {
            violations.append(&mut v);
        }

        if query_type == QueryType::Plot
            && let Err(mut v) = check_plot_shape(&stripped)
        {
            violations.append(&mut v);
        }

        if !violations.is_empty() {
            return ValidationOutcome {
                valid: false,
                violations,
                sql_with_limit: stripped,
                rule_version: RULE_VERSION,
                strategy: "static",
            };
        }

        let ceiling = query_type.ceiling(&self.ceilings);
        let sql_with_limit = apply_limit_clamp(&stripped, ceiling);

        if let Err(v) = self.check_explain(&sql_with_limit).await {
            violations.push(v);
            return ValidationOutcome {
                valid: false,
                violations,
                sql_with_limit,
                rule_version: RULE_VERSION,
                strategy: "static+dynamic",
            };
        }

        if query_type != QueryType::Explore
            && multiple_patients
            && let Some(patient_id) = selected_patient_id
            && let Err(v) = check_patient_scope(&sql_with_limit, patient_id)
        {
            violations.push(v);
            return ValidationOutcome {
                valid: false,
                violations,
                sql_with_limit,
                rule_version: RULE_VERSION,
                strategy: "static+dynamic",
            };
        }

        ValidationOutcome {
            valid: true,
            violations,
            sql_with_limit,
            rule_version: RULE_VERSION,
            strategy: "static+dynamic",
        }
    }

    /// L4: wraps the statement in `EXPLAIN (FORMAT JSON)` under a 1s
    /// statement timeout and checks the root plan node family against a
    /// whitelist.
    async fn check_explain(&self, sql: &str) -> Result<(), Violation> {
        const WHITELIST: &[&str] = &[
            "Seq Scan",
            "Index Scan",
            "Index Only Scan",
            "Bitmap Heap Scan",
            "Nested Loop",
            "Hash Join",
            "Merge Join",
            "Aggregate",
            "Sort",
            "Limit",
            "Subquery Scan",
            "CTE Scan",
            "Group",
            "Hash",
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Violation::new("EXPLAIN_FAILED", e.to_string()))?;

        sqlx::query("SET LOCAL statement_timeout = '1s'")
            .execute(&mut *tx)
            .await
            .map_err(|e| Violation::new("EXPLAIN_FAILED", e.to_string()))?;

        let explain_sql = format!("EXPLAIN (FORMAT JSON) {sql}");
        let row: (serde_json::Value,) = sqlx::query_as(&explain_sql)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Violation::new("EXPLAIN_FAILED", e.to_string()))?;

        tx.commit().await.map_err(|e| Violation::new("EXPLAIN_FAILED", e.to_string()))?;

        let root_node_type = row
            .0
            .get(0)
            .and_then(|plan| plan.get("Plan"))
            .and_then(|plan| plan.get("Node Type"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        if WHITELIST.contains(&root_node_type) {
            Ok(())
        } else {
            Err(Violation::new(
                "UNSAFE_PLAN_ROOT",
                format!("plan root node '{root_node_type}' is not read-only-safe"),
            ))
        }
    }
}

/// Trailing `--` comments past the last `;` break LIMIT injection (§4.8).
fn strip_trailing_comment(sql: &str) -> String {
    let trimmed = sql.trim_end();
    if let Some(last_semi) = trimmed.rfind(';') {
        let (head, tail) = trimmed.split_at(last_semi + 1);
        if tail.trim_start().starts_with("--") {
            return head.to_string();
        }
    }
    trimmed.to_string()
}
