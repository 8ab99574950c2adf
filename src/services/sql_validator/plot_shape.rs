//! L2 -- plot-query shape, only enforced when the caller tags a query as
//! `plot` (§4.3, §8 I7).

use once_cell::sync::Lazy;
use regex::Regex;

use super::Violation;

static PROJECTS_T: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bAS\s+t\b").unwrap());
static PROJECTS_Y: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bAS\s+y\b").unwrap());
static ORDER_BY_T_ASC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)ORDER\s+BY\s+t\s+ASC").unwrap());
static Y_CAST_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)y\s*::\s*numeric").unwrap());
static EPOCH_CAST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)EXTRACT\s*\(\s*EPOCH\s+FROM[\s\S]*?\)\s*::\s*bigint\s*\*\s*1000").unwrap()
});

pub fn check_plot_shape(sql: &str) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();

    if !PROJECTS_T.is_match(sql) {
        violations.push(Violation::new("PLOT_MISSING_T", "plot query must project a column named t"));
    }
    if !PROJECTS_Y.is_match(sql) {
        violations.push(Violation::new("PLOT_MISSING_Y", "plot query must project a column named y"));
    }
    if !ORDER_BY_T_ASC.is_match(sql) {
        violations.push(Violation::new("PLOT_MISSING_ORDER", "plot query must ORDER BY t ASC"));
    }
    if !Y_CAST_NUMERIC.is_match(sql) {
        violations.push(Violation::new("PLOT_Y_NOT_NUMERIC", "plot query must cast y to numeric"));
    }
    if !EPOCH_CAST.is_match(sql) {
        violations.push(Violation::new(
            "PLOT_T_NOT_EPOCH_MS",
            "plot query must derive t via EXTRACT(EPOCH FROM ...)::bigint * 1000",
        ));
    }

    if violations.is_empty() { Ok(()) } else { Err(violations) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_plot_query() {
        let sql = "SELECT EXTRACT(EPOCH FROM created_at)::bigint * 1000 AS t, value::numeric AS y FROM lab_results ORDER BY t ASC LIMIT 100";
        assert!(check_plot_shape(sql).is_ok());
    }

    #[test]
    fn rejects_missing_order_by() {
        let sql = "SELECT EXTRACT(EPOCH FROM created_at)::bigint * 1000 AS t, value::numeric AS y FROM lab_results LIMIT 100";
        let violations = check_plot_shape(sql).unwrap_err();
        assert!(violations.iter().any(|v| v.code == "PLOT_MISSING_ORDER"));
    }
}
