//! L1 -- lexical/syntactic guardrails on a comment-stripped statement.
//! Grounded on teacher's `handlers/query.rs::parse_sql_statements` for the
//! quote-aware scanning approach, generalized from "split on `;`" to
//! "reject any non-trailing `;`".

use once_cell::sync::Lazy;
use regex::Regex;

use super::Violation;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE", "ALTER", "DROP", "CREATE", "REPLACE",
    "GRANT", "REVOKE", "COPY", "CALL", "DO", "VACUUM", "ANALYZE", "CLUSTER", "REFRESH", "SET",
    "RESET", "SHOW", "COMMENT", "LISTEN", "UNLISTEN", "NOTIFY",
];

const FORBIDDEN_FUNCTIONS: &[&str] =
    &["pg_sleep", "pg_read_", "pg_ls_dir", "pg_write_", "pg_log_", "lo_import", "lo_export", "dblink"];

const MAX_JOINS: usize = 5;
const MAX_SUBQUERY_NESTING: usize = 2;
const MAX_AGGREGATES: usize = 10;

static SELECT_INTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bSELECT\b[\s\S]*?\bINTO\b").unwrap());
static LOCK_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLOCK\b").unwrap());
static FOR_UPDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFOR\s+(UPDATE|SHARE|NO\s+KEY\s+UPDATE|KEY\s+SHARE)\b").unwrap()
});
static NAMED_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r":[A-Za-z_][A-Za-z0-9_]*").unwrap());
static NUMBERED_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").unwrap());
static BARE_QUESTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?").unwrap());
static AGGREGATE_FN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(COUNT|SUM|AVG|MIN|MAX|ARRAY_AGG|STRING_AGG|JSON_AGG)\s*\(").unwrap()
});
static JOIN_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").unwrap());

pub fn check_lexical(sql: &str) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();

    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        violations.push(Violation::new(
            "NOT_READ_ONLY",
            "statement must begin with SELECT or WITH",
        ));
    }

    for keyword in FORBIDDEN_KEYWORDS {
        if contains_whole_word(&upper, keyword) {
            violations.push(Violation::new(
                "FORBIDDEN_KEYWORD",
                format!("forbidden keyword: {keyword}"),
            ));
        }
    }

    if SELECT_INTO.is_match(trimmed) {
        violations.push(Violation::new("FORBIDDEN_KEYWORD", "SELECT INTO is not allowed"));
    }
    if LOCK_CLAUSE.is_match(trimmed) {
        violations.push(Violation::new("FORBIDDEN_KEYWORD", "LOCK is not allowed"));
    }
    if FOR_UPDATE.is_match(trimmed) {
        violations.push(Violation::new("FORBIDDEN_KEYWORD", "row locking clauses are not allowed"));
    }
    if upper.contains("PG_TEMP") || upper.contains("PG_TOAST") {
        violations.push(Violation::new(
            "FORBIDDEN_SCHEMA",
            "system-schema references are not allowed",
        ));
    }

    let lower = trimmed.to_lowercase();
    for func in FORBIDDEN_FUNCTIONS {
        if lower.contains(func) {
            violations.push(Violation::new(
                "FORBIDDEN_FUNCTION",
                format!("forbidden function: {func}"),
            ));
        }
    }

    if has_placeholder(trimmed) {
        violations.push(Violation::new("PLACEHOLDER_SYNTAX", "parameter placeholders are not allowed"));
    }

    if has_multiple_statements(trimmed) {
        violations.push(Violation::new(
            "MULTIPLE_STATEMENTS",
            "only a single statement is allowed",
        ));
    }

    let join_count = JOIN_KEYWORD.find_iter(&upper).count();
    if join_count > MAX_JOINS {
        violations.push(Violation::new(
            "COMPLEXITY_JOINS",
            format!("{join_count} joins exceeds the cap of {MAX_JOINS}"),
        ));
    }

    let nesting = max_paren_depth(trimmed);
    if nesting > MAX_SUBQUERY_NESTING {
        violations.push(Violation::new(
            "COMPLEXITY_NESTING",
            format!("nesting depth {nesting} exceeds the cap of {MAX_SUBQUERY_NESTING}"),
        ));
    }

    let aggregate_count = AGGREGATE_FN.find_iter(trimmed).count();
    if aggregate_count > MAX_AGGREGATES {
        violations.push(Violation::new(
            "COMPLEXITY_AGGREGATES",
            format!("{aggregate_count} aggregate calls exceeds the cap of {MAX_AGGREGATES}"),
        ));
    }

    if violations.is_empty() { Ok(()) } else { Err(violations) }
}

fn contains_whole_word(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0 || !haystack.as_bytes()[abs - 1].is_ascii_alphanumeric();
        let after = abs + word.len();
        let after_ok =
            after >= haystack.len() || !haystack.as_bytes()[after].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = abs + word.len();
    }
    false
}

/// `::typecast` must not be confused with `:name` placeholders.
fn has_placeholder(sql: &str) -> bool {
    if NUMBERED_PLACEHOLDER.is_match(sql) {
        return true;
    }

    let without_typecasts = sql.replace("::", " ");
    if NAMED_PLACEHOLDER.is_match(&without_typecasts) {
        return true;
    }

    let mut in_single_quote = false;
    for ch in without_typecasts.chars() {
        match ch {
            '\'' => in_single_quote = !in_single_quote,
            '?' if !in_single_quote => return true,
            _ => {},
        }
    }
    let _ = BARE_QUESTION;
    false
}

fn has_multiple_statements(sql: &str) -> bool {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    let mut semi_count = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            ';' if !in_single_quote && !in_double_quote => semi_count += 1,
            _ => {},
        }
        i += 1;
    }

    let trailing = sql.trim_end().ends_with(';');
    if trailing { semi_count > 1 } else { semi_count > 0 }
}

fn max_paren_depth(sql: &str) -> usize {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    let mut in_single_quote = false;
    for ch in sql.chars() {
        match ch {
            '\'' => in_single_quote = !in_single_quote,
            '(' if !in_single_quote => {
                depth += 1;
                max_depth = max_depth.max(depth);
            },
            ')' if !in_single_quote => depth = depth.saturating_sub(1),
            _ => {},
        }
    }
    max_depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_named_placeholder() {
        let result = check_lexical("SELECT name FROM patients WHERE id = :pid LIMIT 10");
        let violations = result.unwrap_err();
        assert!(violations.iter().any(|v| v.code == "PLACEHOLDER_SYNTAX"));
    }

    #[test]
    fn accepts_typecast() {
        assert!(check_lexical("SELECT name::text FROM patients LIMIT 10").is_ok());
    }

    #[test]
    fn rejects_forbidden_keyword() {
        let result = check_lexical("DELETE FROM patients");
        let violations = result.unwrap_err();
        assert!(violations.iter().any(|v| v.code == "FORBIDDEN_KEYWORD"));
    }

    #[test]
    fn rejects_multiple_statements() {
        let result = check_lexical("SELECT 1; SELECT 2;");
        let violations = result.unwrap_err();
        assert!(violations.iter().any(|v| v.code == "MULTIPLE_STATEMENTS"));
    }

    #[test]
    fn allows_single_trailing_semicolon() {
        assert!(check_lexical("SELECT 1 LIMIT 10;").is_ok());
    }
}
