//! L3 -- limit clamp. Direct generalization of teacher's
//! `handlers/query.rs::apply_query_limit`: that function only ever appended
//! a fixed limit; this rewrites an existing `LIMIT` down to the ceiling when
//! it's too high, and preserves a trailing semicolon either way.

use once_cell::sync::Lazy;
use regex::Regex;

static OUTERMOST_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\s*$").unwrap());

pub fn apply_limit_clamp(sql: &str, ceiling: i64) -> String {
    let trimmed = sql.trim();
    let (body, trailing_semicolon) = match trimmed.strip_suffix(';') {
        Some(rest) => (rest.trim_end(), true),
        None => (trimmed, false),
    };

    let rewritten = if let Some(caps) = OUTERMOST_LIMIT.captures(body) {
        let existing: i64 = caps[1].parse().unwrap_or(0);
        if existing > ceiling {
            let whole = caps.get(0).unwrap();
            format!("{}LIMIT {ceiling}", &body[..whole.start()])
        } else {
            body.to_string()
        }
    } else {
        format!("{body} LIMIT {ceiling}")
    };

    if trailing_semicolon { format!("{rewritten};") } else { rewritten }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_limit_under_ceiling_unchanged() {
        assert_eq!(apply_limit_clamp("SELECT 1 LIMIT 10", 50), "SELECT 1 LIMIT 10");
    }

    #[test]
    fn rewrites_limit_over_ceiling() {
        assert_eq!(apply_limit_clamp("SELECT 1 LIMIT 5000", 50), "SELECT 1 LIMIT 50");
    }

    #[test]
    fn appends_missing_limit() {
        assert_eq!(apply_limit_clamp("SELECT 1", 50), "SELECT 1 LIMIT 50");
    }

    #[test]
    fn preserves_trailing_semicolon() {
        assert_eq!(apply_limit_clamp("SELECT 1 LIMIT 5000;", 50), "SELECT 1 LIMIT 50;");
        assert_eq!(apply_limit_clamp("SELECT 1;", 50), "SELECT 1 LIMIT 50;");
    }
}
