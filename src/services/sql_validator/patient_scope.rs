//! L5 -- patient-scope check by literal string match. A correctness risk if
//! the model paraphrases the predicate; kept as a belt around the RLS
//! suspenders, never relied on alone (§9 design note).

use super::Violation;

pub fn check_patient_scope(sql: &str, patient_id: uuid::Uuid) -> Result<(), Violation> {
    let id = patient_id.to_string();
    let single = format!("patient_id = '{id}'");
    let in_list_prefix = format!("patient_id in ('{id}'", );

    let lower = sql.to_lowercase();
    if lower.contains(&single.to_lowercase()) || lower.contains(&in_list_prefix.to_lowercase()) {
        Ok(())
    } else {
        Err(Violation::new(
            "PATIENT_SCOPE_MISSING",
            format!("statement must filter by patient_id = '{id}' or an IN list containing it"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_equality_filter() {
        let id = uuid::Uuid::nil();
        let sql = format!("SELECT * FROM lab_results WHERE patient_id = '{id}' LIMIT 10");
        assert!(check_patient_scope(&sql, id).is_ok());
    }

    #[test]
    fn rejects_missing_filter() {
        let id = uuid::Uuid::nil();
        let sql = "SELECT * FROM lab_results LIMIT 10";
        assert!(check_patient_scope(sql, id).is_err());
    }
}
