use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// `user_id` is nullable only during the auth-migration window (§3); new
/// writes must always set it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Patient {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub display_name: String,
    pub normalized_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub last_seen_report_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn normalize_patient_name(display_name: &str) -> String {
    display_name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PatientResponse {
    pub id: Uuid,
    pub display_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub last_seen_report_at: Option<DateTime<Utc>>,
}

impl From<Patient> for PatientResponse {
    fn from(p: Patient) -> Self {
        Self {
            id: p.id,
            display_name: p.display_name,
            date_of_birth: p.date_of_birth,
            gender: p.gender,
            last_seen_report_at: p.last_seen_report_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_lowercases() {
        assert_eq!(normalize_patient_name("  Jane   DOE "), "jane doe");
    }
}
