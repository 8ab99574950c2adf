use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnManifest {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyManifest {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManifest {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnManifest>,
    pub foreign_keys: Vec<ForeignKeyManifest>,
}

/// `id` is the SHA-256 of the serialized manifest; in-memory cached,
/// invalidated by the `invalidate_schema` NOTIFY channel (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub id: String,
    pub tables: Vec<TableManifest>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RankedSchemaSection {
    pub tables: Vec<TableManifest>,
    pub truncated: bool,
    pub dropped_tables: Vec<String>,
}
