//! Vitallab core library: lab report ingestion, catalog resolution, and
//! agentic SQL querying over a patient's results.

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use db::Db;
pub use services::agentic::AgenticSession;
pub use services::{
    AnalyteMapper, GmailService, IngestOutcome, JobRegistry, LlmClient, ReportProcessor, SchemaCache,
    UnitNormalizer, UserService,
};
pub use utils::JwtUtil;

/// Shared application state. Every field is `Arc`-wrapped or cheaply
/// cloneable so handlers can hold an owned `State<Arc<AppState>>` per
/// request without contention.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub jwt_util: Arc<JwtUtil>,
    pub user_service: Arc<UserService>,
    pub schema_cache: Arc<SchemaCache>,
    pub unit_normalizer: Arc<UnitNormalizer>,
    pub analyte_mapper: Arc<AnalyteMapper>,
    pub report_processor: Arc<ReportProcessor>,
    pub agentic: Arc<AgenticSession>,
    pub gmail: Arc<GmailService>,
    pub jobs: JobRegistry,
}
