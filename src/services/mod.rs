pub mod agentic;
pub mod analyte_mapper;
pub mod gmail;
pub mod job_fabric;
pub mod llm;
pub mod report_processor;
pub mod schema_snapshot;
pub mod sql_validator;
pub mod unit_normalizer;
pub mod user_service;
pub mod vision;

pub use analyte_mapper::AnalyteMapper;
pub use gmail::GmailService;
pub use job_fabric::{JobRegistry, SessionSweepTask};
pub use llm::{ChatMessage, LlmClient, LlmEndpoint, LlmError};
pub use report_processor::{IngestOutcome, ReportProcessor, VisionExtractor};
pub use schema_snapshot::SchemaCache;
pub use sql_validator::SqlValidator;
pub use unit_normalizer::UnitNormalizer;
pub use user_service::UserService;
pub use vision::LlmVisionExtractor;
