pub mod agentic;
pub mod analyte;
pub mod gmail;
pub mod job;
pub mod lab_result;
pub mod patient;
pub mod report;
pub mod schema_snapshot;
pub mod unit;
pub mod user;

pub use agentic::*;
pub use analyte::*;
pub use gmail::*;
pub use job::*;
pub use lab_result::*;
pub use patient::*;
pub use report::*;
pub use schema_snapshot::*;
pub use unit::*;
pub use user::*;
