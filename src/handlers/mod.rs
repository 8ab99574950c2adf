pub mod auth;
pub mod catalog_admin;
pub mod gmail;
pub mod jobs;
pub mod patients;
pub mod query;
pub mod reports;
