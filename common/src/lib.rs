// Readers for the SQL, analytics, batch and blob services, and the pipelines
// that move data between them

pub mod config;
pub mod errors;
pub mod files;
pub mod models;
pub mod pipeline;
pub mod poll;
pub mod readers;
pub mod secrets;
pub mod telemetry;
