// Error handling framework
// One error enum per reader plus the pipeline error that wraps them.

use thiserror::Error;

/// Secrets store errors
#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Missing required configuration key '{0}'")]
    MissingKey(String),

    #[error("Home directory could not be determined")]
    NoHomeDirectory,

    #[error("Failed to read secrets file {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Failed to write secrets file {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Secrets file {path} is not a flat JSON object of strings: {reason}")]
    InvalidFormat { path: String, reason: String },
}

/// SQL engine errors
#[derive(Error, Debug)]
pub enum SqlError {
    #[error("SQL engine connection failed: {0}")]
    Connection(String),

    #[error("SQL query failed: {0}")]
    QueryFailed(String),

    #[error("SQL worker task failed: {0}")]
    TaskFailed(String),
}

/// Analytics engine errors
///
/// Service-reported query failures are not represented here: the reader logs
/// them and returns an absent result instead.
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Failed to create analytics client: {0}")]
    ClientBuild(String),

    #[error("Authentication against analytics cluster failed: {0}")]
    Unauthorized(String),

    #[error("Failed to acquire access token: {0}")]
    TokenAcquisition(String),

    #[error("Analytics request failed: {0}")]
    Transport(String),

    #[error("Unexpected analytics response: {0}")]
    InvalidResponse(String),

    #[error("Analytics command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Invalid entity name '{0}'")]
    InvalidName(String),

    #[error("Failed to read ingestion source {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },
}

/// Batch engine (external executable) errors
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to launch batch executable '{exe}': {reason}")]
    Launch { exe: String, reason: String },

    #[error("Batch executable reported an error: {message}\n{output}")]
    ExternalTool { message: String, output: String },

    #[error("Batch job {job_id} failed: {status}")]
    JobFailed { job_id: String, status: String },

    #[error("Batch job {job_id} did not complete after {attempts} status checks")]
    JobTimedOut { job_id: String, attempts: u32 },

    #[error("Batch file operation failed: {0}")]
    FileFailed(String),
}

/// Object store transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid object store configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to sign request: {0}")]
    Signing(String),

    #[error("Upload of '{path}' failed: {reason}")]
    UploadFailed { path: String, reason: String },

    #[error("Download of '{path}' failed: {reason}")]
    DownloadFailed { path: String, reason: String },

    #[error("Delete of '{path}' failed: {reason}")]
    DeleteFailed { path: String, reason: String },

    #[error("Listing with prefix '{prefix}' failed: {reason}")]
    ListFailed { prefix: String, reason: String },

    #[error("Local file error on {path}: {reason}")]
    LocalFile { path: String, reason: String },
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline is missing a {0} reader")]
    MissingReader(&'static str),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Analytics query returned no usable result")]
    NoResult,

    #[error("Local staging failed on {path}: {reason}")]
    Staging { path: String, reason: String },
}

impl From<reqwest::Error> for AnalyticsError {
    fn from(err: reqwest::Error) -> Self {
        AnalyticsError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(err: serde_json::Error) -> Self {
        AnalyticsError::InvalidResponse(err.to_string())
    }
}
