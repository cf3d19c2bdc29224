// Configuration management with layered configuration (defaults, file, env)
// Secrets are not part of Settings; they live in the secrets store.

use crate::poll::PollPolicy;
use crate::readers::object_store::DEFAULT_CHUNK_BYTES;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sql: SqlConfig,
    pub analytics: AnalyticsConfig,
    pub batch: BatchConfig,
    pub object_store: ObjectStoreConfig,
    pub pipeline: PipelineConfig,
    pub secrets: SecretsConfig,
    pub observability: ObservabilityConfig,
    pub job: Option<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub driver: String,
    /// Login name; falls back to the `dremio_user` secret
    pub user: Option<String>,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "dremio-mcds.trafficmanager.net".to_string(),
            port: 31010,
            driver: "Dremio Connector".to_string(),
            user: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsAuth {
    /// Token from `az account get-access-token`
    AzCli,
    /// Bearer token stored under `kusto_token`
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub cluster: String,
    pub database: String,
    pub request_timeout_seconds: u64,
    pub defer_partial_failures: bool,
    pub auth: AnalyticsAuth,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            cluster: "https://help.kusto.windows.net".to_string(),
            database: "Samples".to_string(),
            request_timeout_seconds: 3600,
            defer_partial_failures: true,
            auth: AnalyticsAuth::AzCli,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub exe_path: String,
    pub vc_path: String,
    pub account: String,
    pub work_dir: PathBuf,
    pub poll_attempts: u32,
    pub poll_interval_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            exe_path: "scope.exe".to_string(),
            vc_path: String::new(),
            account: String::new(),
            work_dir: std::env::temp_dir(),
            poll_attempts: 30,
            poll_interval_seconds: 120,
        }
    }
}

impl BatchConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.poll_attempts,
            Duration::from_secs(self.poll_interval_seconds),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    Azure,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub backend: ObjectStoreBackend,
    pub container: String,
    /// S3-compatible endpoint, e.g. `http://localhost:9000`
    pub s3_endpoint: String,
    pub s3_region: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: ObjectStoreBackend::Azure,
            container: String::new(),
            s3_endpoint: "http://localhost:9000".to_string(),
            s3_region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub temp_dir: PathBuf,
    pub chunk_bytes: usize,
    pub url_expiry_hours: i64,
    pub rows_poll_attempts: u32,
    pub rows_poll_interval_seconds: u64,
    /// Analytics folder for tables created by pipelines
    pub folder: Option<String>,
    pub delete_batch_remote: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            url_expiry_hours: 24,
            rows_poll_attempts: 60,
            rows_poll_interval_seconds: 10,
            folder: None,
            delete_batch_remote: true,
        }
    }
}

impl PipelineConfig {
    pub fn rows_poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.rows_poll_attempts,
            Duration::from_secs(self.rows_poll_interval_seconds),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Defaults to `~/.azdsdr/config.json`
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

/// Pipeline job run by the `runner` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BatchToAnalytics,
    SqlToAnalytics,
    AnalyticsToCsv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub kind: JobKind,
    /// File holding the batch script, SQL or KQL text
    pub query_file: PathBuf,
    /// Destination table, or output CSV path for `analytics_to_csv`
    pub destination: String,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("AZDSDR")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.sql.host.is_empty() {
            return Err("SQL host cannot be empty".to_string());
        }
        if self.sql.port == 0 {
            return Err("SQL port must be greater than 0".to_string());
        }

        if !self.analytics.cluster.starts_with("http://")
            && !self.analytics.cluster.starts_with("https://")
        {
            return Err("Analytics cluster must be an http(s) URL".to_string());
        }
        if self.analytics.database.is_empty() {
            return Err("Analytics database cannot be empty".to_string());
        }

        if self.batch.poll_interval_seconds == 0 {
            return Err("Batch poll_interval_seconds must be greater than 0".to_string());
        }

        if self.pipeline.chunk_bytes == 0 {
            return Err("Pipeline chunk_bytes must be greater than 0".to_string());
        }
        if self.pipeline.url_expiry_hours <= 0 {
            return Err("Pipeline url_expiry_hours must be greater than 0".to_string());
        }

        if let Some(job) = &self.job {
            if job.destination.is_empty() {
                return Err("Job destination cannot be empty".to_string());
            }
            match job.kind {
                JobKind::BatchToAnalytics | JobKind::SqlToAnalytics => {
                    if self.object_store.container.is_empty() {
                        return Err("Object store container is required for this job".to_string());
                    }
                }
                JobKind::AnalyticsToCsv => {}
            }
            if matches!(job.kind, JobKind::BatchToAnalytics)
                && (self.batch.vc_path.is_empty() || self.batch.account.is_empty())
            {
                return Err("Batch vc_path and account are required for batch jobs".to_string());
            }
        }

        Ok(())
    }
}
