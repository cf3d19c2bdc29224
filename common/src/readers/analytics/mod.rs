// Analytics engine reader over the REST v1 query and management endpoints
// Service-reported failures are logged and surface as absent results.

pub mod auth;
pub mod commands;
pub mod response;

pub use auth::{AzCliToken, StaticToken, TokenProvider};
pub use commands::ExportTarget;

use crate::config::AnalyticsConfig;
use crate::errors::AnalyticsError;
use crate::models::{IngestionAck, IngestionSource, TabularResult};
use crate::poll::{poll_until, Check, PollOutcome, PollPolicy};
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Connection options for the analytics reader
#[derive(Debug, Clone)]
pub struct AnalyticsOptions {
    pub cluster: String,
    pub database: String,
    pub request_timeout: Duration,
    pub defer_partial_failures: bool,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self::from_config(&AnalyticsConfig::default())
    }
}

impl AnalyticsOptions {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            cluster: config.cluster.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            defer_partial_failures: config.defer_partial_failures,
        }
    }
}

/// Reply to one request: tables, or a failure reported by the service
enum Reply {
    Tables(Vec<TabularResult>),
    Rejected(String),
}

/// Reader for the analytics engine
pub struct AnalyticsReader {
    client: Client,
    options: AnalyticsOptions,
    token: Arc<dyn TokenProvider>,
}

impl AnalyticsReader {
    pub fn new(
        options: AnalyticsOptions,
        token: Arc<dyn TokenProvider>,
    ) -> Result<Self, AnalyticsError> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| AnalyticsError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            options,
            token,
        })
    }

    pub fn options(&self) -> &AnalyticsOptions {
        &self.options
    }

    fn properties(&self) -> String {
        let secs = self.options.request_timeout.as_secs();
        json!({
            "Options": {
                "deferpartialqueryfailures": self.options.defer_partial_failures,
                "servertimeout": format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60),
            }
        })
        .to_string()
    }

    /// POST one script to the query or management endpoint
    async fn send(&self, csl: &str) -> Result<Reply, AnalyticsError> {
        let endpoint = if commands::is_management(csl) {
            "mgmt"
        } else {
            "query"
        };
        let url = format!("{}/v1/rest/{}", self.options.cluster, endpoint);
        let token = self.token.token().await?;

        debug!(endpoint = endpoint, "Sending analytics request");

        let reply = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("x-ms-client-request-id", format!("azdsdr;{}", Uuid::new_v4()))
            .header("x-ms-app", "azdsdr")
            .json(&json!({
                "db": self.options.database,
                "csl": csl,
                "properties": self.properties(),
            }))
            .send()
            .await?;

        let status = reply.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = reply.text().await.unwrap_or_default();
            return Err(AnalyticsError::Unauthorized(format!(
                "{}: {}",
                status,
                response::error_message(&body)
            )));
        }

        let body = reply.bytes().await?;
        if !status.is_success() {
            let message = response::error_message(&String::from_utf8_lossy(&body));
            return Ok(Reply::Rejected(format!("{}: {}", status, message)));
        }

        let parsed = response::parse_v1(&body)?;
        if !parsed.errors.is_empty() {
            return Ok(Reply::Rejected(parsed.errors.join("; ")));
        }
        Ok(Reply::Tables(parsed.primary))
    }

    /// Run a management command whose failure is an error
    async fn command(&self, csl: String) -> Result<Vec<TabularResult>, AnalyticsError> {
        match self.send(&csl).await? {
            Reply::Tables(tables) => Ok(tables),
            Reply::Rejected(reason) => Err(AnalyticsError::CommandFailed {
                command: csl.lines().next().unwrap_or_default().to_string(),
                reason,
            }),
        }
    }

    /// First primary result of a script; `None` when the service rejected it
    #[instrument(skip(self, script), fields(database = %self.options.database))]
    pub async fn execute(&self, script: &str) -> Result<Option<TabularResult>, AnalyticsError> {
        Ok(self
            .execute_multi(script)
            .await?
            .and_then(|results| results.into_iter().next()))
    }

    /// All primary results, in statement order
    #[instrument(skip(self, script), fields(database = %self.options.database))]
    pub async fn execute_multi(
        &self,
        script: &str,
    ) -> Result<Option<Vec<TabularResult>>, AnalyticsError> {
        match self.send(script).await? {
            Reply::Tables(tables) => {
                debug!(results = tables.len(), "Analytics query succeeded");
                Ok(Some(tables))
            }
            Reply::Rejected(reason) => {
                warn!(error = %reason, "Analytics query failed");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn table_exists(&self, name: &str) -> Result<bool, AnalyticsError> {
        let tables = self.command(commands::show_table(name)?).await?;
        Ok(tables.first().map(|t| !t.is_empty()).unwrap_or(false))
    }

    #[instrument(skip(self))]
    pub async fn drop_table(&self, name: &str) -> Result<(), AnalyticsError> {
        self.command(commands::drop_table(name)?).await?;
        info!("Table dropped");
        Ok(())
    }

    /// Create a table with every column typed `string`
    #[instrument(skip(self, columns), fields(columns = columns.len()))]
    pub async fn create_table_from_schema(
        &self,
        name: &str,
        columns: &[String],
        folder: Option<&str>,
    ) -> Result<(), AnalyticsError> {
        self.command(commands::create_table(name, columns, folder)?)
            .await?;
        info!("Table created");
        Ok(())
    }

    /// Request ingestion; rows may become queryable later
    #[instrument(skip(self, source), fields(source = source.kind()))]
    pub async fn ingest(
        &self,
        name: &str,
        source: IngestionSource,
    ) -> Result<IngestionAck, AnalyticsError> {
        let source_kind = source.kind().to_string();

        let command = match &source {
            IngestionSource::Table(table) => {
                let csv = table
                    .to_csv_string()
                    .map_err(|e| AnalyticsError::SourceUnreadable {
                        path: "<memory>".to_string(),
                        reason: e.to_string(),
                    })?;
                commands::ingest_inline(name, &csv)?
            }
            IngestionSource::LocalFile(path) => {
                let csv = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AnalyticsError::SourceUnreadable {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                commands::ingest_inline(name, &csv)?
            }
            IngestionSource::RemoteUrl(url) => commands::ingest_from_url(name, url)?,
        };

        let tables = self.command(command).await?;
        let operation_id = match source {
            IngestionSource::RemoteUrl(_) => first_string(&tables, "OperationId"),
            _ => None,
        };

        info!(operation_id = ?operation_id, "Ingestion requested");
        Ok(IngestionAck {
            table: name.to_string(),
            source_kind,
            operation_id,
            requested_at: Utc::now(),
        })
    }

    #[instrument(skip(self))]
    pub async fn row_count(&self, name: &str) -> Result<u64, AnalyticsError> {
        let query = commands::row_count(name)?;
        let tables = self.command(query).await?;
        let cell = tables
            .first()
            .and_then(|t| t.get(0, "Count"))
            .ok_or_else(|| AnalyticsError::InvalidResponse("count returned no rows".to_string()))?;

        match cell {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| AnalyticsError::InvalidResponse(format!("bad count value {}", cell)))
    }

    /// Poll the row count until it is non-zero
    #[instrument(skip(self, policy))]
    pub async fn wait_for_rows(&self, name: &str, policy: PollPolicy) -> PollOutcome<u64> {
        poll_until(policy, "analytics_rows", move || async move {
            let count = self.row_count(name).await?;
            Ok::<_, AnalyticsError>(if count > 0 {
                Check::Ready(count)
            } else {
                Check::Pending
            })
        })
        .await
    }

    /// Start an async export to blob storage; returns the operation id
    #[instrument(skip(self, script, target), fields(prefix = %target.name_prefix))]
    pub async fn export_async(
        &self,
        script: &str,
        target: &ExportTarget,
    ) -> Result<String, AnalyticsError> {
        let tables = self.command(commands::export_async(script, target)).await?;
        let id = first_string(&tables, "OperationId").ok_or_else(|| {
            AnalyticsError::InvalidResponse("export returned no OperationId".to_string())
        })?;
        info!(operation_id = %id, "Export started");
        Ok(id)
    }

    /// Poll an async operation until it reaches a final state
    #[instrument(skip(self, policy))]
    pub async fn wait_for_operation(
        &self,
        operation_id: &str,
        policy: PollPolicy,
    ) -> PollOutcome<String> {
        poll_until(policy, "analytics_operation", move || async move {
            let tables = self.command(commands::show_operation(operation_id)).await?;
            Ok::<_, AnalyticsError>(match first_string(&tables, "State") {
                Some(state) => commands::classify_operation_state(&state),
                None => Check::Pending,
            })
        })
        .await
    }
}

fn first_string(tables: &[TabularResult], column: &str) -> Option<String> {
    match tables.first()?.get(0, column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
