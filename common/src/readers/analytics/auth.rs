// Bearer token sources for the analytics REST API

use crate::errors::{AnalyticsError, SecretsError};
use crate::secrets::{ConfigStore, KUSTO_TOKEN};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Seconds before expiry at which a cached CLI token is refreshed
const REFRESH_MARGIN_SECONDS: i64 = 300;

/// Supplies the bearer token sent with every analytics request
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, AnalyticsError>;
}

/// A fixed token, given explicitly or read from the secrets store
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Resolve from `explicit`, then the `kusto_token` secret
    pub fn from_store(store: &ConfigStore, explicit: Option<&str>) -> Result<Self, SecretsError> {
        Ok(Self::new(store.resolve(explicit, KUSTO_TOKEN)?))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, AnalyticsError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct CliAccessToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    /// Unix seconds; older CLI versions omit it
    expires_on: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_on: Option<i64>,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        match self.expires_on {
            Some(expires_on) => now + REFRESH_MARGIN_SECONDS < expires_on,
            None => true,
        }
    }
}

/// Token from the signed-in Azure CLI session
pub struct AzCliToken {
    program: String,
    resource: String,
    cached: Mutex<Option<CachedToken>>,
}

impl AzCliToken {
    pub fn new(resource: impl Into<String>) -> Self {
        Self::with_program("az", resource)
    }

    /// Use a different `az` executable
    pub fn with_program(program: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            resource: resource.into(),
            cached: Mutex::new(None),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "account".to_string(),
            "get-access-token".to_string(),
            "--resource".to_string(),
            self.resource.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]
    }

    #[instrument(skip(self), fields(resource = %self.resource))]
    async fn fetch(&self) -> Result<CachedToken, AnalyticsError> {
        let output = Command::new(&self.program)
            .args(self.args())
            .output()
            .await
            .map_err(|e| {
                AnalyticsError::TokenAcquisition(format!("failed to run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            return Err(AnalyticsError::TokenAcquisition(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let parsed = parse_cli_token(&output.stdout)?;
        debug!(expires_on = ?parsed.expires_on, "Acquired access token from Azure CLI");
        Ok(parsed)
    }
}

fn parse_cli_token(stdout: &[u8]) -> Result<CachedToken, AnalyticsError> {
    let token: CliAccessToken = serde_json::from_slice(stdout)
        .map_err(|e| AnalyticsError::TokenAcquisition(format!("unreadable CLI output: {}", e)))?;
    Ok(CachedToken {
        value: token.access_token,
        expires_on: token.expires_on,
    })
}

#[async_trait]
impl TokenProvider for AzCliToken {
    async fn token(&self) -> Result<String, AnalyticsError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now().timestamp();

        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        let token = self.fetch().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}
