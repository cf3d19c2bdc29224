// File-backed store for tokens and connection strings
// A flat JSON object of string values. Mutations stay in memory until save().

use crate::errors::SecretsError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub const DREMIO_USER: &str = "dremio_user";
pub const DREMIO_TOKEN: &str = "dremio_token";
pub const AZURE_BLOB_CONNSTR: &str = "azure_blob_connstr";
pub const AZURE_BLOB_KEY: &str = "azure_blob_key";
pub const KUSTO_TOKEN: &str = "kusto_token";
pub const S3_ACCESS_KEY: &str = "s3_access_key";
pub const S3_SECRET_KEY: &str = "s3_secret_key";

const DEFAULT_DIR: &str = ".azdsdr";
const DEFAULT_FILE: &str = "config.json";

/// Named secrets persisted in a single JSON file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Open the store at `~/.azdsdr/config.json`
    pub fn open_default() -> Result<Self, SecretsError> {
        Self::open(default_path()?)
    }

    /// Open the store at `path`, creating an empty one on first use
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SecretsError> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            info!("Secrets file not found, creating an empty store");
            let store = Self {
                path,
                values: BTreeMap::new(),
            };
            store.save()?;
            return Ok(store);
        }

        let raw = std::fs::read_to_string(&path).map_err(|e| SecretsError::ReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let values = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&raw).map_err(|e| SecretsError::InvalidFormat {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        debug!(keys = ?keys_of(&values), "Secrets store loaded");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Update a value in memory; call `save()` to persist
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn require(&self, key: &str) -> Result<String, SecretsError> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| SecretsError::MissingKey(key.to_string()))
    }

    /// Resolve a credential: explicit argument first, then the store
    pub fn resolve(&self, explicit: Option<&str>, key: &str) -> Result<String, SecretsError> {
        match explicit {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => self.require(key),
        }
    }

    /// Rewrite the whole file
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn save(&self) -> Result<(), SecretsError> {
        let write_err = |e: String| SecretsError::WriteFailed {
            path: self.path.display().to_string(),
            reason: e,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
            }
        }

        let body = serde_json::to_string_pretty(&self.values).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(&self.path, body).map_err(|e| write_err(e.to_string()))?;

        debug!(keys = ?keys_of(&self.values), "Secrets store saved");
        Ok(())
    }
}

fn keys_of(values: &BTreeMap<String, String>) -> Vec<&str> {
    values.keys().map(String::as_str).collect()
}

fn default_path() -> Result<PathBuf, SecretsError> {
    let home = dirs::home_dir().ok_or(SecretsError::NoHomeDirectory)?;
    Ok(home.join(DEFAULT_DIR).join(DEFAULT_FILE))
}
