// Azure Blob Storage through the object_store client
// Requests are signed with the account key. Read URLs handed to other
// services carry a service SAS instead.

use super::sas::{self, SasRequest, SasScope};
use super::{local_error, read_block, ObjectStore};
use crate::errors::TransferError;
use ::object_store::azure::{MicrosoftAzure, MicrosoftAzureBuilder};
use ::object_store::path::Path as BlobPath;
use ::object_store::{ObjectStore as _, PutPayload};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Url;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

/// Account details parsed from a storage connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConnection {
    pub account_name: String,
    pub account_key: String,
    /// Base URL of the blob service, without a trailing slash
    pub blob_endpoint: String,
}

impl AzureConnection {
    /// Parse `AccountName=..;AccountKey=..;EndpointSuffix=..`.
    ///
    /// `BlobEndpoint` overrides the endpoint built from protocol, account
    /// and suffix.
    pub fn parse(connection_string: &str) -> Result<Self, TransferError> {
        let mut account_name = None;
        let mut account_key = None;
        let mut protocol = "https".to_string();
        let mut suffix = "core.windows.net".to_string();
        let mut blob_endpoint = None;

        for pair in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                TransferError::InvalidConfig(format!("malformed connection string segment '{}'", key_only(pair)))
            })?;

            match key {
                "AccountName" => account_name = Some(value.to_string()),
                "AccountKey" => account_key = Some(value.to_string()),
                "DefaultEndpointsProtocol" => protocol = value.to_string(),
                "EndpointSuffix" => suffix = value.to_string(),
                "BlobEndpoint" => blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                _ => {}
            }
        }

        let account_name = account_name
            .ok_or_else(|| TransferError::InvalidConfig("connection string has no AccountName".to_string()))?;
        let account_key = account_key
            .ok_or_else(|| TransferError::InvalidConfig("connection string has no AccountKey".to_string()))?;

        let blob_endpoint = blob_endpoint
            .unwrap_or_else(|| format!("{}://{}.blob.{}", protocol, account_name, suffix));

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
        })
    }
}

/// Segment text up to `=` so keys show up in errors and values do not
fn key_only(pair: &str) -> &str {
    pair.split('=').next().unwrap_or_default()
}

/// Blob container client
pub struct AzureBlobStore {
    store: MicrosoftAzure,
    connection: AzureConnection,
    container: String,
}

impl AzureBlobStore {
    pub fn new(connection: AzureConnection, container: impl Into<String>) -> Result<Self, TransferError> {
        let container = container.into();
        if container.is_empty() {
            return Err(TransferError::InvalidConfig("container name is empty".to_string()));
        }

        let store = MicrosoftAzureBuilder::new()
            .with_account(&connection.account_name)
            .with_access_key(&connection.account_key)
            .with_container_name(&container)
            .with_endpoint(connection.blob_endpoint.clone())
            .with_allow_http(connection.blob_endpoint.starts_with("http://"))
            .build()
            .map_err(|e| TransferError::InvalidConfig(format!("Azure: {}", e)))?;

        info!(
            account = %connection.account_name,
            container = %container,
            "Azure blob client initialized"
        );

        Ok(Self {
            store,
            connection,
            container,
        })
    }

    pub fn from_connection_string(
        connection_string: &str,
        container: impl Into<String>,
    ) -> Result<Self, TransferError> {
        Self::new(AzureConnection::parse(connection_string)?, container)
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn container_url(&self) -> Result<Url, TransferError> {
        let mut url = Url::parse(&self.connection.blob_endpoint)
            .map_err(|e| TransferError::InvalidConfig(format!("bad blob endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TransferError::InvalidConfig("blob endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(&self.container);
        Ok(url)
    }

    fn blob_url(&self, blob: &str) -> Result<Url, TransferError> {
        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|_| TransferError::InvalidConfig("blob endpoint cannot be a base URL".to_string()))?
            .extend(blob.split('/'));
        Ok(url)
    }

    fn read_url(
        &self,
        remote: &str,
        scope: SasScope,
        expiry: Duration,
    ) -> Result<String, TransferError> {
        let expiry = chrono::Duration::from_std(expiry)
            .map_err(|e| TransferError::Signing(e.to_string()))?;
        let pairs = SasRequest {
            account: &self.connection.account_name,
            container: &self.container,
            blob: Some(remote),
            scope,
            permissions: sas::READ,
            expiry: Utc::now() + expiry,
        }
        .sign(&self.connection.account_key)?;

        let mut url = self.blob_url(remote)?;
        url.query_pairs_mut().extend_pairs(pairs);
        Ok(url.to_string())
    }
}

/// Container-relative blob name as a store path
fn location(remote: &str) -> Result<BlobPath, TransferError> {
    BlobPath::parse(remote)
        .map_err(|e| TransferError::InvalidConfig(format!("invalid blob name '{}': {}", remote, e)))
}

/// Directory part of a listing prefix; the service lists whole directories
fn list_dir(prefix: &str) -> Option<&str> {
    prefix
        .rfind('/')
        .map(|end| &prefix[..end])
        .filter(|dir| !dir.is_empty())
}

fn upload_error(remote: &str, e: ::object_store::Error) -> TransferError {
    error!(remote = %remote, error = %e, "Blob upload failed");
    TransferError::UploadFailed {
        path: remote.to_string(),
        reason: e.to_string(),
    }
}

fn download_error(remote: &str, e: ::object_store::Error) -> TransferError {
    TransferError::DownloadFailed {
        path: remote.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn backend(&self) -> &'static str {
        "azure"
    }

    #[instrument(skip(self), fields(local = %local.display(), container = %self.container))]
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let path = location(remote)?;
        let data = tokio::fs::read(local).await.map_err(|e| local_error(local, e))?;
        let size = data.len();

        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| upload_error(remote, e))?;

        info!(size = size, "Upload done");
        Ok(())
    }

    #[instrument(skip(self), fields(local = %local.display(), container = %self.container))]
    async fn upload_chunked(
        &self,
        local: &Path,
        remote: &str,
        chunk_bytes: usize,
    ) -> Result<(), TransferError> {
        if chunk_bytes == 0 {
            return Err(TransferError::InvalidConfig("chunk size must be greater than 0".to_string()));
        }

        let path = location(remote)?;
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| local_error(local, e))?;
        let mut upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| upload_error(remote, e))?;

        let mut blocks = 0usize;
        let staged: Result<(), TransferError> = async {
            loop {
                let block = read_block(&mut file, chunk_bytes)
                    .await
                    .map_err(|e| local_error(local, e))?;
                if block.is_empty() {
                    return Ok(());
                }

                debug!(block = blocks, size = block.len(), "Staging block");
                upload
                    .put_part(PutPayload::from(block))
                    .await
                    .map_err(|e| upload_error(remote, e))?;
                blocks += 1;
            }
        }
        .await;

        if let Err(e) = staged {
            if let Err(abort) = upload.abort().await {
                warn!(error = %abort, "Failed to abort chunked upload");
            }
            return Err(e);
        }

        upload.complete().await.map_err(|e| upload_error(remote, e))?;
        info!(blocks = blocks, "Chunked upload committed");
        Ok(())
    }

    #[instrument(skip(self), fields(local = %local.display(), container = %self.container))]
    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let path = location(remote)?;
        let mut stream = self
            .store
            .get(&path)
            .await
            .map_err(|e| download_error(remote, e))?
            .into_stream();

        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| local_error(local, e))?;
        let mut size = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(remote, e))?;
            size += chunk.len();
            file.write_all(&chunk).await.map_err(|e| local_error(local, e))?;
        }
        file.flush().await.map_err(|e| local_error(local, e))?;

        debug!(size = size, "Download done");
        Ok(())
    }

    async fn mint_read_url(&self, remote: &str, expiry: Duration) -> Result<String, TransferError> {
        self.read_url(remote, SasScope::Container, expiry)
    }

    async fn mint_object_read_url(
        &self,
        remote: &str,
        expiry: Duration,
    ) -> Result<String, TransferError> {
        self.read_url(remote, SasScope::Blob, expiry)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let dir = list_dir(prefix).map(location).transpose()?;

        let mut stream = self.store.list(dir.as_ref());
        let mut names = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| TransferError::ListFailed {
                prefix: prefix.to_string(),
                reason: e.to_string(),
            })?;
            let name = meta.location.to_string();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }

        debug!(count = names.len(), "Blobs listed");
        Ok(names)
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn delete_one(&self, remote: &str) -> Result<(), TransferError> {
        let path = location(remote)?;

        match self.store.delete(&path).await {
            Ok(()) => {
                info!("Blob deleted");
                Ok(())
            }
            Err(::object_store::Error::NotFound { .. }) => {
                debug!("Blob already absent");
                Ok(())
            }
            Err(e) => Err(TransferError::DeleteFailed {
                path: remote.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
