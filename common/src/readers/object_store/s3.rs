// S3-compatible object store backed by rust-s3
// Works against AWS S3 and MinIO; buckets are addressed path-style.

use super::{local_error, read_block, ObjectStore};
use crate::config::ObjectStoreConfig;
use crate::errors::TransferError;
use async_trait::async_trait;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Smallest part S3 accepts for every part but the last
pub const MIN_PART_BYTES: usize = 5 * 1024 * 1024;

const CONTENT_TYPE: &str = "text/csv";

/// Presigned URLs cannot outlive seven days
const MAX_PRESIGN_SECONDS: u64 = 7 * 24 * 3600;

/// Bucket client
#[derive(Clone, Debug)]
pub struct S3Store {
    bucket: Arc<Bucket>,
    name: String,
}

fn status_ok(code: u16) -> bool {
    (200..300).contains(&code)
}

impl S3Store {
    #[instrument(skip(config, access_key, secret_key), fields(endpoint = %config.s3_endpoint, bucket = %config.container))]
    pub fn new(
        config: &ObjectStoreConfig,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, TransferError> {
        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| {
                error!(error = %e, "Failed to create S3 credentials");
                TransferError::InvalidConfig(format!("Failed to create credentials: {}", e))
            })?;

        // The scheme stays in the endpoint so plain-http MinIO works
        let region = Region::Custom {
            region: config.s3_region.clone(),
            endpoint: config.s3_endpoint.trim_end_matches('/').to_string(),
        };

        let bucket = Bucket::new(&config.container, region, credentials)
            .map_err(|e| {
                error!(error = %e, "Failed to create S3 bucket handle");
                TransferError::InvalidConfig(format!("Failed to create bucket: {}", e))
            })?
            .with_path_style();

        info!("S3 client initialized");

        Ok(Self {
            bucket: Arc::from(bucket),
            name: config.container.clone(),
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.name
    }

    async fn abort(&self, remote: &str, upload_id: &str) {
        if let Err(e) = self.bucket.abort_upload(remote, upload_id).await {
            warn!(error = %e, upload_id = %upload_id, "Failed to abort multipart upload");
        }
    }

    async fn presign(&self, remote: &str, expiry: Duration) -> Result<String, TransferError> {
        let seconds = expiry.as_secs().clamp(1, MAX_PRESIGN_SECONDS) as u32;
        self.bucket
            .presign_get(remote, seconds, None)
            .await
            .map_err(|e| TransferError::Signing(format!("Failed to presign '{}': {}", remote, e)))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn backend(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(local = %local.display(), bucket = %self.name))]
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let data = tokio::fs::read(local).await.map_err(|e| local_error(local, e))?;

        let response = self.bucket.put_object(remote, &data).await.map_err(|e| {
            error!(error = %e, "Failed to put object");
            TransferError::UploadFailed {
                path: remote.to_string(),
                reason: e.to_string(),
            }
        })?;
        if !status_ok(response.status_code()) {
            return Err(TransferError::UploadFailed {
                path: remote.to_string(),
                reason: format!("status {}", response.status_code()),
            });
        }

        info!(size = data.len(), "Upload done");
        Ok(())
    }

    #[instrument(skip(self), fields(local = %local.display(), bucket = %self.name))]
    async fn upload_chunked(
        &self,
        local: &Path,
        remote: &str,
        chunk_bytes: usize,
    ) -> Result<(), TransferError> {
        let part_bytes = chunk_bytes.max(MIN_PART_BYTES);
        let upload_error = |reason: String| TransferError::UploadFailed {
            path: remote.to_string(),
            reason,
        };

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| local_error(local, e))?;

        let upload = self
            .bucket
            .initiate_multipart_upload(remote, CONTENT_TYPE)
            .await
            .map_err(|e| upload_error(e.to_string()))?;
        let upload_id = upload.upload_id;

        let mut parts = Vec::new();
        loop {
            let block = match read_block(&mut file, part_bytes).await {
                Ok(block) => block,
                Err(e) => {
                    self.abort(remote, &upload_id).await;
                    return Err(local_error(local, e));
                }
            };
            // An empty file still needs one (empty) part
            if block.is_empty() && !parts.is_empty() {
                break;
            }

            let part_number = parts.len() as u32 + 1;
            let last = block.len() < part_bytes;
            debug!(part = part_number, size = block.len(), "Uploading part");

            match self
                .bucket
                .put_multipart_chunk(block, remote, part_number, &upload_id, CONTENT_TYPE)
                .await
            {
                Ok(part) => parts.push(part),
                Err(e) => {
                    self.abort(remote, &upload_id).await;
                    return Err(upload_error(e.to_string()));
                }
            }

            if last {
                break;
            }
        }

        let count = parts.len();
        let response = match self
            .bucket
            .complete_multipart_upload(remote, &upload_id, parts)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.abort(remote, &upload_id).await;
                return Err(upload_error(e.to_string()));
            }
        };
        if !status_ok(response.status_code()) {
            self.abort(remote, &upload_id).await;
            return Err(upload_error(format!("status {}", response.status_code())));
        }

        info!(parts = count, "Chunked upload committed");
        Ok(())
    }

    #[instrument(skip(self), fields(local = %local.display(), bucket = %self.name))]
    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let download_error = |reason: String| TransferError::DownloadFailed {
            path: remote.to_string(),
            reason,
        };

        let response = self
            .bucket
            .get_object(remote)
            .await
            .map_err(|e| download_error(e.to_string()))?;
        if !status_ok(response.status_code()) {
            return Err(download_error(format!("status {}", response.status_code())));
        }

        let data = response.bytes();
        tokio::fs::write(local, data)
            .await
            .map_err(|e| local_error(local, e))?;

        debug!(size = data.len(), "Download done");
        Ok(())
    }

    async fn mint_read_url(&self, remote: &str, expiry: Duration) -> Result<String, TransferError> {
        self.presign(remote, expiry).await
    }

    async fn mint_object_read_url(
        &self,
        remote: &str,
        expiry: Duration,
    ) -> Result<String, TransferError> {
        self.presign(remote, expiry).await
    }

    #[instrument(skip(self), fields(bucket = %self.name))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let results = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to list objects");
                TransferError::ListFailed {
                    prefix: prefix.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let objects: Vec<String> = results
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .collect();

        debug!(count = objects.len(), "Objects listed");
        Ok(objects)
    }

    #[instrument(skip(self), fields(bucket = %self.name))]
    async fn delete_one(&self, remote: &str) -> Result<(), TransferError> {
        let response = self.bucket.delete_object(remote).await.map_err(|e| {
            error!(error = %e, "Failed to delete object");
            TransferError::DeleteFailed {
                path: remote.to_string(),
                reason: e.to_string(),
            }
        })?;

        let code = response.status_code();
        if !status_ok(code) && code != 404 {
            return Err(TransferError::DeleteFailed {
                path: remote.to_string(),
                reason: format!("status {}", code),
            });
        }

        info!("Object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObjectStoreConfig {
        ObjectStoreConfig {
            container: "staging".to_string(),
            s3_endpoint: "http://localhost:9000".to_string(),
            ..ObjectStoreConfig::default()
        }
    }

    #[test]
    fn test_new_store() {
        let store = S3Store::new(&config(), "minioadmin", "minioadmin").unwrap();
        assert_eq!(store.bucket_name(), "staging");
        assert_eq!(store.backend(), "s3");
    }

    #[test]
    fn test_status_codes() {
        assert!(status_ok(200));
        assert!(status_ok(204));
        assert!(!status_ok(404));
        assert!(!status_ok(503));
    }

    #[tokio::test]
    async fn test_presigned_url_targets_object() {
        let store = S3Store::new(&config(), "minioadmin", "minioadmin").unwrap();
        let url = store
            .mint_read_url("exports/data.csv", Duration::from_secs(600))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/staging/exports/data.csv?"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
