// Object store abstraction and its two backends
// Blob names are container-relative; local paths are plain filesystem paths.

pub mod azure;
pub mod s3;
pub mod sas;

pub use azure::{AzureBlobStore, AzureConnection};
pub use s3::S3Store;

use crate::errors::TransferError;
use crate::files;
use crate::models::CleanupReport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Block size used when the caller does not choose one
pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Blob storage operations used by the pipelines
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Upload a local file in a single request
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransferError>;

    /// Upload a local file as ordered blocks, committed in one final step
    async fn upload_chunked(
        &self,
        local: &Path,
        remote: &str,
        chunk_bytes: usize,
    ) -> Result<(), TransferError>;

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransferError>;

    /// Read-only, time-limited URL usable by other services
    async fn mint_read_url(&self, remote: &str, expiry: Duration) -> Result<String, TransferError>;

    /// Like `mint_read_url`, but the signature grants access to this object only
    async fn mint_object_read_url(
        &self,
        remote: &str,
        expiry: Duration,
    ) -> Result<String, TransferError>;

    /// Names of all objects under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError>;

    async fn delete_one(&self, remote: &str) -> Result<(), TransferError>;

    /// Download several objects into one file: the first in full, the rest
    /// without their header line. Headers are not compared.
    #[instrument(skip(self, remotes), fields(backend = self.backend(), parts = remotes.len()))]
    async fn download_concatenated(
        &self,
        remotes: &[String],
        local: &Path,
    ) -> Result<(), TransferError> {
        let dir = local
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut parts: Vec<PathBuf> = Vec::with_capacity(remotes.len());
        let mut result = Ok(());
        for remote in remotes {
            let part = files::unique_path(&dir, "part", "csv");
            if let Err(e) = self.download(remote, &part).await {
                result = Err(e);
                break;
            }
            parts.push(part);
        }

        if result.is_ok() {
            result = files::concat_files(&parts, local).map_err(|e| TransferError::LocalFile {
                path: local.display().to_string(),
                reason: e.to_string(),
            });
        }

        for part in &parts {
            if let Err(e) = files::remove_file(part) {
                warn!(error = %e, part = %part.display(), "Failed to remove downloaded part");
            }
        }

        if result.is_ok() {
            info!(local = %local.display(), "Download and merge done");
        }
        result
    }

    /// Delete every object, collecting failures instead of stopping
    #[instrument(skip(self, remotes), fields(backend = self.backend(), count = remotes.len()))]
    async fn delete_many(&self, remotes: &[String]) -> CleanupReport {
        let mut report = CleanupReport::new();
        for remote in remotes {
            let result = self.delete_one(remote).await;
            report.record(format!("remote:{}", remote), result);
        }
        report
    }
}

/// Read the next block of up to `size` bytes; empty at end of file
pub(crate) async fn read_block(
    file: &mut tokio::fs::File,
    size: usize,
) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut block = Vec::with_capacity(size);
    let mut limited = file.take(size as u64);
    limited.read_to_end(&mut block).await?;
    Ok(block)
}

#[cfg(test)]
pub(crate) mod testing;

pub(crate) fn local_error(path: &Path, e: impl std::fmt::Display) -> TransferError {
    TransferError::LocalFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn test_download_concatenated_drops_later_headers() {
        let store = MemoryStore::with(&[
            ("out/p0.csv", "id,name\n1,a\n"),
            ("out/p1.csv", "id,name\n2,b\n3,c\n"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("all.csv");

        let names = store.list("out/").await.unwrap();
        store.download_concatenated(&names, &local).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&local).unwrap(),
            "id,name\n1,a\n2,b\n3,c\n"
        );
        // Only the merged file is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_concatenated_ignores_mismatched_headers() {
        let store = MemoryStore::with(&[("a.csv", "id,name\n1,a\n"), ("b.csv", "x,y,z\n2,b,c\n")]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("all.csv");

        store
            .download_concatenated(&["a.csv".to_string(), "b.csv".to_string()], &local)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&local).unwrap(), "id,name\n1,a\n2,b,c\n");
    }

    #[tokio::test]
    async fn test_download_concatenated_missing_part_cleans_up() {
        let store = MemoryStore::with(&[("a.csv", "id\n1\n")]);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("all.csv");

        let err = store
            .download_concatenated(&["a.csv".to_string(), "missing.csv".to_string()], &local)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::DownloadFailed { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_delete_many_collects_failures() {
        let store = MemoryStore::with(&[("a.csv", "x"), ("c.csv", "z")]);
        let remotes = vec!["a.csv".to_string(), "b.csv".to_string(), "c.csv".to_string()];

        let report = store.delete_many(&remotes).await;

        assert_eq!(report.removed, vec!["remote:a.csv", "remote:c.csv"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].artifact, "remote:b.csv");
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_block_splits_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"abcdefghij").unwrap();

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        let mut blocks = Vec::new();
        loop {
            let block = read_block(&mut file, 4).await.unwrap();
            if block.is_empty() {
                break;
            }
            blocks.push(block);
        }

        assert_eq!(blocks, vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]);
    }
}
