// In-memory store for tests of code built on `ObjectStore`

use super::{local_error, ObjectStore};
use crate::errors::TransferError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_deletes: bool,
}

impl MemoryStore {
    pub fn with(objects: &[(&str, &str)]) -> Self {
        let store = Self::default();
        {
            let mut map = store.objects.lock().unwrap();
            for (name, body) in objects {
                map.insert(name.to_string(), body.as_bytes().to_vec());
            }
        }
        store
    }

    /// A store whose deletes always fail
    pub fn failing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::default()
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let data = std::fs::read(local).map_err(|e| local_error(local, e))?;
        self.objects.lock().unwrap().insert(remote.to_string(), data);
        Ok(())
    }

    async fn upload_chunked(
        &self,
        local: &Path,
        remote: &str,
        _chunk_bytes: usize,
    ) -> Result<(), TransferError> {
        self.upload(local, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
            .ok_or_else(|| TransferError::DownloadFailed {
                path: remote.to_string(),
                reason: "not found".to_string(),
            })?;
        std::fs::write(local, data).map_err(|e| local_error(local, e))
    }

    async fn mint_read_url(&self, remote: &str, _expiry: Duration) -> Result<String, TransferError> {
        Ok(format!("memory://{}", remote))
    }

    async fn mint_object_read_url(
        &self,
        remote: &str,
        expiry: Duration,
    ) -> Result<String, TransferError> {
        self.mint_read_url(remote, expiry).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        Ok(self
            .names()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn delete_one(&self, remote: &str) -> Result<(), TransferError> {
        let delete_error = |reason: &str| TransferError::DeleteFailed {
            path: remote.to_string(),
            reason: reason.to_string(),
        };
        if self.fail_deletes {
            return Err(delete_error("permission denied"));
        }
        self.objects
            .lock()
            .unwrap()
            .remove(remote)
            .map(|_| ())
            .ok_or_else(|| delete_error("not found"))
    }
}
