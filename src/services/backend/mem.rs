//! In-memory back end used by the hermetic test suites
//!
//! Behaves like a block-blob store and can be scripted to fail specific
//! operations, which is how credential-expiry and mid-body network failures
//! are exercised without a real service.

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{BlobProperties, StorageMetadata};
use crate::services::backend::{BlobBackend, ByteStream};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct CommittedObject {
    data: Bytes,
    etag: String,
    metadata: StorageMetadata,
}

#[derive(Default)]
struct StagedUpload {
    metadata: StorageMetadata,
    /// Blocks in staging order; re-staging an id replaces in place
    blocks: Vec<(String, Bytes)>,
}

/// Scripted failure: consumed by the next operation whose name starts with
/// the given prefix
struct PlannedFailure {
    operation_prefix: String,
    error: TransferError,
}

#[derive(Default)]
pub struct InMemoryBackend {
    objects: Mutex<HashMap<String, CommittedObject>>,
    staged: Mutex<HashMap<String, StagedUpload>>,
    failures: Mutex<VecDeque<PlannedFailure>>,
    operations: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next matching operation to fail with `error`. Prefixes
    /// match operation names: "get_properties", "download_range",
    /// "stage_block", "commit_block_list", "uncommitted_block_list",
    /// "create_block_upload".
    pub fn fail_next(&self, operation_prefix: &str, error: TransferError) {
        self.failures.lock().unwrap().push_back(PlannedFailure {
            operation_prefix: operation_prefix.to_string(),
            error,
        });
    }

    /// Seed a committed object, optionally with metadata
    pub fn put_object(&self, remote: &str, data: Vec<u8>, metadata: StorageMetadata) {
        let etag = etag_of(&data);
        self.objects.lock().unwrap().insert(
            remote.to_string(),
            CommittedObject {
                data: Bytes::from(data),
                etag,
                metadata,
            },
        );
    }

    /// Bytes of a committed object
    pub fn committed(&self, remote: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(remote)
            .map(|o| o.data.to_vec())
    }

    /// Metadata of a committed object
    pub fn committed_metadata(&self, remote: &str) -> Option<StorageMetadata> {
        self.objects
            .lock()
            .unwrap()
            .get(remote)
            .map(|o| o.metadata.clone())
    }

    /// Names of operations performed, in order
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    /// How many times `operation` ran
    pub fn operation_count(&self, operation: &str) -> usize {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.starts_with(operation))
            .count()
    }

    fn enter(&self, operation: &str) -> TransferResult<()> {
        self.operations.lock().unwrap().push(operation.to_string());
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures
            .iter()
            .position(|f| operation.starts_with(&f.operation_prefix))
        {
            let planned = failures.remove(pos).expect("position is valid");
            return Err(planned.error);
        }
        Ok(())
    }
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("\"{:x}\"", digest)
}

#[async_trait::async_trait]
impl BlobBackend for InMemoryBackend {
    async fn get_properties(&self, remote: &str) -> TransferResult<BlobProperties> {
        self.enter(&format!("get_properties {}", remote))?;
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(remote)
            .ok_or_else(|| TransferError::from_http_status(404, format!("{} not found", remote)))?;
        Ok(BlobProperties {
            content_length: object.data.len() as u64,
            etag: object.etag.clone(),
            metadata: object.metadata.clone(),
        })
    }

    async fn download_range(
        &self,
        remote: &str,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<ByteStream> {
        self.enter(&format!("download_range {} {}", remote, offset))?;
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(remote)
            .ok_or_else(|| TransferError::from_http_status(404, format!("{} not found", remote)))?;
        let len = object.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = count
            .map(|c| (offset + c).min(len))
            .unwrap_or(len) as usize;
        let slice = object.data.slice(start..end);

        let chunks: Vec<std::io::Result<Bytes>> = slice
            .chunks(STREAM_CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn create_block_upload(
        &self,
        remote: &str,
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        self.enter(&format!("create_block_upload {}", remote))?;
        let mut staged = self.staged.lock().unwrap();
        let upload = staged.entry(remote.to_string()).or_default();
        upload.metadata = metadata.clone();
        Ok(())
    }

    async fn stage_block(&self, remote: &str, block_id: &str, data: Bytes) -> TransferResult<()> {
        self.enter(&format!("stage_block {} {}", remote, block_id))?;
        let mut staged = self.staged.lock().unwrap();
        let upload = staged.entry(remote.to_string()).or_default();
        if let Some(existing) = upload.blocks.iter_mut().find(|(id, _)| id == block_id) {
            existing.1 = data;
        } else {
            upload.blocks.push((block_id.to_string(), data));
        }
        Ok(())
    }

    async fn commit_block_list(
        &self,
        remote: &str,
        block_ids: &[String],
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        self.enter(&format!("commit_block_list {}", remote))?;
        let mut staged = self.staged.lock().unwrap();
        let upload = staged.get(remote).ok_or_else(|| {
            TransferError::from_http_status(400, format!("no staged blocks for {}", remote))
        })?;

        let mut data = Vec::new();
        for id in block_ids {
            let block = upload
                .blocks
                .iter()
                .find(|(staged_id, _)| staged_id == id)
                .ok_or_else(|| {
                    TransferError::from_http_status(400, format!("block {} was never staged", id))
                })?;
            data.extend_from_slice(&block.1);
        }
        staged.remove(remote);

        let etag = etag_of(&data);
        self.objects.lock().unwrap().insert(
            remote.to_string(),
            CommittedObject {
                data: Bytes::from(data),
                etag,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn uncommitted_block_list(&self, remote: &str) -> TransferResult<Vec<String>> {
        self.enter(&format!("uncommitted_block_list {}", remote))?;
        let staged = self.staged.lock().unwrap();
        Ok(staged
            .get(remote)
            .map(|u| u.blocks.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::{block_id_for_index, collect_stream};

    #[tokio::test]
    async fn test_stage_and_commit_roundtrip() {
        let backend = InMemoryBackend::new();
        backend
            .create_block_upload("obj", &StorageMetadata::new())
            .await
            .unwrap();
        let ids = [block_id_for_index(0), block_id_for_index(1)];
        backend
            .stage_block("obj", &ids[0], Bytes::from_static(b"hello "))
            .await
            .unwrap();
        backend
            .stage_block("obj", &ids[1], Bytes::from_static(b"world"))
            .await
            .unwrap();
        backend
            .commit_block_list("obj", &ids, &StorageMetadata::from([("k", "v")]))
            .await
            .unwrap();

        assert_eq!(backend.committed("obj").unwrap(), b"hello world");
        assert_eq!(
            backend.committed_metadata("obj").unwrap().get("k"),
            Some("v")
        );
    }

    #[tokio::test]
    async fn test_restaging_replaces_block() {
        let backend = InMemoryBackend::new();
        let id = block_id_for_index(0);
        backend
            .stage_block("obj", &id, Bytes::from_static(b"bad"))
            .await
            .unwrap();
        backend
            .stage_block("obj", &id, Bytes::from_static(b"good"))
            .await
            .unwrap();
        backend
            .commit_block_list("obj", &[id], &StorageMetadata::new())
            .await
            .unwrap();
        assert_eq!(backend.committed("obj").unwrap(), b"good");
    }

    #[tokio::test]
    async fn test_ranged_download() {
        let backend = InMemoryBackend::new();
        backend.put_object("obj", (0u8..100).collect(), StorageMetadata::new());
        let stream = backend.download_range("obj", 10, Some(5)).await.unwrap();
        assert_eq!(collect_stream(stream).await.unwrap(), vec![10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let backend = InMemoryBackend::new();
        backend.put_object("obj", vec![1, 2, 3], StorageMetadata::new());
        backend.fail_next(
            "get_properties",
            TransferError::Transient("HTTP 503: server busy".into()),
        );

        assert!(backend.get_properties("obj").await.is_err());
        assert!(backend.get_properties("obj").await.is_ok());
    }

    #[tokio::test]
    async fn test_commit_rejects_unstaged_block() {
        let backend = InMemoryBackend::new();
        let err = backend
            .commit_block_list("obj", &[block_id_for_index(0)], &StorageMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));
    }
}
