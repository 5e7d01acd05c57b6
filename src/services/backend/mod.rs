//! Storage back-end capability trait and its implementations
//!
//! The engine is parametric over this small capability set; everything above
//! it (retries, credential rotation, resume, encryption) is back-end
//! agnostic. [`azure::AzureBlobBackend`] talks block-blob REST through a
//! signed URL, [`s3::S3Backend`] maps the same capabilities onto multipart
//! uploads, and [`mem::InMemoryBackend`] backs the hermetic tests.

pub mod azure;
pub mod mem;
pub mod s3;

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{BlobProperties, StorageMetadata};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;

/// Body of a ranged download
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

/// Capabilities the engine needs from a storage back end
#[async_trait::async_trait]
pub trait BlobBackend: Send + Sync {
    /// HEAD the object: length, strong validator, metadata
    async fn get_properties(&self, remote: &str) -> TransferResult<BlobProperties>;

    /// Stream `count` bytes starting at `offset`; `None` reads to the end
    async fn download_range(
        &self,
        remote: &str,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<ByteStream>;

    /// Prepare the object for block staging. Metadata is supplied up front
    /// for back ends that bind it at creation time.
    async fn create_block_upload(
        &self,
        remote: &str,
        metadata: &StorageMetadata,
    ) -> TransferResult<()>;

    /// Stage one block under a caller-chosen identifier. Re-staging the same
    /// identifier replaces the block, which is what makes retries safe.
    async fn stage_block(&self, remote: &str, block_id: &str, data: Bytes) -> TransferResult<()>;

    /// Commit the ordered block list, making the object visible
    async fn commit_block_list(
        &self,
        remote: &str,
        block_ids: &[String],
        metadata: &StorageMetadata,
    ) -> TransferResult<()>;

    /// Identifiers of blocks staged but not yet committed, in staging order
    async fn uncommitted_block_list(&self, remote: &str) -> TransferResult<Vec<String>>;
}

/// Deterministic identifier for block `index`: base64 of `block-<010d>`.
///
/// Determinism is what lets a retried stage replace its own block and keeps
/// the committed list stable across partial failures.
pub fn block_id_for_index(index: u64) -> String {
    BASE64.encode(format!("block-{:010}", index))
}

/// Recover the block index from an identifier produced by
/// [`block_id_for_index`]
pub fn block_index_from_id(block_id: &str) -> Option<u64> {
    let decoded = BASE64.decode(block_id).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    text.strip_prefix("block-")?.parse::<u64>().ok()
}

/// Drain a download stream into memory.
///
/// Used for chunk-sized ranges where the request, the body read, and the
/// close must fail or succeed as one unit.
pub async fn collect_stream(mut stream: ByteStream) -> TransferResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransferError::from)?;
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_layout() {
        assert_eq!(block_id_for_index(0), BASE64.encode("block-0000000000"));
        assert_eq!(block_id_for_index(16), BASE64.encode("block-0000000016"));
    }

    #[test]
    fn test_block_id_roundtrip() {
        for index in [0u64, 1, 9, 42, 9_999_999_999] {
            assert_eq!(block_index_from_id(&block_id_for_index(index)), Some(index));
        }
    }

    #[test]
    fn test_block_id_is_deterministic() {
        assert_eq!(block_id_for_index(7), block_id_for_index(7));
    }

    #[test]
    fn test_block_index_rejects_foreign_ids() {
        assert_eq!(block_index_from_id("not-base64!"), None);
        assert_eq!(block_index_from_id(&BASE64.encode("part-0000000001")), None);
    }

    #[tokio::test]
    async fn test_collect_stream_concatenates_chunks() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        assert_eq!(collect_stream(stream).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_collect_stream_surfaces_mid_body_errors() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
        ];
        let stream: ByteStream = Box::pin(futures::stream::iter(chunks));
        let err = collect_stream(stream).await.unwrap_err();
        assert!(crate::model::error::is_network_error(&err));
    }
}
