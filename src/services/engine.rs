//! Library entry points for encrypted uploads and downloads
//!
//! The engine owns the glue: advisory locks and periodic refresh around a
//! transfer, format detection, and the decrypt step after a download.
//! Decryption keys come from the caller (the control plane stores them);
//! the engine only ever persists key material inside the 0600 resume
//! sidecar of an unfinished upload.

use crate::model::error::{TransferError, TransferResult};
use crate::model::format::{self, ObjectFormat, CIPHER_BLOCK_SIZE, META_IV, META_STREAMING_FORMAT, STREAMING_FORMAT_CBC};
use crate::model::progress::ProgressSender;
use crate::model::storage::{BlobProperties, StorageMetadata};
use crate::services::backend::block_id_for_index;
use crate::services::blob_client::{BlobClient, LARGE_FILE_THRESHOLD};
use crate::services::cipher::{self, StreamingDecryptionState, StreamingEncryptionState, IV_LEN};
use crate::services::downloader::{download_chunked, ChunkedDownloadParams};
use crate::services::resume;
use crate::services::uploader::{
    upload_streaming, StreamingUploadOutcome, StreamingUploadParams,
};
use crate::utils::random_suffix;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Unit of the local decrypt pass; any cipher-block multiple works
const DECRYPT_CHUNK: usize = 4 * 1024 * 1024;

/// Parameters for uploading one local file
#[derive(Clone, Default)]
pub struct UploadFileParams {
    pub local_path: PathBuf,
    /// Remote file name; defaults to the local file name
    pub file_name: Option<String>,
    pub part_size: Option<u64>,
    pub worker_count: Option<usize>,
    pub progress: Option<ProgressSender>,
}

/// Parameters for downloading one remote object
#[derive(Clone, Default)]
pub struct DownloadFileParams {
    pub remote_path: String,
    /// Plaintext destination
    pub local_path: PathBuf,
    /// Key material from the object's control-plane record
    pub decryption_key: Vec<u8>,
    pub chunk_size: Option<u64>,
    pub worker_count: Option<usize>,
    pub progress: Option<ProgressSender>,
}

/// High-level transfer engine over one blob client
pub struct TransferEngine {
    client: Arc<BlobClient>,
    worker_count: usize,
}

impl TransferEngine {
    pub fn new(client: Arc<BlobClient>) -> Self {
        TransferEngine {
            client,
            worker_count: 4,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn client(&self) -> &Arc<BlobClient> {
        &self.client
    }

    /// Force a credential rotation now
    pub async fn refresh_credentials(&self) -> TransferResult<()> {
        self.client.ensure_fresh_credentials().await
    }

    /// Ciphertext length of a remote object
    pub async fn get_encrypted_size(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
    ) -> TransferResult<u64> {
        let properties = self.client.get_properties(cancel, remote_path).await?;
        Ok(properties.content_length)
    }

    /// Encryption format of a remote object, from its metadata
    pub async fn detect_format(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
    ) -> TransferResult<ObjectFormat> {
        let properties = self.client.get_properties(cancel, remote_path).await?;
        format::detect_format(&properties)
    }

    /// Encrypt and upload a local file under a fresh suffixed object key.
    ///
    /// Holds the advisory upload lock for the duration; large files get a
    /// periodic credential refresher. The returned key material must be
    /// registered with the control plane or the object is unreadable.
    pub async fn upload_encrypted_file(
        &self,
        cancel: &CancellationToken,
        params: UploadFileParams,
    ) -> TransferResult<StreamingUploadOutcome> {
        let local_path = params.local_path.clone();
        let lock = resume::acquire_upload_lock(&local_path)?;

        let plaintext_size = tokio::fs::metadata(&local_path).await?.len();
        let file_name = match &params.file_name {
            Some(name) => name.clone(),
            None => local_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    TransferError::Fatal(format!(
                        "cannot derive a remote name from {}",
                        local_path.display()
                    ))
                })?
                .to_string(),
        };
        let suffix = random_suffix();
        let object_key = self.client.descriptor().object_key(&file_name, &suffix);

        let mut upload = StreamingUploadParams::new(&local_path, object_key, suffix, plaintext_size)
            .with_worker_count(params.worker_count.unwrap_or(self.worker_count));
        if let Some(part_size) = params.part_size {
            upload = upload.with_part_size(part_size);
        }
        if let Some(progress) = params.progress.clone() {
            upload = upload.with_progress(progress);
        }

        let large = plaintext_size >= LARGE_FILE_THRESHOLD;
        if large {
            self.client.start_periodic_refresh().await;
        }
        let result = upload_streaming(Arc::clone(&self.client), upload, cancel).await;
        if large {
            self.client.stop_periodic_refresh().await;
        }
        if let Err(e) = lock.release() {
            tracing::warn!("failed to release upload lock: {}", e);
        }
        result
    }

    /// Download and decrypt a remote object to `local_path`.
    ///
    /// The ciphertext lands in a `.encrypted` temp next to the target and
    /// is decrypted according to the object's format. A failed decrypt
    /// keeps the temp so the next attempt skips the network entirely.
    pub async fn download_encrypted_file(
        &self,
        cancel: &CancellationToken,
        params: DownloadFileParams,
    ) -> TransferResult<()> {
        let properties = self.client.get_properties(cancel, &params.remote_path).await?;
        let object_format = format::detect_format(&properties)?;

        let large = properties.content_length >= LARGE_FILE_THRESHOLD;
        if large {
            self.client.start_periodic_refresh().await;
        }
        let result = self
            .download_and_decrypt(cancel, &params, &properties, object_format)
            .await;
        if large {
            self.client.stop_periodic_refresh().await;
        }
        result
    }

    async fn download_and_decrypt(
        &self,
        cancel: &CancellationToken,
        params: &DownloadFileParams,
        properties: &BlobProperties,
        object_format: ObjectFormat,
    ) -> TransferResult<()> {
        let encrypted_path = resume::encrypted_temp_path(&params.local_path);

        // A complete ciphertext with no resume sidecar is the leftover of a
        // failed decrypt; reuse it instead of fetching the object again
        let have_complete_ciphertext = match tokio::fs::metadata(&encrypted_path).await {
            Ok(meta) => {
                meta.len() == properties.content_length
                    && resume::load_download_state(&encrypted_path)?.is_none()
            }
            Err(_) => false,
        };
        if have_complete_ciphertext {
            tracing::info!(
                "reusing previously downloaded ciphertext at {}",
                encrypted_path.display()
            );
        }

        let mut download = ChunkedDownloadParams::new(
            &params.remote_path,
            &encrypted_path,
            properties.content_length,
        )
        .with_worker_count(params.worker_count.unwrap_or(self.worker_count));
        if let Some(chunk_size) = params.chunk_size {
            download = download.with_chunk_size(chunk_size);
        }
        if let Some(progress) = params.progress.clone() {
            download = download.with_progress(progress);
        }
        if !have_complete_ciphertext {
            download_chunked(Arc::clone(&self.client), download, cancel).await?;
        }

        // From here on the ciphertext is complete; decryption failures must
        // leave the temp file so a retry does not re-download
        let written = match &object_format {
            ObjectFormat::Legacy { iv } | ObjectFormat::CbcStreaming { initial_iv: iv } => {
                decrypt_file_cbc(
                    &params.decryption_key,
                    iv,
                    &encrypted_path,
                    &params.local_path,
                )
                .await?
            }
            ObjectFormat::HkdfStreaming { file_id, part_size } => {
                decrypt_file_hkdf(
                    &params.decryption_key,
                    file_id,
                    *part_size,
                    &encrypted_path,
                    &params.local_path,
                )
                .await?
            }
        };

        if let Err(e) = tokio::fs::remove_file(&encrypted_path).await {
            tracing::warn!("failed to remove encrypted temp file: {}", e);
        }
        tracing::info!(
            "downloaded {} to {} ({} plaintext bytes)",
            params.remote_path,
            params.local_path.display(),
            written
        );
        Ok(())
    }

    /// Sequentially stream and decrypt a CBC-format object straight to the
    /// destination, no temp file and no resume. Fits pipes and small files.
    pub async fn download_streaming(
        &self,
        cancel: &CancellationToken,
        params: DownloadFileParams,
    ) -> TransferResult<()> {
        let properties = self.client.get_properties(cancel, &params.remote_path).await?;
        let iv = match format::detect_format(&properties)? {
            ObjectFormat::Legacy { iv } | ObjectFormat::CbcStreaming { initial_iv: iv } => iv,
            ObjectFormat::HkdfStreaming { .. } => {
                return Err(TransferError::Fatal(
                    "streaming download does not support per-part-key objects".to_string(),
                ))
            }
        };
        let total = properties.content_length;
        if total == 0 || total % CIPHER_BLOCK_SIZE as u64 != 0 {
            return Err(TransferError::Fatal(format!(
                "ciphertext length {} is not a block multiple",
                total
            )));
        }

        let mut stream = self
            .client
            .download_stream(cancel, &params.remote_path, 0, None)
            .await?;
        let mut destination = tokio::fs::File::create(&params.local_path).await?;
        let mut decryptor = StreamingDecryptionState::new(&params.decryption_key, &iv)?;

        let mut buffer: Vec<u8> = Vec::with_capacity(DECRYPT_CHUNK + CIPHER_BLOCK_SIZE);
        let mut received: u64 = 0;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let chunk = chunk.map_err(TransferError::from)?;
            received += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            // keep one block in reserve so the final block is only ever
            // decrypted with padding handling
            while buffer.len() >= DECRYPT_CHUNK + CIPHER_BLOCK_SIZE {
                let plain = decryptor.decrypt_part(&buffer[..DECRYPT_CHUNK], false)?;
                destination.write_all(&plain).await?;
                buffer.drain(..DECRYPT_CHUNK);
            }
        }
        if received != total {
            return Err(TransferError::Transient(format!(
                "stream ended early: {} of {} bytes",
                received, total
            )));
        }
        let plain = decryptor.decrypt_part(&buffer, true)?;
        destination.write_all(&plain).await?;
        destination.sync_all().await?;
        Ok(())
    }

    /// Decrypt an arbitrary plaintext byte range of a CBC-format object.
    ///
    /// CBC random access needs the cipher block preceding the range as its
    /// IV, so the fetch starts one block early unless the range starts at
    /// zero.
    pub async fn download_encrypted_range(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        decryption_key: &[u8],
        offset: u64,
        length: u64,
    ) -> TransferResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let properties = self.client.get_properties(cancel, remote_path).await?;
        let initial_iv = match format::detect_format(&properties)? {
            ObjectFormat::Legacy { iv } | ObjectFormat::CbcStreaming { initial_iv: iv } => iv,
            ObjectFormat::HkdfStreaming { .. } => {
                return Err(TransferError::Fatal(
                    "range reads do not support per-part-key objects".to_string(),
                ))
            }
        };
        let total = properties.content_length;
        let block = CIPHER_BLOCK_SIZE as u64;

        let begin_block = offset / block * block;
        if begin_block >= total {
            return Err(TransferError::Fatal(format!(
                "range offset {} beyond object size {}",
                offset, total
            )));
        }
        let mut end_block = (offset + length).div_ceil(block) * block;
        let covers_end = end_block >= total;
        if covers_end {
            end_block = total;
        }

        let fetch_start = begin_block.saturating_sub(block);
        let data = self
            .client
            .download_range(cancel, remote_path, fetch_start, end_block - fetch_start)
            .await?;

        let (iv, ciphertext): (&[u8], &[u8]) = if begin_block == 0 {
            (&initial_iv, &data[..])
        } else {
            data.split_at(IV_LEN)
        };
        let mut decryptor = StreamingDecryptionState::new(decryption_key, iv)?;
        let plain = decryptor.decrypt_part(ciphertext, covers_end)?;

        let skip = (offset - begin_block) as usize;
        if skip >= plain.len() {
            return Err(TransferError::Fatal(
                "range lies entirely in the padding".to_string(),
            ));
        }
        let end = (skip + length as usize).min(plain.len());
        Ok(plain[skip..end].to_vec())
    }

    /// Begin a caller-driven streaming upload session.
    ///
    /// The file-shaped path is [`TransferEngine::upload_encrypted_file`];
    /// sessions exist for callers that produce data incrementally.
    pub async fn init_streaming_upload(
        &self,
        cancel: &CancellationToken,
        object_key: &str,
        part_size: u64,
    ) -> TransferResult<StreamingUploadSession> {
        let encryptor = StreamingEncryptionState::new(part_size as usize)?;
        let mut metadata = StorageMetadata::new();
        metadata.insert(META_STREAMING_FORMAT, STREAMING_FORMAT_CBC);
        metadata.insert(META_IV, BASE64.encode(encryptor.initial_iv()));
        self.client
            .create_block_upload(cancel, object_key, &metadata)
            .await?;
        Ok(StreamingUploadSession {
            client: Arc::clone(&self.client),
            object_key: object_key.to_string(),
            encryptor,
            staged_ids: Vec::new(),
            metadata,
        })
    }
}

/// In-progress caller-driven streaming upload
pub struct StreamingUploadSession {
    client: Arc<BlobClient>,
    object_key: String,
    encryptor: StreamingEncryptionState,
    staged_ids: Vec<String>,
    metadata: StorageMetadata,
}

impl StreamingUploadSession {
    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn master_key(&self) -> &[u8] {
        self.encryptor.master_key()
    }

    pub fn initial_iv(&self) -> &[u8] {
        self.encryptor.initial_iv()
    }

    /// Encrypt and stage the next part; parts must arrive in order
    pub async fn upload_streaming_part(
        &mut self,
        cancel: &CancellationToken,
        plaintext: &[u8],
        is_final: bool,
    ) -> TransferResult<()> {
        let index = self.encryptor.next_part();
        let ciphertext = self.encryptor.encrypt_part(plaintext, is_final)?;
        let block_id = block_id_for_index(index);
        self.client
            .stage_block(cancel, &self.object_key, &block_id, Bytes::from(ciphertext))
            .await?;
        self.staged_ids.push(block_id);
        Ok(())
    }

    /// Commit the staged parts in encryption order
    pub async fn complete_streaming_upload(
        self,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        if !self.encryptor.is_finalized() {
            return Err(TransferError::Fatal(
                "cannot commit before the final part".to_string(),
            ));
        }
        self.client
            .commit_block_list(cancel, &self.object_key, &self.staged_ids, &self.metadata)
            .await
    }

    /// Walk away from the session. Staged blocks expire on the back end
    /// after its retention window; no remote call is needed.
    pub fn abort_streaming_upload(self) {}
}

/// Whole-file CBC decrypt of `encrypted_path` into `plaintext_path`,
/// covering both the legacy layout and the chained streaming layout
async fn decrypt_file_cbc(
    key: &[u8],
    iv: &[u8],
    encrypted_path: &Path,
    plaintext_path: &Path,
) -> TransferResult<u64> {
    let total = tokio::fs::metadata(encrypted_path).await?.len();
    if total == 0 || total % CIPHER_BLOCK_SIZE as u64 != 0 {
        return Err(TransferError::Fatal(format!(
            "ciphertext length {} is not a block multiple",
            total
        )));
    }
    let mut source = tokio::fs::File::open(encrypted_path).await?;
    let mut destination = tokio::fs::File::create(plaintext_path).await?;
    let mut decryptor = StreamingDecryptionState::new(key, iv)?;

    let mut buffer = vec![0u8; DECRYPT_CHUNK];
    let mut remaining = total;
    let mut written: u64 = 0;
    while remaining > 0 {
        let take = (DECRYPT_CHUNK as u64).min(remaining) as usize;
        source.read_exact(&mut buffer[..take]).await?;
        let is_final = remaining == take as u64;
        let plain = decryptor.decrypt_part(&buffer[..take], is_final)?;
        destination.write_all(&plain).await?;
        written += plain.len() as u64;
        remaining -= take as u64;
    }
    destination.sync_all().await?;
    Ok(written)
}

/// Per-part decrypt of the retired HKDF layout: every part is an IV plus an
/// independently padded ciphertext
async fn decrypt_file_hkdf(
    master_key: &[u8],
    file_id: &[u8],
    part_size: u64,
    encrypted_path: &Path,
    plaintext_path: &Path,
) -> TransferResult<u64> {
    let total = tokio::fs::metadata(encrypted_path).await?.len();
    // full parts carry an IV and a full padding block
    let full_part = part_size + 2 * IV_LEN as u64;
    let mut source = tokio::fs::File::open(encrypted_path).await?;
    let mut destination = tokio::fs::File::create(plaintext_path).await?;

    let mut buffer = vec![0u8; full_part as usize];
    let mut remaining = total;
    let mut index: u64 = 0;
    let mut written: u64 = 0;
    while remaining > 0 {
        let take = full_part.min(remaining) as usize;
        source.read_exact(&mut buffer[..take]).await?;
        let plain = cipher::decrypt_part_hkdf(master_key, file_id, index, &buffer[..take])?;
        destination.write_all(&plain).await?;
        written += plain.len() as u64;
        remaining -= take as u64;
        index += 1;
    }
    destination.sync_all().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::storage::{StorageDescriptor, StorageKind};
    use crate::services::backend::mem::InMemoryBackend;
    use crate::settings::credentials::{
        Credential, CredentialMaterial, CredentialScope, StaticCredentialSource,
    };
    use tempfile::TempDir;

    fn engine_over(backend: Arc<InMemoryBackend>) -> TransferEngine {
        let descriptor =
            StorageDescriptor::new(StorageKind::AzureStorage, "acct", Some("files".to_string()));
        let credential = Credential {
            material: CredentialMaterial::Sas {
                root_url: None,
                signature: "sig=test".to_string(),
                object_signatures: Default::default(),
            },
            scope: CredentialScope::Default,
            expires_at: std::time::SystemTime::now() + std::time::Duration::from_secs(900),
        };
        let source = Arc::new(StaticCredentialSource::new(credential));
        let client = Arc::new(BlobClient::with_backend(descriptor, backend, source).unwrap());
        TransferEngine::new(client)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let source_path = dir.path().join("report.dat");
        let data = payload(150_000);
        std::fs::write(&source_path, &data).unwrap();

        let outcome = engine
            .upload_encrypted_file(
                &cancel,
                UploadFileParams {
                    local_path: source_path.clone(),
                    part_size: Some(16 * 1024),
                    worker_count: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.object_key.starts_with("files/report.dat-"));

        let restored_path = dir.path().join("restored.dat");
        engine
            .download_encrypted_file(
                &cancel,
                DownloadFileParams {
                    remote_path: outcome.object_key.clone(),
                    local_path: restored_path.clone(),
                    decryption_key: outcome.master_key.clone(),
                    chunk_size: Some(8 * 1024),
                    worker_count: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&restored_path).unwrap(), data);
        // ciphertext temp is cleaned up after a successful decrypt
        assert!(!resume::encrypted_temp_path(&restored_path).exists());
    }

    #[tokio::test]
    async fn test_legacy_object_download() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let key = [11u8; 32];
        let iv = [7u8; 16];
        let data = payload(50_001);
        let ciphertext = cipher::encrypt_legacy(&key, &iv, &data).unwrap();
        let metadata = StorageMetadata::from([("iv", BASE64.encode(iv).as_str())]);
        backend.put_object("files/old.bin", ciphertext, metadata);

        let restored = dir.path().join("old.bin");
        engine
            .download_encrypted_file(
                &cancel,
                DownloadFileParams {
                    remote_path: "files/old.bin".to_string(),
                    local_path: restored.clone(),
                    decryption_key: key.to_vec(),
                    chunk_size: Some(8 * 1024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[tokio::test]
    async fn test_hkdf_object_download() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let master = [13u8; 32];
        let file_id = b"legacy-file-id".to_vec();
        let part_size = 4096u64;
        let data = payload(10_000);

        let mut ciphertext = Vec::new();
        for (index, part) in data.chunks(part_size as usize).enumerate() {
            ciphertext
                .extend(cipher::encrypt_part_hkdf(&master, &file_id, index as u64, part).unwrap());
        }
        let metadata = StorageMetadata::from([
            ("formatversion", "1"),
            ("fileid", BASE64.encode(&file_id).as_str()),
            ("partsize", part_size.to_string().as_str()),
        ]);
        backend.put_object("files/hkdf.bin", ciphertext, metadata);

        let restored = dir.path().join("hkdf.bin");
        engine
            .download_encrypted_file(
                &cancel,
                DownloadFileParams {
                    remote_path: "files/hkdf.bin".to_string(),
                    local_path: restored.clone(),
                    decryption_key: master.to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_decrypt_keeps_ciphertext_temp() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let key = [11u8; 32];
        let iv = [7u8; 16];
        let ciphertext = cipher::encrypt_legacy(&key, &iv, &payload(4096)).unwrap();
        let metadata = StorageMetadata::from([("iv", BASE64.encode(iv).as_str())]);
        backend.put_object("files/old.bin", ciphertext, metadata);

        let restored = dir.path().join("old.bin");
        let err = engine
            .download_encrypted_file(
                &cancel,
                DownloadFileParams {
                    remote_path: "files/old.bin".to_string(),
                    local_path: restored.clone(),
                    // wrong key: padding check fails after the download
                    decryption_key: vec![0u8; 32],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));
        assert!(resume::encrypted_temp_path(&restored).exists());

        // retrying with the right key reuses the ciphertext on disk
        let fetched_before = backend.operation_count("download_range");
        engine
            .download_encrypted_file(
                &cancel,
                DownloadFileParams {
                    remote_path: "files/old.bin".to_string(),
                    local_path: restored.clone(),
                    decryption_key: key.to_vec(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(backend.operation_count("download_range"), fetched_before);
        assert!(!resume::encrypted_temp_path(&restored).exists());
    }

    #[tokio::test]
    async fn test_download_streaming_roundtrip() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let source_path = dir.path().join("stream.dat");
        let data = payload(300_000);
        std::fs::write(&source_path, &data).unwrap();
        let outcome = engine
            .upload_encrypted_file(
                &cancel,
                UploadFileParams {
                    local_path: source_path,
                    part_size: Some(32 * 1024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let restored = dir.path().join("stream.out");
        engine
            .download_streaming(
                &cancel,
                DownloadFileParams {
                    remote_path: outcome.object_key.clone(),
                    local_path: restored.clone(),
                    decryption_key: outcome.master_key.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[tokio::test]
    async fn test_encrypted_range_reads() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let source_path = dir.path().join("range.dat");
        let data = payload(64 * 1024);
        std::fs::write(&source_path, &data).unwrap();
        let outcome = engine
            .upload_encrypted_file(
                &cancel,
                UploadFileParams {
                    local_path: source_path,
                    part_size: Some(16 * 1024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for (offset, length) in [(0u64, 100u64), (5, 11), (16, 16), (1000, 4096), (65_500, 36)] {
            let slice = engine
                .download_encrypted_range(
                    &cancel,
                    &outcome.object_key,
                    &outcome.master_key,
                    offset,
                    length,
                )
                .await
                .unwrap();
            let expected =
                &data[offset as usize..((offset + length) as usize).min(data.len())];
            assert_eq!(slice, expected, "range {}+{}", offset, length);
        }
    }

    #[tokio::test]
    async fn test_streaming_session_commit_requires_final_part() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let cancel = CancellationToken::new();

        let mut session = engine
            .init_streaming_upload(&cancel, "files/session.bin", 1024)
            .await
            .unwrap();
        session
            .upload_streaming_part(&cancel, &[1u8; 1024], false)
            .await
            .unwrap();
        let err = session.complete_streaming_upload(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("final part"));
    }

    #[tokio::test]
    async fn test_streaming_session_roundtrip() {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = engine_over(backend.clone());
        let cancel = CancellationToken::new();

        let mut session = engine
            .init_streaming_upload(&cancel, "files/session.bin", 1024)
            .await
            .unwrap();
        let key = session.master_key().to_vec();
        let iv = session.initial_iv().to_vec();
        let data = payload(2500);

        session
            .upload_streaming_part(&cancel, &data[..1024], false)
            .await
            .unwrap();
        session
            .upload_streaming_part(&cancel, &data[1024..2048], false)
            .await
            .unwrap();
        session
            .upload_streaming_part(&cancel, &data[2048..], true)
            .await
            .unwrap();
        session.complete_streaming_upload(&cancel).await.unwrap();

        let committed = backend.committed("files/session.bin").unwrap();
        let mut decryptor = StreamingDecryptionState::new(&key, &iv).unwrap();
        let head = decryptor.decrypt_part(&committed[..2048], false).unwrap();
        let tail = decryptor.decrypt_part(&committed[2048..], true).unwrap();
        assert_eq!([head, tail].concat(), data);
    }
}
