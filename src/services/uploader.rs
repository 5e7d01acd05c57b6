//! Streaming block uploader: encrypt-then-stage with CBC chaining
//!
//! Encryption is strictly sequential because each part's IV is the previous
//! part's last ciphertext block. Staging is not: encrypted parts flow
//! through a bounded queue to a pool of staging workers, so the network
//! runs in parallel while memory stays O(workers × part size). Block
//! identifiers are deterministic, which makes retried stages idempotent and
//! keeps the committed list stable across partial failures.

use crate::model::error::{TransferError, TransferResult};
use crate::model::format::{
    self, CIPHER_BLOCK_SIZE, META_IV, META_STREAMING_FORMAT, STREAMING_FORMAT_CBC,
};
use crate::model::progress::{report_progress, ProgressSender};
use crate::model::storage::StorageMetadata;
use crate::services::backend::block_id_for_index;
use crate::services::blob_client::BlobClient;
use crate::services::cipher::{StreamingEncryptionState, IV_LEN};
use crate::services::resume::{self, UploadResumeState, FORMAT_VERSION_STREAMING};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const MIN_PART_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Block-count ceiling across back ends
pub const MAX_BLOCKS: u64 = 50_000;

/// Pick a part size for a file: roughly one part per worker for moderate
/// files, clamped to the engine bounds, grown to respect the block-count
/// ceiling, and always a cipher-block multiple.
pub fn calculate_part_size(plaintext_size: u64, worker_count: usize) -> u64 {
    let workers = worker_count.max(1) as u64;
    let mut part = (plaintext_size / workers).clamp(MIN_PART_SIZE, MAX_PART_SIZE);

    let blocks = plaintext_size.div_ceil(part.max(1));
    if blocks > MAX_BLOCKS {
        part = plaintext_size.div_ceil(MAX_BLOCKS);
        // round up to the next MiB for saner sizes
        part = part.div_ceil(1024 * 1024) * (1024 * 1024);
    }
    part.div_ceil(CIPHER_BLOCK_SIZE as u64) * CIPHER_BLOCK_SIZE as u64
}

/// Number of parts for a plaintext. A block-aligned file gets one extra
/// part carrying only padding, so the final part always exists and always
/// pads.
pub fn total_part_count(plaintext_size: u64, part_size: u64) -> u64 {
    if plaintext_size % part_size == 0 {
        plaintext_size / part_size + 1
    } else {
        plaintext_size.div_ceil(part_size)
    }
}

/// Result of a committed streaming upload. The caller registers the key
/// material with the control plane; the engine never persists it beyond the
/// resume sidecar.
#[derive(Debug, Clone)]
pub struct StreamingUploadOutcome {
    pub object_key: String,
    pub master_key: Vec<u8>,
    pub initial_iv: Vec<u8>,
    pub encrypted_size: u64,
    pub part_count: u64,
}

/// Parameters of one streaming upload
#[derive(Clone)]
pub struct StreamingUploadParams {
    pub local_path: PathBuf,
    /// Remote key to create; a valid resume sidecar overrides this with the
    /// key of the interrupted upload
    pub object_key: String,
    pub random_suffix: String,
    pub plaintext_size: u64,
    pub part_size: Option<u64>,
    pub worker_count: usize,
    pub progress: Option<ProgressSender>,
}

impl StreamingUploadParams {
    pub fn new(
        local_path: impl Into<PathBuf>,
        object_key: impl Into<String>,
        random_suffix: impl Into<String>,
        plaintext_size: u64,
    ) -> Self {
        StreamingUploadParams {
            local_path: local_path.into(),
            object_key: object_key.into(),
            random_suffix: random_suffix.into(),
            plaintext_size,
            part_size: None,
            worker_count: 4,
            progress: None,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// One encrypted part queued for staging
struct PartJob {
    index: u64,
    block_id: String,
    ciphertext: Bytes,
}

/// Progress bookkeeping shared between the encryptor and staging workers.
///
/// The sidecar only ever claims the contiguous prefix of staged parts:
/// claiming a part that was never staged would poison the eventual commit.
struct UploadTracker {
    state: UploadResumeState,
    /// index → (chain IV after this part, plaintext consumed through it)
    encrypted: BTreeMap<u64, ([u8; IV_LEN], u64)>,
    staged: BTreeSet<u64>,
    persisted_parts: u64,
}

impl UploadTracker {
    fn record_encrypted(&mut self, index: u64, chain_iv: [u8; IV_LEN], consumed_total: u64) {
        self.encrypted.insert(index, (chain_iv, consumed_total));
    }

    /// Mark a part staged and persist any newly contiguous prefix
    fn record_staged(&mut self, index: u64) -> TransferResult<u64> {
        self.staged.insert(index);
        let mut advanced = false;
        while let Some(&(chain_iv, consumed)) = self
            .staged
            .contains(&self.persisted_parts)
            .then(|| self.encrypted.get(&self.persisted_parts))
            .flatten()
        {
            let index = self.persisted_parts;
            self.state.block_ids.push(block_id_for_index(index));
            self.state.iv = Some(BASE64.encode(chain_iv));
            self.state.uploaded_bytes = consumed;
            self.encrypted.remove(&index);
            self.persisted_parts += 1;
            advanced = true;
        }
        if advanced {
            self.state.last_update = resume::current_timestamp();
            resume::save_upload_state(&self.state)?;
        }
        Ok(self.state.uploaded_bytes)
    }
}

fn decode_b64_field(value: &Option<String>, name: &str) -> TransferResult<Vec<u8>> {
    BASE64
        .decode(value.as_deref().unwrap_or(""))
        .map_err(|e| TransferError::Fatal(format!("resume state has invalid {}: {}", name, e)))
}

/// Restore a valid streaming sidecar for this source file, or discard it
fn restore_upload_state(params: &StreamingUploadParams, part_size: u64) -> Option<UploadResumeState> {
    let state = match resume::load_upload_state(&params.local_path) {
        Ok(Some(state)) => state,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("failed to read upload resume state: {}", e);
            return None;
        }
    };
    if state.format_version != FORMAT_VERSION_STREAMING {
        tracing::info!("upload sidecar has a different format version, starting over");
        let _ = resume::delete_upload_state(&params.local_path);
        return None;
    }
    if let Err(e) = resume::validate_upload_state(&state, &params.local_path) {
        tracing::info!("discarding upload resume state: {}", e);
        let _ = resume::delete_upload_state(&params.local_path);
        return None;
    }
    if state.part_size != Some(part_size) {
        tracing::info!("upload sidecar used a different part size, starting over");
        let _ = resume::delete_upload_state(&params.local_path);
        return None;
    }
    tracing::info!(
        "resuming upload of {} to {} at part {}",
        params.local_path.display(),
        state.object_key,
        state.block_ids.len()
    );
    Some(state)
}

/// Encrypt `local_path` and upload it as `object_key`, staging parts in
/// parallel and committing the ordered block list with the format metadata.
///
/// On any error the resume sidecar survives; it is deleted only after the
/// commit succeeds.
pub async fn upload_streaming(
    client: Arc<BlobClient>,
    params: StreamingUploadParams,
    cancel: &CancellationToken,
) -> TransferResult<StreamingUploadOutcome> {
    let part_size = params
        .part_size
        .unwrap_or_else(|| calculate_part_size(params.plaintext_size, params.worker_count));
    if part_size == 0 || part_size % CIPHER_BLOCK_SIZE as u64 != 0 {
        return Err(TransferError::Fatal(format!(
            "part size {} is not a positive cipher-block multiple",
            part_size
        )));
    }
    let total_parts = total_part_count(params.plaintext_size, part_size);
    let encrypted_size = format::encrypted_size(params.plaintext_size);

    let (mut encryptor, state, start_part) = match restore_upload_state(&params, part_size) {
        Some(state) => {
            let master_key = decode_b64_field(&state.master_key, "master key")?;
            let initial_iv = decode_b64_field(&state.file_id_v1, "file id")?;
            let current_iv = decode_b64_field(&state.iv, "chain iv")?;
            let start = state.block_ids.len() as u64;
            let encryptor = StreamingEncryptionState::from_resume(
                &master_key,
                &initial_iv,
                &current_iv,
                part_size as usize,
                start,
            )?;
            (encryptor, state, start)
        }
        None => {
            let encryptor = StreamingEncryptionState::new(part_size as usize)?;
            let now = resume::current_timestamp();
            let state = UploadResumeState {
                local_path: params.local_path.display().to_string(),
                encrypted_path: String::new(),
                object_key: params.object_key.clone(),
                upload_id: String::new(),
                total_size: encrypted_size,
                original_size: params.plaintext_size,
                uploaded_bytes: 0,
                completed_parts: Vec::new(),
                block_ids: Vec::new(),
                encryption_key: None,
                iv: Some(BASE64.encode(encryptor.current_iv())),
                random_suffix: params.random_suffix.clone(),
                created_at: now,
                last_update: now,
                storage_type: client.descriptor().kind,
                format_version: FORMAT_VERSION_STREAMING,
                master_key: Some(BASE64.encode(encryptor.master_key())),
                file_id_v1: Some(BASE64.encode(encryptor.initial_iv())),
                part_size: Some(part_size),
                process_id: std::process::id(),
                lock_acquired_at: now,
            };
            resume::save_upload_state(&state)?;
            (encryptor, state, 0)
        }
    };

    let object_key = state.object_key.clone();
    let master_key = decode_b64_field(&state.master_key, "master key")?;
    let initial_iv = decode_b64_field(&state.file_id_v1, "file id")?;

    let mut metadata = StorageMetadata::new();
    metadata.insert(META_STREAMING_FORMAT, STREAMING_FORMAT_CBC);
    metadata.insert(META_IV, BASE64.encode(&initial_iv));

    client
        .create_block_upload(cancel, &object_key, &metadata)
        .await?;

    let mut source = tokio::fs::File::open(&params.local_path).await?;
    source
        .seek(std::io::SeekFrom::Start(state.uploaded_bytes))
        .await?;

    let tracker = Arc::new(Mutex::new(UploadTracker {
        state,
        encrypted: BTreeMap::new(),
        staged: BTreeSet::new(),
        persisted_parts: start_part,
    }));

    let worker_count = params.worker_count.max(1);
    let (job_tx, job_rx) = mpsc::channel::<PartJob>(worker_count);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let first_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let client = Arc::clone(&client);
        let job_rx = Arc::clone(&job_rx);
        let tracker = Arc::clone(&tracker);
        let first_error = Arc::clone(&first_error);
        let cancel = cancel.clone();
        let object_key = object_key.clone();
        let progress = params.progress.clone();
        let plaintext_size = params.plaintext_size;

        workers.push(tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = job_rx.lock().await;
                    rx.recv().await
                };
                let Some(job) = job else { return };
                if first_error.lock().await.is_some() {
                    return;
                }

                match client
                    .stage_block(&cancel, &object_key, &job.block_id, job.ciphertext)
                    .await
                {
                    Ok(()) => {
                        let staged = {
                            let mut tracker = tracker.lock().await;
                            tracker.record_staged(job.index)
                        };
                        match staged {
                            Ok(uploaded) => {
                                report_progress(&progress, &object_key, uploaded, plaintext_size);
                            }
                            Err(e) => {
                                tracing::warn!("failed to persist upload progress: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("staging part {} failed: {}", job.index, e);
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        return;
                    }
                }
            }
        }));
    }
    // workers hold the only receiver handles; when the last one exits,
    // sends start failing instead of blocking
    drop(job_rx);

    // Sequential encryption loop; stalls on the bounded queue when the
    // network is the bottleneck
    let mut buffer = vec![0u8; part_size as usize];
    let mut encrypt_error: Option<TransferError> = None;
    for index in start_part..total_parts {
        if cancel.is_cancelled() {
            encrypt_error = Some(TransferError::Cancelled);
            break;
        }
        if first_error.lock().await.is_some() {
            break;
        }

        let is_final = index == total_parts - 1;
        let read = match read_part(&mut source, &mut buffer, part_size as usize).await {
            Ok(read) => read,
            Err(e) => {
                encrypt_error = Some(e);
                break;
            }
        };
        let plaintext = &buffer[..read];
        let ciphertext = match encryptor.encrypt_part(plaintext, is_final) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                encrypt_error = Some(e);
                break;
            }
        };

        let consumed_total = (index * part_size + read as u64).min(params.plaintext_size);
        {
            let mut tracker = tracker.lock().await;
            tracker.record_encrypted(index, *encryptor.current_iv(), consumed_total);
        }

        let job = PartJob {
            index,
            block_id: block_id_for_index(index),
            ciphertext: Bytes::from(ciphertext),
        };
        if job_tx.send(job).await.is_err() {
            // all workers exited; their error is in first_error
            break;
        }
    }
    drop(job_tx);

    for handle in workers {
        let _ = handle.await;
    }

    if let Some(e) = first_error.lock().await.take() {
        return Err(e);
    }
    if let Some(e) = encrypt_error {
        return Err(e);
    }

    let all_ids: Vec<String> = (0..total_parts).map(block_id_for_index).collect();
    {
        let tracker = tracker.lock().await;
        if tracker.state.block_ids.len() as u64 != total_parts {
            return Err(TransferError::Fatal(format!(
                "staged {} of {} parts",
                tracker.state.block_ids.len(),
                total_parts
            )));
        }
    }

    client
        .commit_block_list(cancel, &object_key, &all_ids, &metadata)
        .await?;
    resume::delete_upload_state(&params.local_path)?;
    report_progress(
        &params.progress,
        &object_key,
        params.plaintext_size,
        params.plaintext_size,
    );
    tracing::info!(
        "uploaded {} as {} ({} parts, {} encrypted bytes)",
        params.local_path.display(),
        object_key,
        total_parts,
        encrypted_size
    );

    Ok(StreamingUploadOutcome {
        object_key,
        master_key,
        initial_iv,
        encrypted_size,
        part_count: total_parts,
    })
}

/// Abandon an interrupted streaming upload.
///
/// Uncommitted blocks expire on the back end after a retention window
/// longer than the resume age, so only the local sidecar needs removing.
pub async fn abort_streaming_upload(local_path: &Path) -> TransferResult<()> {
    resume::delete_upload_state(local_path)
}

/// Fill up to `want` bytes, tolerating short reads; EOF ends the part
async fn read_part(
    file: &mut tokio::fs::File,
    buffer: &mut Vec<u8>,
    want: usize,
) -> TransferResult<usize> {
    buffer.resize(want, 0);
    let mut total = 0;
    while total < want {
        match file.read(&mut buffer[total..]).await? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}
