//! Chunked parallel range downloader with crash-safe resume
//!
//! The target file is created at full size up front so every chunk can be
//! written at its absolute offset; chunks may complete in any order and the
//! result is byte-identical. Each finished chunk is recorded in the resume
//! sidecar, so a crash costs at most the chunks in flight.

use crate::model::error::{TransferError, TransferResult};
use crate::model::progress::{report_progress, ProgressSender};
use crate::services::blob_client::BlobClient;
use crate::services::resume::{self, DownloadResumeState};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Parameters of one chunked download
#[derive(Clone)]
pub struct ChunkedDownloadParams {
    pub remote_path: String,
    /// Destination file; for encrypted objects this is the ciphertext temp
    pub local_path: PathBuf,
    pub total_size: u64,
    pub chunk_size: u64,
    pub worker_count: usize,
    pub progress: Option<ProgressSender>,
}

impl ChunkedDownloadParams {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>, total_size: u64) -> Self {
        ChunkedDownloadParams {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            total_size,
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            progress: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
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

fn total_chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

fn missing_chunks(total_chunks: u64, completed: &BTreeSet<u64>) -> VecDeque<u64> {
    (0..total_chunks).filter(|i| !completed.contains(i)).collect()
}

/// Load and validate resume state, returning the completed-chunk set.
/// Any rejection discards the sidecar and starts over.
fn restore_completed_chunks(
    params: &ChunkedDownloadParams,
    properties: &crate::model::storage::BlobProperties,
) -> (BTreeSet<u64>, Option<u64>) {
    let state = match resume::load_download_state(&params.local_path) {
        Ok(Some(state)) => state,
        Ok(None) => return (BTreeSet::new(), None),
        Err(e) => {
            tracing::warn!("failed to read download resume state: {}", e);
            return (BTreeSet::new(), None);
        }
    };

    if state.chunk_size != Some(params.chunk_size) {
        tracing::info!("resume state used a different chunk size, starting over");
        let _ = resume::delete_download_state(&params.local_path);
        return (BTreeSet::new(), None);
    }
    if let Err(e) = resume::validate_download_state(&state, &params.local_path, properties) {
        tracing::info!("discarding download resume state: {}", e);
        let _ = resume::delete_download_state(&params.local_path);
        return (BTreeSet::new(), None);
    }

    let completed: BTreeSet<u64> = state
        .completed_chunks
        .unwrap_or_default()
        .into_iter()
        .collect();
    tracing::info!(
        "resuming download of {} with {}/{} chunks done",
        params.remote_path,
        completed.len(),
        total_chunk_count(params.total_size, params.chunk_size)
    );
    (completed, Some(state.created_at))
}

fn fresh_state(
    params: &ChunkedDownloadParams,
    etag: &str,
    storage_type: crate::model::storage::StorageKind,
    completed: &BTreeSet<u64>,
    created_at: Option<u64>,
) -> DownloadResumeState {
    let now = resume::current_timestamp();
    DownloadResumeState {
        local_path: params.local_path.display().to_string(),
        encrypted_path: params.local_path.display().to_string(),
        remote_path: params.remote_path.clone(),
        file_id: String::new(),
        total_size: params.total_size,
        downloaded_bytes: 0,
        etag: etag.to_string(),
        // age is bounded by the first attempt, not the latest restart
        created_at: created_at.unwrap_or(now),
        last_update: now,
        storage_type,
        chunk_size: Some(params.chunk_size),
        completed_chunks: Some(completed.iter().copied().collect()),
    }
}

/// Download `remote_path` into `local_path` with parallel ranged reads.
///
/// On error the resume sidecar stays on disk; on success it is removed and
/// the file is fsynced before returning.
pub async fn download_chunked(
    client: Arc<BlobClient>,
    params: ChunkedDownloadParams,
    cancel: &CancellationToken,
) -> TransferResult<()> {
    if params.chunk_size == 0 || params.worker_count == 0 {
        return Err(TransferError::Fatal(
            "chunk size and worker count must be positive".to_string(),
        ));
    }

    let properties = client.get_properties(cancel, &params.remote_path).await?;
    if properties.content_length != params.total_size {
        return Err(TransferError::Fatal(format!(
            "remote size {} does not match expected {}",
            properties.content_length, params.total_size
        )));
    }

    let (mut completed, resumed_created_at) = restore_completed_chunks(&params, &properties);
    let total_chunks = total_chunk_count(params.total_size, params.chunk_size);

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&params.local_path)
        .await?;
    file.set_len(params.total_size).await?;

    let mut missing = missing_chunks(total_chunks, &completed);
    if missing.is_empty() {
        let on_disk = file.metadata().await?.len();
        if on_disk == params.total_size {
            resume::delete_download_state(&params.local_path)?;
            report_progress(
                &params.progress,
                &params.remote_path,
                params.total_size,
                params.total_size,
            );
            return Ok(());
        }
        // completed set lies about the file; replan from zero
        tracing::warn!(
            "resume state claims completion but file has {} of {} bytes, re-downloading",
            on_disk,
            params.total_size
        );
        completed.clear();
        missing = missing_chunks(total_chunks, &completed);
    }

    let mut state = fresh_state(
        &params,
        &properties.etag,
        client.descriptor().kind,
        &completed,
        resumed_created_at,
    );
    let already_done: u64 = completed
        .iter()
        .map(|&i| chunk_len(i, params.chunk_size, params.total_size))
        .sum();
    state.downloaded_bytes = already_done;
    resume::save_download_state(&state)?;

    let worker_count = params.worker_count.min(missing.len());
    let queue = Arc::new(Mutex::new(missing));
    let file = Arc::new(Mutex::new(file));
    let state = Arc::new(Mutex::new(state));
    let downloaded = Arc::new(AtomicU64::new(already_done));
    let first_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));

    let mut workers = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let client = Arc::clone(&client);
        let queue = Arc::clone(&queue);
        let file = Arc::clone(&file);
        let state = Arc::clone(&state);
        let downloaded = Arc::clone(&downloaded);
        let first_error = Arc::clone(&first_error);
        let cancel = cancel.clone();
        let remote = params.remote_path.clone();
        let progress = params.progress.clone();
        let chunk_size = params.chunk_size;
        let total_size = params.total_size;

        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let index = match queue.lock().await.pop_front() {
                    Some(index) => index,
                    None => return,
                };
                let offset = index * chunk_size;
                let length = chunk_len(index, chunk_size, total_size);

                let result = fetch_and_store(
                    &client, &cancel, &remote, offset, length, &file,
                )
                .await;
                if let Err(e) = result {
                    tracing::error!(
                        "download worker {} failed on chunk {}: {}",
                        worker,
                        index,
                        e
                    );
                    let mut slot = first_error.lock().await;
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    return;
                }

                let done = downloaded.fetch_add(length, Ordering::SeqCst) + length;
                report_progress(&progress, &remote, done, total_size);

                let mut state = state.lock().await;
                if let Some(chunks) = state.completed_chunks.as_mut() {
                    chunks.push(index);
                    chunks.sort_unstable();
                }
                state.downloaded_bytes = done;
                state.last_update = resume::current_timestamp();
                if let Err(e) = resume::save_download_state(&state) {
                    tracing::warn!("failed to persist download progress: {}", e);
                }
            }
        }));
    }

    for handle in workers {
        let _ = handle.await;
    }

    if let Some(err) = first_error.lock().await.take() {
        // resume state stays on disk for the next run
        return Err(err);
    }
    if cancel.is_cancelled() && !queue.lock().await.is_empty() {
        return Err(TransferError::Cancelled);
    }

    {
        let file = file.lock().await;
        file.sync_all().await?;
    }
    resume::delete_download_state(&params.local_path)?;
    report_progress(
        &params.progress,
        &params.remote_path,
        params.total_size,
        params.total_size,
    );
    tracing::info!(
        "downloaded {} ({} bytes, {} chunks)",
        params.remote_path,
        params.total_size,
        total_chunks
    );
    Ok(())
}

fn chunk_len(index: u64, chunk_size: u64, total_size: u64) -> u64 {
    let offset = index * chunk_size;
    chunk_size.min(total_size.saturating_sub(offset))
}

async fn fetch_and_store(
    client: &BlobClient,
    cancel: &CancellationToken,
    remote: &str,
    offset: u64,
    length: u64,
    file: &Mutex<tokio::fs::File>,
) -> TransferResult<()> {
    let data = client.download_range(cancel, remote, offset, length).await?;
    if data.len() as u64 != length {
        return Err(TransferError::Transient(format!(
            "short read at offset {}: {} of {} bytes",
            offset,
            data.len(),
            length
        )));
    }
    let mut file = file.lock().await;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(&data).await?;
    Ok(())
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

    fn test_client(backend: Arc<InMemoryBackend>) -> Arc<BlobClient> {
        let descriptor = StorageDescriptor::new(StorageKind::AzureStorage, "acct", None);
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
        Arc::new(BlobClient::with_backend(descriptor, backend, source).unwrap())
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_plan() {
        assert_eq!(total_chunk_count(1024, 256), 4);
        assert_eq!(total_chunk_count(1025, 256), 5);
        assert_eq!(total_chunk_count(1, 256), 1);

        let completed: BTreeSet<u64> = [0, 2].into_iter().collect();
        assert_eq!(missing_chunks(4, &completed), VecDeque::from(vec![1, 3]));
    }

    #[test]
    fn test_chunk_len_clamps_final_chunk() {
        assert_eq!(chunk_len(0, 256, 1000), 256);
        assert_eq!(chunk_len(3, 256, 1000), 232);
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let backend = Arc::new(InMemoryBackend::new());
        let data = payload(100_000);
        backend.put_object("obj", data.clone(), Default::default());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.encrypted");
        let client = test_client(backend);
        let cancel = CancellationToken::new();

        let params = ChunkedDownloadParams::new("obj", &local, data.len() as u64)
            .with_chunk_size(16 * 1024)
            .with_worker_count(4);
        download_chunked(client, params, &cancel).await.unwrap();

        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert!(resume::load_download_state(&local).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_chunk_preserves_state_and_resume_fetches_only_missing() {
        let backend = Arc::new(InMemoryBackend::new());
        let data = payload(64 * 1024);
        backend.put_object("obj", data.clone(), Default::default());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.encrypted");
        let client = test_client(backend.clone());
        let cancel = CancellationToken::new();

        // the final chunk dies with a client error; the first seven finish
        backend.fail_next(
            "download_range obj 57344",
            TransferError::from_http_status(400, "injected"),
        );
        let params = ChunkedDownloadParams::new("obj", &local, data.len() as u64)
            .with_chunk_size(8 * 1024)
            .with_worker_count(1);
        let err = download_chunked(client.clone(), params.clone(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));

        let state = resume::load_download_state(&local).unwrap().unwrap();
        let done = state.completed_chunks.clone().unwrap_or_default().len();
        assert_eq!(done, 7);

        let ranges_before = backend.operation_count("download_range");
        download_chunked(client, params, &cancel).await.unwrap();
        let ranges_after = backend.operation_count("download_range");

        // only the one missing chunk was fetched on resume
        assert_eq!(ranges_after - ranges_before, 1);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn test_remote_change_discards_resume_state() {
        let backend = Arc::new(InMemoryBackend::new());
        let data = payload(32 * 1024);
        backend.put_object("obj", data.clone(), Default::default());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.encrypted");

        // sidecar from a previous object generation
        let stale = DownloadResumeState {
            local_path: local.display().to_string(),
            encrypted_path: local.display().to_string(),
            remote_path: "obj".to_string(),
            file_id: String::new(),
            total_size: data.len() as u64,
            downloaded_bytes: 8 * 1024,
            etag: "\"stale\"".to_string(),
            created_at: resume::current_timestamp(),
            last_update: resume::current_timestamp(),
            storage_type: StorageKind::AzureStorage,
            chunk_size: Some(8 * 1024),
            completed_chunks: Some(vec![0]),
        };
        resume::save_download_state(&stale).unwrap();

        let client = test_client(backend.clone());
        let cancel = CancellationToken::new();
        let params = ChunkedDownloadParams::new("obj", &local, data.len() as u64)
            .with_chunk_size(8 * 1024)
            .with_worker_count(2);
        download_chunked(client, params, &cancel).await.unwrap();

        // all four chunks were fetched; the stale state did not mask any
        assert_eq!(backend.operation_count("download_range"), 4);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_state() {
        let backend = Arc::new(InMemoryBackend::new());
        let data = payload(32 * 1024);
        backend.put_object("obj", data, Default::default());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.encrypted");
        let client = test_client(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let params = ChunkedDownloadParams::new("obj", &local, 32 * 1024).with_chunk_size(8 * 1024);
        let err = download_chunked(client, params, &cancel).await.unwrap_err();
        assert_eq!(err, TransferError::Cancelled);
    }
}
