//! Crash-safe resume state for uploads and downloads
//!
//! Every transfer keeps a small JSON sidecar next to the local file
//! (`<local>.download.resume` / `<local>.upload.resume`, mode 0600). Sidecars
//! are written atomically (temp file + rename) so a crash leaves either the
//! previous state or none, never a torn write. An advisory lock file keeps
//! two local processes from uploading the same file at once.

use crate::model::error::{TransferError, TransferResult};
use crate::model::format;
use crate::model::storage::{BlobProperties, StorageKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Resume state older than this is discarded; uncommitted remote parts are
/// only guaranteed to survive this long
pub const MAX_RESUME_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// An upload lock whose holder has not touched it for this long is broken
pub const LOCK_STALE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Suffix of encrypted temp files written next to the download target
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

const DOWNLOAD_SIDECAR_SUFFIX: &str = ".download.resume";
const UPLOAD_SIDECAR_SUFFIX: &str = ".upload.resume";
const UPLOAD_LOCK_SUFFIX: &str = ".upload.lock";

/// Sidecar format version for whole-file pre-encrypted uploads
pub const FORMAT_VERSION_LEGACY: u32 = 0;
/// Sidecar format version for streaming CBC uploads
pub const FORMAT_VERSION_STREAMING: u32 = 1;

/// One completed part of a multipart upload (S3-style back ends)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPartRecord {
    pub part_number: i32,
    pub etag: String,
}

/// State of an interrupted download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResumeState {
    pub local_path: String,
    /// Where the ciphertext lands; older clients recorded the target path here
    pub encrypted_path: String,
    pub remote_path: String,
    #[serde(default)]
    pub file_id: String,
    pub total_size: u64,
    pub downloaded_bytes: u64,
    pub etag: String,
    pub created_at: u64,
    pub last_update: u64,
    pub storage_type: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_chunks: Option<Vec<u64>>,
}

/// State of an interrupted upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResumeState {
    pub local_path: String,
    #[serde(default)]
    pub encrypted_path: String,
    pub object_key: String,
    #[serde(default)]
    pub upload_id: String,
    /// Total encrypted size; zero when unknown until the final part
    pub total_size: u64,
    /// Plaintext size of the source file
    pub original_size: u64,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub completed_parts: Vec<CompletedPartRecord>,
    #[serde(default)]
    pub block_ids: Vec<String>,
    /// Whole-file key, base64 (format version 0 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Format version 0: whole-file IV. Format version 1: current chain IV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub random_suffix: String,
    pub created_at: u64,
    pub last_update: u64,
    pub storage_type: StorageKind,
    pub format_version: u32,
    /// Streaming master key, base64 (format version 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    /// Streaming chain identity: the initial IV, base64 (format version 1)
    #[serde(
        rename = "file_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub file_id_v1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    #[serde(default)]
    pub process_id: u32,
    #[serde(default)]
    pub lock_acquired_at: u64,
}

/// Advisory per-file upload lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLock {
    pub process_id: u32,
    pub acquired_at: u64,
    pub local_path: String,
}

/// Seconds since the epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn sidecar_path(local: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", local.display(), suffix))
}

pub fn download_state_path(local: &Path) -> PathBuf {
    sidecar_path(local, DOWNLOAD_SIDECAR_SUFFIX)
}

pub fn upload_state_path(local: &Path) -> PathBuf {
    sidecar_path(local, UPLOAD_SIDECAR_SUFFIX)
}

pub fn upload_lock_path(local: &Path) -> PathBuf {
    sidecar_path(local, UPLOAD_LOCK_SUFFIX)
}

/// Default encrypted-temp path for a download target
pub fn encrypted_temp_path(local: &Path) -> PathBuf {
    sidecar_path(local, ENCRYPTED_SUFFIX)
}

/// Write `contents` to `path` with mode 0600, atomically.
///
/// The data goes to `<path>.tmp` first and is renamed over the final path;
/// the temp file is removed if the rename fails.
fn write_atomic(path: &Path, contents: &[u8]) -> TransferResult<()> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn load_sidecar<T: for<'de> Deserialize<'de>>(path: &Path) -> TransferResult<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&contents) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            tracing::warn!("discarding unreadable resume sidecar {:?}: {}", path, e);
            Ok(None)
        }
    }
}

fn delete_sidecar(path: &Path) -> TransferResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_download_state(state: &DownloadResumeState) -> TransferResult<()> {
    let path = download_state_path(Path::new(&state.local_path));
    write_atomic(&path, serde_json::to_string_pretty(state)?.as_bytes())
}

pub fn load_download_state(local: &Path) -> TransferResult<Option<DownloadResumeState>> {
    load_sidecar(&download_state_path(local))
}

/// Idempotent; succeeds when no sidecar exists
pub fn delete_download_state(local: &Path) -> TransferResult<()> {
    delete_sidecar(&download_state_path(local))
}

pub fn save_upload_state(state: &UploadResumeState) -> TransferResult<()> {
    let path = upload_state_path(Path::new(&state.local_path));
    write_atomic(&path, serde_json::to_string_pretty(state)?.as_bytes())
}

pub fn load_upload_state(local: &Path) -> TransferResult<Option<UploadResumeState>> {
    load_sidecar(&upload_state_path(local))
}

/// Idempotent; succeeds when no sidecar exists
pub fn delete_upload_state(local: &Path) -> TransferResult<()> {
    delete_sidecar(&upload_state_path(local))
}

fn reject(reason: impl Into<String>) -> TransferError {
    TransferError::Fatal(format!("resume state rejected: {}", reason.into()))
}

/// Check a download sidecar against the file being resumed and the remote
/// object's current properties.
///
/// A validator mismatch surfaces as [`TransferError::RemoteChanged`]; other
/// rejections are fatal to the *resume*, and callers typically discard the
/// sidecar and restart from scratch.
pub fn validate_download_state(
    state: &DownloadResumeState,
    local: &Path,
    properties: &BlobProperties,
) -> TransferResult<()> {
    if current_timestamp().saturating_sub(state.created_at) > MAX_RESUME_AGE.as_secs() {
        return Err(reject("older than the maximum resume age"));
    }
    if state.local_path != local.display().to_string() {
        return Err(reject(format!(
            "local path mismatch: {} vs {}",
            state.local_path,
            local.display()
        )));
    }
    if state.downloaded_bytes > state.total_size {
        return Err(reject("downloaded bytes exceed total size"));
    }

    // Older sidecars wrote encrypted_path == local_path; both conventions are
    // valid, the temp file just has to exist once bytes were downloaded.
    let encrypted = Path::new(&state.encrypted_path);
    if !state.encrypted_path.is_empty() && state.downloaded_bytes > 0 && !encrypted.exists() {
        return Err(reject("encrypted temp file is missing"));
    }

    match &state.completed_chunks {
        None => {
            // Sequential resume appends to the temp file, so its length is
            // exactly the downloaded byte count
            if state.downloaded_bytes > 0 {
                let actual = fs::metadata(encrypted).map(|m| m.len()).unwrap_or(0);
                if actual != state.downloaded_bytes {
                    return Err(reject(format!(
                        "temp file size {} disagrees with downloaded bytes {}",
                        actual, state.downloaded_bytes
                    )));
                }
            }
        }
        Some(_) => {
            // Chunked files are pre-sized; anything larger than total is bogus
            if let Ok(metadata) = fs::metadata(encrypted) {
                if metadata.len() > state.total_size {
                    return Err(reject("file larger than the expected total"));
                }
            }
        }
    }

    if state.etag != properties.etag {
        return Err(TransferError::RemoteChanged {
            expected: state.etag.clone(),
            current: properties.etag.clone(),
        });
    }
    if state.total_size != properties.content_length {
        return Err(reject(format!(
            "total size {} disagrees with remote {}",
            state.total_size, properties.content_length
        )));
    }
    Ok(())
}

/// Check an upload sidecar against the source file being resumed
pub fn validate_upload_state(state: &UploadResumeState, local: &Path) -> TransferResult<()> {
    let source_size = fs::metadata(local)
        .map(|m| m.len())
        .map_err(|_| reject("source file is missing"))?;
    if source_size != state.original_size {
        return Err(reject(format!(
            "source file size {} disagrees with recorded size {}",
            source_size, state.original_size
        )));
    }
    if current_timestamp().saturating_sub(state.created_at) > MAX_RESUME_AGE.as_secs() {
        return Err(reject("older than the maximum resume age"));
    }
    if state.local_path != local.display().to_string() {
        return Err(reject("local path mismatch"));
    }
    if state.total_size > 0 && state.uploaded_bytes > state.total_size {
        return Err(reject("uploaded bytes exceed total size"));
    }

    match state.format_version {
        FORMAT_VERSION_LEGACY => {
            if !Path::new(&state.encrypted_path).exists() {
                return Err(reject("encrypted temp file is missing"));
            }
        }
        FORMAT_VERSION_STREAMING => {
            if state.master_key.as_deref().unwrap_or("").is_empty() {
                return Err(reject("streaming state is missing the master key"));
            }
            if state.file_id_v1.as_deref().unwrap_or("").is_empty() {
                return Err(reject("streaming state is missing the file id"));
            }
            if state.part_size.unwrap_or(0) == 0 {
                return Err(reject("streaming state has no part size"));
            }
            if state.part_size.unwrap_or(0) % format::CIPHER_BLOCK_SIZE as u64 != 0 {
                return Err(reject("part size is not a cipher block multiple"));
            }
            // Per-part-key uploads from older clients carry no chain IV and
            // cannot be continued; refusing beats guessing at the key schedule
            if state.iv.as_deref().unwrap_or("").is_empty() {
                return Err(reject(
                    "legacy per-part-key streaming upload cannot be resumed",
                ));
            }
        }
        other => return Err(reject(format!("unknown format version {}", other))),
    }
    Ok(())
}

/// Remove expired `*.download.resume` / `*.upload.resume` sidecars under
/// `dir`, along with their encrypted temp files.
///
/// Temp files are deleted only when they live in the same directory as the
/// sidecar and carry the `.encrypted` suffix. Returns the number of sidecars
/// removed.
pub fn cleanup_expired_resumes_in_dir(dir: &Path) -> TransferResult<usize> {
    let now = current_timestamp();
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        let (created_at, encrypted_path) = if name.ends_with(DOWNLOAD_SIDECAR_SUFFIX) {
            match load_sidecar::<DownloadResumeState>(&path)? {
                Some(state) => (state.created_at, Some(state.encrypted_path)),
                None => continue,
            }
        } else if name.ends_with(UPLOAD_SIDECAR_SUFFIX) {
            match load_sidecar::<UploadResumeState>(&path)? {
                Some(state) => (state.created_at, Some(state.encrypted_path)),
                None => continue,
            }
        } else {
            continue;
        };

        if now.saturating_sub(created_at) <= MAX_RESUME_AGE.as_secs() {
            continue;
        }

        tracing::info!("removing expired resume sidecar {:?}", path);
        delete_sidecar(&path)?;
        removed += 1;

        if let Some(encrypted) = encrypted_path.filter(|p| !p.is_empty()) {
            let encrypted = PathBuf::from(encrypted);
            let same_dir = encrypted.parent() == Some(dir);
            let is_temp = encrypted
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(ENCRYPTED_SUFFIX))
                .unwrap_or(false);
            if same_dir && is_temp {
                let _ = fs::remove_file(&encrypted);
            }
        }
    }
    Ok(removed)
}

fn pid_is_live(pid: u32) -> bool {
    // /proc probe keeps this free of unsafe; on systems without /proc the
    // stale timeout alone decides
    if Path::new("/proc").exists() {
        Path::new(&format!("/proc/{}", pid)).exists()
    } else {
        true
    }
}

/// Holder of an advisory upload lock; releasing deletes the lock file only
/// while it still names this process
#[derive(Debug)]
pub struct UploadLockGuard {
    path: PathBuf,
    process_id: u32,
    released: bool,
}

impl UploadLockGuard {
    pub fn release(mut self) -> TransferResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> TransferResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(existing) = load_sidecar::<UploadLock>(&self.path)? {
            if existing.process_id == self.process_id {
                delete_sidecar(&self.path)?;
            }
        }
        Ok(())
    }
}

impl Drop for UploadLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!("failed to release upload lock {:?}: {}", self.path, e);
        }
    }
}

/// Take the advisory upload lock for `local`.
///
/// Fails with an "in use" error when another live process holds a fresh
/// lock; stale locks (dead pid or past [`LOCK_STALE_TIMEOUT`]) are broken.
pub fn acquire_upload_lock(local: &Path) -> TransferResult<UploadLockGuard> {
    let path = upload_lock_path(local);
    if let Some(existing) = load_sidecar::<UploadLock>(&path)? {
        let age = current_timestamp().saturating_sub(existing.acquired_at);
        let fresh = age <= LOCK_STALE_TIMEOUT.as_secs();
        if fresh && pid_is_live(existing.process_id) {
            return Err(TransferError::Fatal(format!(
                "{} is in use by process {}",
                local.display(),
                existing.process_id
            )));
        }
        tracing::warn!(
            "breaking stale upload lock for {} held by process {}",
            local.display(),
            existing.process_id
        );
    }

    let lock = UploadLock {
        process_id: std::process::id(),
        acquired_at: current_timestamp(),
        local_path: local.display().to_string(),
    };
    write_atomic(&path, serde_json::to_string_pretty(&lock)?.as_bytes())?;
    Ok(UploadLockGuard {
        path,
        process_id: lock.process_id,
        released: false,
    })
}
