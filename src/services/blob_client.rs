//! Credential-refreshing blob client
//!
//! Wraps a [`BlobBackend`] with the three credential refresh layers:
//! proactive ([`BlobClient::ensure_fresh_credentials`] before long
//! operations), periodic (a background task for multi-hour transfers), and
//! error-driven (the retry engine's refresh hook). Credential rotation swaps
//! only the thin backend value; the HTTP pool is built once and threaded
//! through every rotation so warm TLS sessions survive.

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{BlobProperties, ObjectIdentity, StorageDescriptor, StorageKind, StorageMetadata};
use crate::services::backend::azure::AzureBlobBackend;
use crate::services::backend::s3::S3Backend;
use crate::services::backend::{collect_stream, BlobBackend, ByteStream};
use crate::services::retry::{retry_with_refresh, RetryConfig};
use crate::settings::credentials::{
    compose_signed_url, Credential, CredentialMaterial, CredentialSource,
};
use crate::utils::{env_flag, DISABLE_HTTP2_ENV};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cadence of the background refresher for long-running transfers
pub const PERIODIC_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Files larger than this get a periodic refresher for the duration of the
/// transfer
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Per-attempt deadline for chunk-sized network operations; the request, the
/// body, and the close share it
pub const PART_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the shared HTTP pool: keep-alive, generous per-host idle pool,
/// TLS 1.2 floor, proxy env vars honored, HTTP/2 unless `DISABLE_HTTP2` is
/// set. Built once per client and reused across credential rotations.
pub fn build_http_pool() -> TransferResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Duration::from_secs(30))
        .min_tls_version(reqwest::tls::Version::TLS_1_2);
    if env_flag(DISABLE_HTTP2_ENV) {
        builder = builder.http1_only();
    }
    builder
        .build()
        .map_err(|e| TransferError::Fatal(format!("failed to build HTTP pool: {}", e)))
}

struct Refresher {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Blob client shared by every worker of one transfer
pub struct BlobClient {
    descriptor: StorageDescriptor,
    source: Arc<dyn CredentialSource>,
    bound_object: Option<ObjectIdentity>,
    http_pool: reqwest::Client,
    backend: RwLock<Arc<dyn BlobBackend>>,
    /// Serializes refreshes; never held while a request is in flight
    refresh_lock: Mutex<()>,
    refresher: Mutex<Option<Refresher>>,
    rebuild_on_refresh: bool,
}

async fn fetch_credential(
    source: &Arc<dyn CredentialSource>,
    bound_object: &Option<ObjectIdentity>,
) -> TransferResult<Credential> {
    match bound_object {
        Some(identity) => source.credentials_for_object(identity).await,
        None => source.default_credentials().await,
    }
}

async fn build_backend(
    descriptor: &StorageDescriptor,
    http_pool: &reqwest::Client,
    credential: &Credential,
    bound_object: Option<&ObjectIdentity>,
) -> TransferResult<Arc<dyn BlobBackend>> {
    match descriptor.kind {
        StorageKind::AzureStorage => {
            let signed_url = compose_signed_url(descriptor, credential, bound_object)?;
            Ok(Arc::new(AzureBlobBackend::new(
                http_pool.clone(),
                signed_url,
                descriptor.container_name(),
            )))
        }
        StorageKind::S3Storage => {
            let CredentialMaterial::AccessKeys {
                access_key_id,
                secret_access_key,
                session_token,
            } = &credential.material
            else {
                return Err(TransferError::Fatal(
                    "S3 storage requires access-key credentials".to_string(),
                ));
            };
            let credentials = aws_sdk_s3::config::Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                session_token.clone(),
                None,
                "control-plane",
            );
            let shared_config = aws_config::from_env()
                .credentials_provider(credentials)
                .load()
                .await;
            Ok(Arc::new(S3Backend::new(
                aws_sdk_s3::Client::new(&shared_config),
                descriptor.container_name(),
            )))
        }
    }
}

impl BlobClient {
    /// Build a client for the descriptor, fetching an initial credential.
    ///
    /// With a bound [`ObjectIdentity`] the API is asked for object-scoped
    /// credentials (cross-account reads); otherwise the caller's default
    /// storage credentials are used.
    pub async fn new(
        descriptor: StorageDescriptor,
        source: Arc<dyn CredentialSource>,
        bound_object: Option<ObjectIdentity>,
    ) -> TransferResult<Self> {
        let http_pool = build_http_pool()?;
        let credential = fetch_credential(&source, &bound_object).await?;
        let backend =
            build_backend(&descriptor, &http_pool, &credential, bound_object.as_ref()).await?;
        Ok(BlobClient {
            descriptor,
            source,
            bound_object,
            http_pool,
            backend: RwLock::new(backend),
            refresh_lock: Mutex::new(()),
            refresher: Mutex::new(None),
            rebuild_on_refresh: true,
        })
    }

    /// Wrap an already-built backend. Refreshes still consult the credential
    /// source but keep the injected backend; the test suites rely on this.
    pub fn with_backend(
        descriptor: StorageDescriptor,
        backend: Arc<dyn BlobBackend>,
        source: Arc<dyn CredentialSource>,
    ) -> TransferResult<Self> {
        Ok(BlobClient {
            descriptor,
            source,
            bound_object: None,
            http_pool: build_http_pool()?,
            backend: RwLock::new(backend),
            refresh_lock: Mutex::new(()),
            refresher: Mutex::new(None),
            rebuild_on_refresh: false,
        })
    }

    pub fn descriptor(&self) -> &StorageDescriptor {
        &self.descriptor
    }

    async fn current_backend(&self) -> Arc<dyn BlobBackend> {
        self.backend.read().await.clone()
    }

    /// Fetch a fresh credential and swap in a backend built from it.
    ///
    /// The backend pointer swap happens under the write lock; requests
    /// already in flight keep their Arc and finish undisturbed. The HTTP
    /// pool is reused, never rebuilt.
    pub async fn ensure_fresh_credentials(&self) -> TransferResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let credential = fetch_credential(&self.source, &self.bound_object).await?;
        if !self.rebuild_on_refresh {
            return Ok(());
        }
        let backend = build_backend(
            &self.descriptor,
            &self.http_pool,
            &credential,
            self.bound_object.as_ref(),
        )
        .await?;
        *self.backend.write().await = backend;
        tracing::debug!("rotated storage credentials for {}", self.descriptor.account);
        Ok(())
    }

    /// Spawn the periodic refresher. Idempotent; pair with
    /// [`BlobClient::stop_periodic_refresh`].
    pub async fn start_periodic_refresh(self: &Arc<Self>) {
        let mut slot = self.refresher.lock().await;
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let child = token.clone();
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERIODIC_REFRESH_INTERVAL);
            // the interval fires immediately; the construction-time credential
            // is already fresh
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.ensure_fresh_credentials().await {
                            tracing::warn!("periodic credential refresh failed: {}", e);
                        }
                    }
                }
            }
        });
        *slot = Some(Refresher { token, handle });
    }

    /// Cancel the periodic refresher and wait for it to exit
    pub async fn stop_periodic_refresh(&self) {
        let refresher = self.refresher.lock().await.take();
        if let Some(Refresher { token, handle }) = refresher {
            token.cancel();
            let _ = handle.await;
        }
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> TransferResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let config = RetryConfig::for_operation(operation);
        retry_with_refresh(
            &config,
            cancel,
            Some(move || self.ensure_fresh_credentials()),
            body,
        )
        .await
    }

    pub async fn get_properties(
        &self,
        cancel: &CancellationToken,
        remote: &str,
    ) -> TransferResult<BlobProperties> {
        self.run("GetBlobProperties", cancel, move || async move {
            self.current_backend().await.get_properties(remote).await
        })
        .await
    }

    /// Open a streaming read; the stream itself is consumed by the caller
    /// and is not retried here
    pub async fn download_stream(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<ByteStream> {
        self.run("DownloadStream", cancel, move || async move {
            self.current_backend()
                .await
                .download_range(remote, offset, count)
                .await
        })
        .await
    }

    /// Fetch one byte range fully into memory.
    ///
    /// The request, the body read, and the close are one retryable atom
    /// under [`PART_OPERATION_TIMEOUT`], so a proxy dying mid-body restarts
    /// the whole range instead of wedging the download.
    pub async fn download_range(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        offset: u64,
        count: u64,
    ) -> TransferResult<Vec<u8>> {
        self.run("DownloadRange", cancel, move || async move {
            with_deadline("DownloadRange", async {
                let backend = self.current_backend().await;
                let stream = backend.download_range(remote, offset, Some(count)).await?;
                collect_stream(stream).await
            })
            .await
        })
        .await
    }

    pub async fn create_block_upload(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        self.run("CreateBlockUpload", cancel, move || async move {
            self.current_backend()
                .await
                .create_block_upload(remote, metadata)
                .await
        })
        .await
    }

    pub async fn stage_block(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        block_id: &str,
        data: Bytes,
    ) -> TransferResult<()> {
        let data = &data;
        self.run("StageBlock", cancel, move || async move {
            with_deadline("StageBlock", async {
                self.current_backend()
                    .await
                    .stage_block(remote, block_id, data.clone())
                    .await
            })
            .await
        })
        .await
    }

    pub async fn commit_block_list(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        block_ids: &[String],
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        self.run("CommitBlockList", cancel, move || async move {
            self.current_backend()
                .await
                .commit_block_list(remote, block_ids, metadata)
                .await
        })
        .await
    }

    pub async fn uncommitted_block_list(
        &self,
        cancel: &CancellationToken,
        remote: &str,
    ) -> TransferResult<Vec<String>> {
        self.run("GetBlockList", cancel, move || async move {
            self.current_backend()
                .await
                .uncommitted_block_list(remote)
                .await
        })
        .await
    }
}

async fn with_deadline<T, Fut>(operation: &str, fut: Fut) -> TransferResult<T>
where
    Fut: Future<Output = TransferResult<T>>,
{
    match tokio::time::timeout(PART_OPERATION_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Transient(format!(
            "{}: operation timeout after {}s",
            operation,
            PART_OPERATION_TIMEOUT.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::storage::StorageKind;
    use crate::services::backend::mem::InMemoryBackend;
    use crate::settings::credentials::{CredentialScope, MockCredentialSource};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::SystemTime;

    fn sas_credential() -> Credential {
        Credential {
            material: CredentialMaterial::Sas {
                root_url: None,
                signature: "sig=test".to_string(),
                object_signatures: Default::default(),
            },
            scope: CredentialScope::Default,
            expires_at: SystemTime::now() + Duration::from_secs(900),
        }
    }

    fn descriptor() -> StorageDescriptor {
        StorageDescriptor::new(StorageKind::AzureStorage, "acct", None)
    }

    fn counting_source(counter: Arc<AtomicU32>) -> Arc<dyn CredentialSource> {
        let mut source = MockCredentialSource::new();
        source.expect_default_credentials().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(sas_credential())
        });
        Arc::new(source)
    }

    fn client_over(backend: Arc<InMemoryBackend>, refreshes: Arc<AtomicU32>) -> Arc<BlobClient> {
        Arc::new(
            BlobClient::with_backend(descriptor(), backend, counting_source(refreshes)).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_signature_recovers_with_one_visible_retry() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put_object("obj", vec![1, 2, 3, 4], Default::default());
        backend.fail_next(
            "download_range",
            TransferError::from_http_status(403, "Signature not valid in the specified time frame"),
        );

        let refreshes = Arc::new(AtomicU32::new(0));
        let client = client_over(backend.clone(), refreshes.clone());
        let cancel = CancellationToken::new();

        let bytes = client.download_range(&cancel, "obj", 0, 4).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        // two attempts, each preceded by the refresh hook
        assert_eq!(backend.operation_count("download_range"), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_stops_cleanly() {
        let backend = Arc::new(InMemoryBackend::new());
        let refreshes = Arc::new(AtomicU32::new(0));
        let client = client_over(backend, refreshes.clone());

        client.start_periodic_refresh().await;
        tokio::time::sleep(PERIODIC_REFRESH_INTERVAL * 3 + Duration::from_secs(1)).await;
        let while_running = refreshes.load(Ordering::SeqCst);
        assert!(while_running >= 2, "expected refreshes, saw {}", while_running);

        client.stop_periodic_refresh().await;
        let after_stop = refreshes.load(Ordering::SeqCst);
        tokio::time::sleep(PERIODIC_REFRESH_INTERVAL * 3).await;
        assert_eq!(
            refreshes.load(Ordering::SeqCst),
            after_stop,
            "refresher still running after stop"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_periodic_refresh_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        let refreshes = Arc::new(AtomicU32::new(0));
        let client = client_over(backend, refreshes.clone());

        client.start_periodic_refresh().await;
        client.start_periodic_refresh().await;
        tokio::time::sleep(PERIODIC_REFRESH_INTERVAL + Duration::from_secs(1)).await;
        // a doubled refresher would tick twice per interval
        assert!(refreshes.load(Ordering::SeqCst) <= 2);
        client.stop_periodic_refresh().await;
    }

    #[tokio::test]
    async fn test_fatal_backend_error_is_not_retried() {
        let backend = Arc::new(InMemoryBackend::new());
        let refreshes = Arc::new(AtomicU32::new(0));
        let client = client_over(backend.clone(), refreshes);
        let cancel = CancellationToken::new();

        let err = client
            .get_properties(&cancel, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Fatal(_)));
        assert_eq!(backend.operation_count("get_properties"), 1);
    }
}
