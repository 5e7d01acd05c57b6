//! Retry engine with error classification and full-jitter backoff
//!
//! Every blob operation in the engine funnels through [`retry_with_refresh`].
//! Failures are classified into one of a handful of kinds which decide
//! whether to give up, refresh credentials, or back off and try again.
//! Backoff is full jitter: a uniform draw from `[0, cap]` so concurrent
//! chunks do not retry in lockstep.

use crate::model::error::{self, TransferError, TransferResult};
use crate::utils::{env_flag, DEBUG_RETRY_ENV};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Flat pause before retrying after a credential failure; the refresh hook
/// runs at the top of the next attempt
const CREDENTIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Classification of one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No error
    Success,
    /// Not worth retrying: cancellation, client errors, unknown errors
    Fatal,
    /// The signed URL or token was rejected; refresh and retry
    Credential,
    /// Connectivity problem between us and the back end
    Network,
    /// The back end asked us to slow down or failed transiently
    Retryable,
}

/// Map an optional error to exactly one [`ErrorKind`].
///
/// Typed checks run first (cancellation, credential variants, I/O errno);
/// message substrings are the fallback for errors that crossed an HTTP or
/// SDK boundary as text.
pub fn classify_error(err: Option<&TransferError>) -> ErrorKind {
    let Some(err) = err else {
        return ErrorKind::Success;
    };
    match err {
        TransferError::Cancelled => ErrorKind::Fatal,
        TransferError::Unauthorized(_) => ErrorKind::Credential,
        TransferError::InsufficientSpace { .. } | TransferError::RemoteChanged { .. } => {
            ErrorKind::Fatal
        }
        _ => classify_by_message(err),
    }
}

fn classify_by_message(err: &TransferError) -> ErrorKind {
    let msg = err.lowered_message();

    // Proxy auth demands interactive setup; retrying cannot fix it
    if msg.contains("http 407") || msg.contains("proxy authentication required") {
        return ErrorKind::Fatal;
    }
    if error::is_credential_error(err) {
        return ErrorKind::Credential;
    }
    if error::is_network_error(err) {
        return ErrorKind::Network;
    }

    const RETRYABLE: [&str; 9] = [
        "http 429",
        "http 500",
        "http 502",
        "http 503",
        "http 504",
        "slow down",
        "throttl",
        "server busy",
        "service unavailable",
    ];
    if RETRYABLE.iter().any(|needle| msg.contains(needle)) {
        return ErrorKind::Retryable;
    }

    match err {
        // A transient wrapper without a recognizable signal still merits retry
        TransferError::Transient(_) => ErrorKind::Retryable,
        // Unknown errors default to fatal
        _ => ErrorKind::Fatal,
    }
}

/// Full-jitter backoff: uniform in `[0, min(max_delay, initial * 2^attempt)]`
pub fn calculate_backoff(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let exponential = initial_delay.saturating_mul(2u32.saturating_pow(attempt.min(31)));
    let cap = exponential.min(max_delay);
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

/// Per-operation retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Operation name used in diagnostics and wrapped errors
    pub operation: String,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        RetryConfig {
            operation: operation.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Refresh-hook type used when no hook is supplied
type NoRefresh = fn() -> futures::future::Ready<TransferResult<()>>;

/// Run an idempotent operation under the retry policy, without a refresh hook
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> TransferResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransferResult<T>>,
{
    retry_with_refresh(config, cancel, None::<NoRefresh>, operation).await
}

/// Run an idempotent operation under the retry policy.
///
/// Before every attempt the cancellation token is checked and the refresh
/// hook, when present, is invoked; a hook failure aborts immediately.
/// Fatal errors return at once. Credential failures pause one second and go
/// around so the hook can fetch fresh material. Network and retryable
/// failures sleep a jittered backoff. Exhaustion wraps the last error.
pub async fn retry_with_refresh<T, F, Fut, R, RFut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    refresh: Option<R>,
    mut operation: F,
) -> TransferResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransferResult<T>>,
    R: Fn() -> RFut,
    RFut: Future<Output = TransferResult<()>>,
{
    let debug_retry = env_flag(DEBUG_RETRY_ENV);
    let mut last_error: Option<TransferError> = None;

    for attempt in 0..config.max_attempts {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if let Some(refresh) = refresh.as_ref() {
            if let Err(e) = refresh().await {
                return Err(TransferError::Unauthorized(format!(
                    "credential refresh failed before {}: {}",
                    config.operation, e
                )));
            }
        }

        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        "{} succeeded on attempt {}/{}",
                        config.operation,
                        attempt + 1,
                        config.max_attempts
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let kind = classify_error(Some(&err));
        if debug_retry {
            tracing::info!(
                "{} attempt {}/{} failed ({:?}): {}",
                config.operation,
                attempt + 1,
                config.max_attempts,
                kind,
                err
            );
        }

        match kind {
            ErrorKind::Success => unreachable!("classified an error as success"),
            ErrorKind::Fatal => return Err(err),
            ErrorKind::Credential => {
                tracing::warn!(
                    "{} hit a credential failure, refreshing: {}",
                    config.operation,
                    err
                );
                sleep_or_cancel(cancel, CREDENTIAL_RETRY_DELAY).await?;
            }
            ErrorKind::Network | ErrorKind::Retryable => {
                let delay = calculate_backoff(attempt, config.initial_delay, config.max_delay);
                tracing::debug!(
                    "{} attempt {}/{} failed, backing off {}ms: {}",
                    config.operation,
                    attempt + 1,
                    config.max_attempts,
                    delay.as_millis(),
                    err
                );
                sleep_or_cancel(cancel, delay).await?;
            }
        }
        last_error = Some(err);
    }

    let last = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts were made".to_string());
    if is_credential_message(&last) {
        Err(TransferError::Unauthorized(format!(
            "{} failed after {} attempts: {}",
            config.operation, config.max_attempts, last
        )))
    } else {
        Err(TransferError::Transient(format!(
            "{} failed after {} attempts: {}",
            config.operation, config.max_attempts, last
        )))
    }
}

fn is_credential_message(message: &str) -> bool {
    let probe = TransferError::Fatal(message.to_string());
    error::is_credential_error(&probe)
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> TransferResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
