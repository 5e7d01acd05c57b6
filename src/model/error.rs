//! Structured error types for transfer operations

use std::fmt;
use std::io;

/// Errors surfaced by the transfer engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    /// Local disk cannot hold the data being written
    InsufficientSpace {
        path: String,
        required: u64,
        available: u64,
    },
    /// The remote object no longer matches the validator recorded at resume time
    RemoteChanged { expected: String, current: String },
    /// The caller requested cancellation
    Cancelled,
    /// Credential failure that survived credential retries
    Unauthorized(String),
    /// Retry exhaustion for network/service errors; wraps the last underlying error
    Transient(String),
    /// Client errors, malformed metadata, invariant violations
    Fatal(String),
    /// Local I/O failure, with the OS error code when one exists
    Io { message: String, code: Option<i32> },
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::InsufficientSpace {
                path,
                required,
                available,
            } => write!(
                f,
                "insufficient space at {}: required {} bytes, available {}",
                path, required, available
            ),
            TransferError::RemoteChanged { expected, current } => write!(
                f,
                "remote object changed: expected validator {}, current {}",
                expected, current
            ),
            TransferError::Cancelled => write!(f, "operation cancelled"),
            TransferError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            TransferError::Transient(msg) => write!(f, "transfer failed: {}", msg),
            TransferError::Fatal(msg) => write!(f, "{}", msg),
            TransferError::Io { message, .. } => write!(f, "io error: {}", message),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io {
            message: e.to_string(),
            code: e.raw_os_error(),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Fatal(format!("malformed state: {}", e))
    }
}

impl TransferError {
    /// Map an HTTP status and response detail onto the error taxonomy.
    ///
    /// 401/403 become credential failures, 429 and 5xx are retryable,
    /// remaining 4xx are client errors.
    pub fn from_http_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => TransferError::Unauthorized(format!("HTTP {}: {}", status, detail)),
            429 | 500 | 502 | 503 | 504 => {
                TransferError::Transient(format!("HTTP {}: {}", status, detail))
            }
            _ => TransferError::Fatal(format!("HTTP {}: {}", status, detail)),
        }
    }

    /// The lowered message used by the substring predicates below
    pub fn lowered_message(&self) -> String {
        self.to_string().to_lowercase()
    }
}

/// True when the error indicates the local disk is out of space
pub fn is_disk_full(err: &TransferError) -> bool {
    if let TransferError::InsufficientSpace { .. } = err {
        return true;
    }
    if let TransferError::Io {
        code: Some(code), ..
    } = err
    {
        if *code == libc::ENOSPC || *code == libc::EDQUOT {
            return true;
        }
    }
    let msg = err.lowered_message();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("not enough space")
        || msg.contains("quota exceeded")
}

/// True when the error indicates a connectivity problem rather than a
/// service-side or client-side failure
pub fn is_network_error(err: &TransferError) -> bool {
    if let TransferError::Io {
        code: Some(code), ..
    } = err
    {
        if [
            libc::ECONNRESET,
            libc::ECONNREFUSED,
            libc::ECONNABORTED,
            libc::EPIPE,
            libc::ETIMEDOUT,
            libc::EHOSTUNREACH,
            libc::ENETUNREACH,
        ]
        .contains(code)
        {
            return true;
        }
    }
    let msg = err.lowered_message();
    [
        "deadline exceeded",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "broken pipe",
        "unexpected eof",
        "eof",
        "tls handshake",
        "handshake timeout",
        "idle connection",
        "goaway",
        "proxyconnect",
        "dispatch failure",
        "connection closed",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

/// True when the error indicates the signed URL or token was rejected
pub fn is_credential_error(err: &TransferError) -> bool {
    if let TransferError::Unauthorized(_) = err {
        return true;
    }
    let msg = err.lowered_message();
    [
        "expired",
        "invalid token",
        "invalid sas",
        "signature not valid",
        "authentication failed",
        "authorization failure",
        "http 401",
        "http 403",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

/// Result type for transfer operations
pub type TransferResult<T = ()> = Result<T, TransferError>;
