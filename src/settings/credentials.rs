//! Short-lived storage credentials issued by the control-plane API
//!
//! The engine never acquires credentials interactively; an external API
//! client hands them over through [`CredentialSource`] and the engine only
//! refreshes and composes them.

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{ObjectIdentity, StorageDescriptor, StorageKind};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use url::Url;

/// Scope a credential was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialScope {
    /// The caller's default storage
    Default,
    /// Credentials limited to one remote object, used for cross-account reads
    Object(String),
}

/// Token material inside a credential, by back-end flavor
#[derive(Clone, PartialEq)]
pub enum CredentialMaterial {
    /// Shared-access signature material for blob containers
    Sas {
        /// Full pre-signed URL for the account root, when the API returns one
        root_url: Option<String>,
        /// Account-wide query signature
        signature: String,
        /// Per-object query signatures keyed by remote path
        object_signatures: HashMap<String, String>,
    },
    /// Temporary access keys for S3-compatible storage
    AccessKeys {
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    },
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialMaterial::Sas { root_url, .. } => f
                .debug_struct("Sas")
                .field("root_url", &root_url.as_deref().map(|_| "<redacted>"))
                .field("signature", &"<redacted>")
                .finish(),
            CredentialMaterial::AccessKeys { access_key_id, .. } => f
                .debug_struct("AccessKeys")
                .field(
                    "access_key_id",
                    &&access_key_id[..8.min(access_key_id.len())],
                )
                .field("secret_access_key", &"<redacted>")
                .finish(),
        }
    }
}

/// A short-lived storage credential with its expiry
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub material: CredentialMaterial,
    pub scope: CredentialScope,
    pub expires_at: SystemTime,
}

impl Credential {
    /// Whether the credential expires within the given window from now
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining <= window,
            Err(_) => true,
        }
    }
}

/// Capability of the external API client that issues storage credentials
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
    /// Credentials for the caller's default storage
    async fn default_credentials(&self) -> TransferResult<Credential>;

    /// Credentials scoped to one remote object, for cross-account reads
    async fn credentials_for_object(
        &self,
        identity: &ObjectIdentity,
    ) -> TransferResult<Credential>;
}

/// Credential source that always hands out the same credential.
///
/// Fits endpoints with long-lived keys: S3-compatible local stores and the
/// hermetic test suites.
pub struct StaticCredentialSource {
    credential: Credential,
}

impl StaticCredentialSource {
    pub fn new(credential: Credential) -> Self {
        StaticCredentialSource { credential }
    }
}

#[async_trait::async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn default_credentials(&self) -> TransferResult<Credential> {
        Ok(self.credential.clone())
    }

    async fn credentials_for_object(
        &self,
        _identity: &ObjectIdentity,
    ) -> TransferResult<Credential> {
        Ok(self.credential.clone())
    }
}

fn blob_host(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::AzureStorage => "blob.core.windows.net",
        StorageKind::S3Storage => "s3.amazonaws.com",
    }
}

/// Compose the signed account URL for SAS credentials.
///
/// When the credential carries a pre-signed root URL, it is used as-is and
/// the query signature is appended only if missing. Otherwise the URL is
/// built as `https://{account}.{host}/?{signature}`; the container is
/// deliberately left out and supplied per call. A per-object signature that
/// matches the bound object's remote path wins over the account-wide one.
pub fn compose_signed_url(
    descriptor: &StorageDescriptor,
    credential: &Credential,
    bound_object: Option<&ObjectIdentity>,
) -> TransferResult<Url> {
    let (root_url, signature, object_signatures) = match &credential.material {
        CredentialMaterial::Sas {
            root_url,
            signature,
            object_signatures,
        } => (root_url, signature, object_signatures),
        CredentialMaterial::AccessKeys { .. } => {
            return Err(TransferError::Fatal(
                "signed URLs apply only to SAS credentials".to_string(),
            ))
        }
    };

    let signature = bound_object
        .and_then(|identity| object_signatures.get(&identity.remote_path))
        .unwrap_or(signature)
        .trim_start_matches('?');

    if let Some(root) = root_url {
        let mut url = Url::parse(root)
            .map_err(|e| TransferError::Fatal(format!("invalid pre-signed URL: {}", e)))?;
        let has_signature = url
            .query()
            .map(|q| q.split('&').any(|pair| pair.starts_with("sig=")))
            .unwrap_or(false);
        if !has_signature {
            let merged = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{}&{}", existing, signature),
                _ => signature.to_string(),
            };
            url.set_query(Some(&merged));
        }
        return Ok(url);
    }

    let raw = format!(
        "https://{}.{}/?{}",
        descriptor.account,
        blob_host(descriptor.kind),
        signature
    );
    Url::parse(&raw).map_err(|e| TransferError::Fatal(format!("invalid signed URL: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sas_credential(root_url: Option<&str>) -> Credential {
        Credential {
            material: CredentialMaterial::Sas {
                root_url: root_url.map(String::from),
                signature: "sv=2024-01-01&sig=account%2Fsig".to_string(),
                object_signatures: HashMap::new(),
            },
            scope: CredentialScope::Default,
            expires_at: SystemTime::now() + Duration::from_secs(3600),
        }
    }

    fn descriptor() -> StorageDescriptor {
        StorageDescriptor::new(StorageKind::AzureStorage, "myaccount", None)
    }

    #[test]
    fn test_compose_from_account_and_signature_omits_container() {
        let url = compose_signed_url(&descriptor(), &sas_credential(None), None).unwrap();
        assert_eq!(url.host_str(), Some("myaccount.blob.core.windows.net"));
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), Some("sv=2024-01-01&sig=account%2Fsig"));
    }

    #[test]
    fn test_compose_appends_signature_to_unsigned_root_url() {
        let url = compose_signed_url(
            &descriptor(),
            &sas_credential(Some("https://myaccount.blob.core.windows.net/")),
            None,
        )
        .unwrap();
        assert_eq!(url.query(), Some("sv=2024-01-01&sig=account%2Fsig"));
    }

    #[test]
    fn test_compose_keeps_already_signed_root_url() {
        let url = compose_signed_url(
            &descriptor(),
            &sas_credential(Some(
                "https://myaccount.blob.core.windows.net/?sv=2023-01-01&sig=presigned",
            )),
            None,
        )
        .unwrap();
        assert_eq!(url.query(), Some("sv=2023-01-01&sig=presigned"));
    }

    #[test]
    fn test_per_object_signature_preferred_when_bound() {
        let mut object_signatures = HashMap::new();
        object_signatures.insert(
            "shared/data.bin".to_string(),
            "sig=object-scope".to_string(),
        );
        let credential = Credential {
            material: CredentialMaterial::Sas {
                root_url: None,
                signature: "sig=account-scope".to_string(),
                object_signatures,
            },
            scope: CredentialScope::Object("shared/data.bin".to_string()),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
        };
        let identity = ObjectIdentity {
            remote_path: "shared/data.bin".to_string(),
            size: 10,
            etag: "\"e\"".to_string(),
        };
        let url = compose_signed_url(&descriptor(), &credential, Some(&identity)).unwrap();
        assert_eq!(url.query(), Some("sig=object-scope"));
    }

    #[test]
    fn test_access_keys_cannot_compose_signed_url() {
        let credential = Credential {
            material: CredentialMaterial::AccessKeys {
                access_key_id: "AKIA12345678".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            scope: CredentialScope::Default,
            expires_at: SystemTime::now(),
        };
        assert!(compose_signed_url(&descriptor(), &credential, None).is_err());
    }

    #[test]
    fn test_expires_within() {
        let mut credential = sas_credential(None);
        credential.expires_at = SystemTime::now() + Duration::from_secs(30);
        assert!(credential.expires_within(Duration::from_secs(60)));
        assert!(!credential.expires_within(Duration::from_secs(5)));

        credential.expires_at = SystemTime::now() - Duration::from_secs(1);
        assert!(credential.expires_within(Duration::from_secs(0)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credential = sas_credential(None);
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("account%2Fsig"));
    }
}
