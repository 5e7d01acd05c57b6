//! Remote storage descriptors and per-object identity

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Back-end flavor a transfer is talking to.
///
/// The serialized names are stable; resume sidecars written by older
/// releases carry them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "S3Storage")]
    S3Storage,
    #[serde(rename = "AzureStorage")]
    AzureStorage,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::S3Storage => "S3Storage",
            StorageKind::AzureStorage => "AzureStorage",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of the storage target, created at process start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub kind: StorageKind,
    /// Account name (Azure) or bucket name (S3)
    pub account: String,
    /// Container addressed per call; defaults to the account name
    pub container: Option<String>,
    /// Optional prefix under which all objects for this caller live
    pub base_path: Option<String>,
}

impl StorageDescriptor {
    pub fn new(kind: StorageKind, account: impl Into<String>, base_path: Option<String>) -> Self {
        StorageDescriptor {
            kind,
            account: account.into(),
            container: None,
            base_path: base_path.filter(|p| !p.is_empty()),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Container (Azure) or bucket (S3) requests address
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.account)
    }

    /// Remote key for a named file: `{base_path}/{filename}-{suffix}`
    pub fn object_key(&self, filename: &str, suffix: &str) -> String {
        match &self.base_path {
            Some(base) => format!("{}/{}-{}", base.trim_end_matches('/'), filename, suffix),
            None => format!("{}-{}", filename, suffix),
        }
    }
}

/// Identity of one remote object: path, size, and the back end's strong
/// validator (ETag or equivalent), compared byte-for-byte during resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub remote_path: String,
    pub size: u64,
    pub etag: String,
}

/// Key-value metadata stored with a remote object.
///
/// Back ends differ in how they case metadata names, so keys are lowered on
/// insert and lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageMetadata(HashMap<String, String>);

impl StorageMetadata {
    pub fn new() -> Self {
        StorageMetadata(HashMap::new())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for StorageMetadata {
    fn from(arr: [(&str, &str); N]) -> Self {
        let mut metadata = StorageMetadata::new();
        for (k, v) in arr {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// Properties returned by a HEAD on a remote object
#[derive(Debug, Clone, PartialEq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub etag: String,
    pub metadata: StorageMetadata,
}

impl BlobProperties {
    pub fn identity(&self, remote_path: &str) -> ObjectIdentity {
        ObjectIdentity {
            remote_path: remote_path.to_string(),
            size: self.content_length,
            etag: self.etag.clone(),
        }
    }
}
