//! # vaultstream
//!
//! Transfer engine for moving large, at-rest-encrypted files between a local
//! filesystem and S3 or Azure blob storage. Provides a credential-refreshing
//! blob client, a chunked parallel downloader, a streaming CBC block uploader,
//! and crash-safe resume of interrupted transfers.
//!
//! The library is consumed by a command-line client; command-line parsing,
//! progress rendering and transfer orchestration live in the consumer.

#![forbid(unsafe_code)]

pub mod model;
pub mod services;
pub mod settings;
pub mod utils;
