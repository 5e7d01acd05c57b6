//! This module provides the transfer engine proper: the retrying blob client,
//! the chunked downloader and streaming uploader, and their shared state

pub mod backend;
pub mod blob_client;
pub mod cipher;
pub mod downloader;
pub mod engine;
pub mod resume;
pub mod retry;
pub mod uploader;
