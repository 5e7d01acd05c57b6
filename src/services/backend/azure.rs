//! Azure block-blob back end speaking REST through a signed account URL
//!
//! All requests ride the shared HTTP pool and authenticate with the SAS
//! query carried by the signed URL; no secrets go into headers. The
//! container is appended to the URL per call, the account URL itself stays
//! container-free.

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{BlobProperties, StorageMetadata};
use crate::services::backend::{BlobBackend, ByteStream};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header;
use url::Url;

const AZURE_API_VERSION: &str = "2021-08-06";
const METADATA_HEADER_PREFIX: &str = "x-ms-meta-";

pub struct AzureBlobBackend {
    http: reqwest::Client,
    /// Signed account root, query carrying the SAS
    signed_base: Url,
    container: String,
}

impl AzureBlobBackend {
    pub fn new(http: reqwest::Client, signed_base: Url, container: impl Into<String>) -> Self {
        AzureBlobBackend {
            http,
            signed_base,
            container: container.into(),
        }
    }

    /// URL of one blob: signed base plus `/{container}/{remote}`, SAS query
    /// preserved
    fn blob_url(&self, remote: &str) -> TransferResult<Url> {
        let mut url = self.signed_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                TransferError::Fatal("signed URL cannot be used as a base".to_string())
            })?;
            segments.clear();
            segments.push(&self.container);
            for segment in remote.split('/').filter(|s| !s.is_empty()) {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("x-ms-version", AZURE_API_VERSION)
    }
}

fn transport_error(operation: &str, e: reqwest::Error) -> TransferError {
    TransferError::Transient(format!("{}: {}", operation, e))
}

async fn check_response(
    operation: &str,
    response: reqwest::Response,
) -> TransferResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut detail = response.text().await.unwrap_or_default();
    if detail.is_empty() {
        detail = status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    detail.truncate(500);
    Err(TransferError::from_http_status(
        status.as_u16(),
        format!("{}: {}", operation, detail),
    ))
}

/// Pull the uncommitted block names out of a block-list response.
///
/// The body is the small, flat `<BlockList>` document; a full XML parser
/// would be more machinery than the format warrants.
fn parse_uncommitted_blocks(xml: &str) -> Vec<String> {
    let section = match (
        xml.find("<UncommittedBlocks>"),
        xml.find("</UncommittedBlocks>"),
    ) {
        (Some(start), Some(end)) if start < end => &xml[start..end],
        _ => return Vec::new(),
    };
    let mut names = Vec::new();
    for fragment in section.split("<Name>").skip(1) {
        if let Some(end) = fragment.find("</Name>") {
            names.push(fragment[..end].trim().to_string());
        }
    }
    names
}

#[async_trait::async_trait]
impl BlobBackend for AzureBlobBackend {
    async fn get_properties(&self, remote: &str) -> TransferResult<BlobProperties> {
        let url = self.blob_url(remote)?;
        let response = self
            .request(reqwest::Method::HEAD, url)
            .send()
            .await
            .map_err(|e| transport_error("GetBlobProperties", e))?;
        let response = check_response("GetBlobProperties", response).await?;

        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                TransferError::Fatal(format!("{}: response has no content length", remote))
            })?;
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut metadata = StorageMetadata::new();
        for (name, value) in response.headers() {
            let name = name.as_str();
            if let Some(key) = name.strip_prefix(METADATA_HEADER_PREFIX) {
                if let Ok(value) = value.to_str() {
                    metadata.insert(key, value);
                }
            }
        }

        Ok(BlobProperties {
            content_length,
            etag,
            metadata,
        })
    }

    async fn download_range(
        &self,
        remote: &str,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<ByteStream> {
        let url = self.blob_url(remote)?;
        let range = match count {
            Some(count) if count > 0 => format!("bytes={}-{}", offset, offset + count - 1),
            _ => format!("bytes={}-", offset),
        };
        let response = self
            .request(reqwest::Method::GET, url)
            .header(header::RANGE, range)
            .send()
            .await
            .map_err(|e| transport_error("DownloadRange", e))?;
        let response = check_response("DownloadRange", response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::pin(stream))
    }

    async fn create_block_upload(
        &self,
        _remote: &str,
        _metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        // Block blobs have no explicit begin; metadata rides the commit
        Ok(())
    }

    async fn stage_block(&self, remote: &str, block_id: &str, data: Bytes) -> TransferResult<()> {
        let mut url = self.blob_url(remote)?;
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", block_id);
        let response = self
            .request(reqwest::Method::PUT, url)
            .body(data)
            .send()
            .await
            .map_err(|e| transport_error("StageBlock", e))?;
        check_response("StageBlock", response).await?;
        Ok(())
    }

    async fn commit_block_list(
        &self,
        remote: &str,
        block_ids: &[String],
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        let mut url = self.blob_url(remote)?;
        url.query_pairs_mut().append_pair("comp", "blocklist");

        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            body.push_str("<Latest>");
            body.push_str(id);
            body.push_str("</Latest>");
        }
        body.push_str("</BlockList>");

        let mut request = self.request(reqwest::Method::PUT, url);
        for (key, value) in metadata.iter() {
            request = request.header(format!("{}{}", METADATA_HEADER_PREFIX, key), value);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("CommitBlockList", e))?;
        check_response("CommitBlockList", response).await?;
        Ok(())
    }

    async fn uncommitted_block_list(&self, remote: &str) -> TransferResult<Vec<String>> {
        let mut url = self.blob_url(remote)?;
        url.query_pairs_mut()
            .append_pair("comp", "blocklist")
            .append_pair("blocklisttype", "uncommitted");
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| transport_error("GetBlockList", e))?;

        // A blob with no staged blocks does not exist yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_response("GetBlockList", response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("GetBlockList", e))?;
        Ok(parse_uncommitted_blocks(&body))
    }
}
