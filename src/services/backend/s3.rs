//! S3 back end mapping block staging onto multipart uploads
//!
//! Block identifiers carry their index, which becomes the part number.
//! Multipart sessions are created lazily and re-adopted from the service on
//! resume, so a restart can keep staging into the same upload id.

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::{BlobProperties, StorageMetadata};
use crate::services::backend::{block_id_for_index, block_index_from_id, BlobBackend, ByteStream};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::Mutex;

struct MultipartSession {
    upload_id: String,
    etags: HashMap<i32, String>,
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    sessions: Mutex<HashMap<String, MultipartSession>>,
}

fn sdk_error<E>(operation: &str, err: SdkError<E>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().meta().code().unwrap_or("ServiceError");
            let message = ctx.err().meta().message().unwrap_or("");
            TransferError::from_http_status(status, format!("{}: {} {}", operation, code, message))
        }
        SdkError::TimeoutError(_) => {
            TransferError::Transient(format!("{}: request timed out", operation))
        }
        SdkError::DispatchFailure(failure) => {
            TransferError::Transient(format!("{}: dispatch failure: {:?}", operation, failure))
        }
        _ => TransferError::Transient(format!("{}: {}", operation, err)),
    }
}

fn body_stream(body: aws_sdk_s3::primitives::ByteStream) -> ByteStream {
    let stream = futures::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        match body.try_next().await {
            Ok(Some(bytes)) => Some((Ok(bytes), Some(body))),
            Ok(None) => None,
            Err(e) => Some((
                Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
                None,
            )),
        }
    });
    Box::pin(stream)
}

fn part_number_for_id(block_id: &str) -> TransferResult<i32> {
    let index = block_index_from_id(block_id).ok_or_else(|| {
        TransferError::Fatal(format!("unrecognized block identifier {:?}", block_id))
    })?;
    i32::try_from(index + 1)
        .map_err(|_| TransferError::Fatal(format!("block index {} out of range", index)))
}

impl S3Backend {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        S3Backend {
            client,
            bucket: bucket.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// All parts of an in-flight multipart upload, paging past the 1000-part
    /// response limit
    async fn load_parts(&self, remote: &str, upload_id: &str) -> TransferResult<HashMap<i32, String>> {
        let mut etags = HashMap::new();
        let mut marker: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(remote)
                .upload_id(upload_id);
            if let Some(marker) = &marker {
                request = request.part_number_marker(marker);
            }
            let response = request
                .send()
                .await
                .map_err(|e| sdk_error("GetBlockList", e))?;
            for part in response.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    etags.insert(number, etag.to_string());
                }
            }
            if response.is_truncated().unwrap_or(false) {
                marker = response.next_part_number_marker().map(String::from);
            } else {
                break;
            }
        }
        Ok(etags)
    }

    /// Find an in-flight multipart upload for `remote` left by an earlier run
    async fn find_remote_session(&self, remote: &str) -> TransferResult<Option<MultipartSession>> {
        let response = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(remote)
            .send()
            .await
            .map_err(|e| sdk_error("GetBlockList", e))?;
        let upload_id = response
            .uploads()
            .iter()
            .filter(|u| u.key() == Some(remote))
            .last()
            .and_then(|u| u.upload_id())
            .map(String::from);
        match upload_id {
            Some(upload_id) => {
                let etags = self.load_parts(remote, &upload_id).await?;
                Ok(Some(MultipartSession { upload_id, etags }))
            }
            None => Ok(None),
        }
    }

    /// Upload id for `remote`, adopting the in-flight upload when this
    /// client instance has not seen it (credential rotation, restart)
    async fn session_upload_id(&self, remote: &str) -> TransferResult<String> {
        if let Some(id) = self
            .sessions
            .lock()
            .await
            .get(remote)
            .map(|s| s.upload_id.clone())
        {
            return Ok(id);
        }
        let session = self.find_remote_session(remote).await?.ok_or_else(|| {
            TransferError::Fatal(format!("no block upload in progress for {}", remote))
        })?;
        let id = session.upload_id.clone();
        self.sessions.lock().await.insert(remote.to_string(), session);
        Ok(id)
    }
}

#[async_trait::async_trait]
impl BlobBackend for S3Backend {
    async fn get_properties(&self, remote: &str) -> TransferResult<BlobProperties> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(remote)
            .send()
            .await
            .map_err(|e| sdk_error("GetBlobProperties", e))?;

        let mut metadata = StorageMetadata::new();
        if let Some(raw) = response.metadata() {
            for (key, value) in raw {
                metadata.insert(key, value.clone());
            }
        }
        Ok(BlobProperties {
            content_length: response.content_length().unwrap_or(0).max(0) as u64,
            etag: response.e_tag().unwrap_or_default().to_string(),
            metadata,
        })
    }

    async fn download_range(
        &self,
        remote: &str,
        offset: u64,
        count: Option<u64>,
    ) -> TransferResult<ByteStream> {
        let range = match count {
            Some(count) if count > 0 => format!("bytes={}-{}", offset, offset + count - 1),
            _ => format!("bytes={}-", offset),
        };
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(remote)
            .range(range)
            .send()
            .await
            .map_err(|e| sdk_error("DownloadRange", e))?;
        Ok(body_stream(response.body))
    }

    async fn create_block_upload(
        &self,
        remote: &str,
        metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(remote) {
            return Ok(());
        }
        drop(sessions);

        // Adopt an interrupted upload before starting a fresh one
        let session = match self.find_remote_session(remote).await? {
            Some(session) => session,
            None => {
                let mut request = self
                    .client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(remote);
                for (key, value) in metadata.iter() {
                    request = request.metadata(key, value);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| sdk_error("CreateBlockUpload", e))?;
                let upload_id = response
                    .upload_id()
                    .ok_or_else(|| {
                        TransferError::Fatal("no upload id returned for multipart upload".into())
                    })?
                    .to_string();
                MultipartSession {
                    upload_id,
                    etags: HashMap::new(),
                }
            }
        };

        self.sessions
            .lock()
            .await
            .insert(remote.to_string(), session);
        Ok(())
    }

    async fn stage_block(&self, remote: &str, block_id: &str, data: Bytes) -> TransferResult<()> {
        let part_number = part_number_for_id(block_id)?;
        let upload_id = self.session_upload_id(remote).await?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(remote)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("StageBlock", e))?;

        let etag = response.e_tag().unwrap_or_default().to_string();
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(remote) {
            session.etags.insert(part_number, etag);
        }
        Ok(())
    }

    async fn commit_block_list(
        &self,
        remote: &str,
        block_ids: &[String],
        _metadata: &StorageMetadata,
    ) -> TransferResult<()> {
        let upload_id = self.session_upload_id(remote).await?;
        let mut etags = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(remote)
                .map(|s| s.etags.clone())
                .unwrap_or_default()
        };

        // A resumed upload may have parts staged by an earlier process
        if block_ids
            .iter()
            .any(|id| part_number_for_id(id).map(|n| !etags.contains_key(&n)).unwrap_or(true))
        {
            etags.extend(self.load_parts(remote, &upload_id).await?);
        }

        let mut parts = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            let part_number = part_number_for_id(id)?;
            let etag = etags.get(&part_number).ok_or_else(|| {
                TransferError::Fatal(format!("block {} was never staged", id))
            })?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(remote)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("CommitBlockList", e))?;

        self.sessions.lock().await.remove(remote);
        Ok(())
    }

    async fn uncommitted_block_list(&self, remote: &str) -> TransferResult<Vec<String>> {
        let etags = {
            let sessions = self.sessions.lock().await;
            sessions.get(remote).map(|s| s.etags.clone())
        };
        let etags = match etags {
            Some(etags) => etags,
            None => match self.find_remote_session(remote).await? {
                Some(session) => session.etags,
                None => return Ok(Vec::new()),
            },
        };

        let mut numbers: Vec<i32> = etags.keys().copied().collect();
        numbers.sort_unstable();
        Ok(numbers
            .into_iter()
            .map(|n| block_id_for_index((n - 1) as u64))
            .collect())
    }
}
