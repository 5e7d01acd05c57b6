//! Integration tests for S3-compatible storage using MinIO
//!
//! These tests require Docker to be running. They spin up a MinIO container
//! and run the transfer engine against it through the S3 back end.
//!
//! Run with: cargo test --test s3_compat_tests -- --ignored

use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::minio::MinIO;
use tokio_util::sync::CancellationToken;
use vaultstream::model::storage::{StorageDescriptor, StorageKind};
use vaultstream::services::backend::s3::S3Backend;
use vaultstream::services::backend::{block_id_for_index, BlobBackend};
use vaultstream::services::blob_client::BlobClient;
use vaultstream::services::engine::{DownloadFileParams, TransferEngine, UploadFileParams};
use vaultstream::settings::credentials::{
    Credential, CredentialMaterial, CredentialScope, StaticCredentialSource,
};

const MINIO_ACCESS_KEY: &str = "minioadmin";
const MINIO_SECRET_KEY: &str = "minioadmin";
const TEST_BUCKET: &str = "transfer-test-bucket";

/// Start a MinIO container and build an S3 client against it
async fn setup_minio() -> (ContainerAsync<MinIO>, aws_sdk_s3::Client) {
    let container = MinIO::default()
        .start()
        .await
        .expect("Failed to start MinIO container");
    let port = container
        .get_host_port_ipv4(9000)
        .await
        .expect("Failed to get MinIO port");

    let credentials = aws_sdk_s3::config::Credentials::new(
        MINIO_ACCESS_KEY,
        MINIO_SECRET_KEY,
        None,
        None,
        "static",
    );
    let shared_config = aws_config::from_env()
        .credentials_provider(credentials)
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .endpoint_url(format!("http://127.0.0.1:{}", port))
        .load()
        .await;
    let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
        .force_path_style(true)
        .build();
    let client = aws_sdk_s3::Client::from_conf(s3_config);

    client
        .create_bucket()
        .bucket(TEST_BUCKET)
        .send()
        .await
        .expect("Failed to create bucket");

    (container, client)
}

fn engine_over(client: aws_sdk_s3::Client) -> TransferEngine {
    let backend = Arc::new(S3Backend::new(client, TEST_BUCKET));
    let descriptor = StorageDescriptor::new(StorageKind::S3Storage, TEST_BUCKET, None);
    let credential = Credential {
        material: CredentialMaterial::AccessKeys {
            access_key_id: MINIO_ACCESS_KEY.to_string(),
            secret_access_key: MINIO_SECRET_KEY.to_string(),
            session_token: None,
        },
        scope: CredentialScope::Default,
        expires_at: std::time::SystemTime::now() + std::time::Duration::from_secs(3600),
    };
    let source = Arc::new(StaticCredentialSource::new(credential));
    let blob_client =
        Arc::new(BlobClient::with_backend(descriptor, backend, source).unwrap());
    TransferEngine::new(blob_client)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 256) as u8).collect()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_minio_encrypted_roundtrip() {
    let (_container, client) = setup_minio().await;
    let engine = engine_over(client);
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let source = dir.path().join("data.bin");
    // several multipart parts at the S3 5 MiB minimum
    let data = payload(12 * 1024 * 1024);
    std::fs::write(&source, &data).unwrap();

    let outcome = engine
        .upload_encrypted_file(
            &cancel,
            UploadFileParams {
                local_path: source.clone(),
                part_size: Some(5 * 1024 * 1024 + 16),
                ..Default::default()
            },
        )
        .await
        .expect("upload failed");

    let restored = dir.path().join("restored.bin");
    engine
        .download_encrypted_file(
            &cancel,
            DownloadFileParams {
                remote_path: outcome.object_key.clone(),
                local_path: restored.clone(),
                decryption_key: outcome.master_key.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("download failed");

    assert_eq!(std::fs::read(&restored).unwrap(), data);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_minio_properties_and_metadata() {
    let (_container, client) = setup_minio().await;
    let backend = S3Backend::new(client, TEST_BUCKET);
    let metadata = vaultstream::model::storage::StorageMetadata::from([
        ("streamingformat", "cbc"),
        ("iv", "AAAAAAAAAAAAAAAAAAAAAA=="),
    ]);

    backend
        .create_block_upload("meta-test", &metadata)
        .await
        .unwrap();
    let block = vec![7u8; 5 * 1024 * 1024];
    let ids = vec![block_id_for_index(0)];
    backend
        .stage_block("meta-test", &ids[0], Bytes::from(block.clone()))
        .await
        .unwrap();
    backend
        .commit_block_list("meta-test", &ids, &metadata)
        .await
        .unwrap();

    let properties = backend.get_properties("meta-test").await.unwrap();
    assert_eq!(properties.content_length, block.len() as u64);
    assert!(!properties.etag.is_empty());
    assert_eq!(properties.metadata.get("streamingformat"), Some("cbc"));
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_minio_uncommitted_blocks_survive_for_resume() {
    let (_container, client) = setup_minio().await;
    let backend = S3Backend::new(client.clone(), TEST_BUCKET);
    let metadata = vaultstream::model::storage::StorageMetadata::new();

    backend
        .create_block_upload("partial-test", &metadata)
        .await
        .unwrap();
    for index in 0..3u64 {
        backend
            .stage_block(
                "partial-test",
                &block_id_for_index(index),
                Bytes::from(vec![index as u8; 5 * 1024 * 1024]),
            )
            .await
            .unwrap();
    }

    // a fresh backend instance (as after a process restart) adopts the
    // in-flight upload and sees the staged parts
    let fresh = S3Backend::new(client, TEST_BUCKET);
    let uncommitted = fresh.uncommitted_block_list("partial-test").await.unwrap();
    assert_eq!(
        uncommitted,
        (0..3).map(block_id_for_index).collect::<Vec<_>>()
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_minio_ranged_reads() {
    let (_container, client) = setup_minio().await;
    let backend = S3Backend::new(client.clone(), TEST_BUCKET);

    let data = payload(1024 * 1024);
    client
        .put_object()
        .bucket(TEST_BUCKET)
        .key("range-test")
        .body(aws_sdk_s3::primitives::ByteStream::from(data.clone()))
        .send()
        .await
        .unwrap();

    let stream = backend
        .download_range("range-test", 1000, Some(4096))
        .await
        .unwrap();
    let bytes = vaultstream::services::backend::collect_stream(stream)
        .await
        .unwrap();
    assert_eq!(bytes, &data[1000..5096]);
}
