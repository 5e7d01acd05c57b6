//! On-wire encryption formats and their object metadata

use crate::model::error::{TransferError, TransferResult};
use crate::model::storage::BlobProperties;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// AES block size; all part sizes are multiples of this
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Metadata key carrying the legacy per-part-key format version
pub const META_FORMAT_VERSION: &str = "formatversion";
/// Metadata key advertising the streaming cipher layout
pub const META_STREAMING_FORMAT: &str = "streamingformat";
/// Metadata key holding the base64 initial IV (whole-file or chain start)
pub const META_IV: &str = "iv";
/// Metadata key holding the base64 file id used for HKDF key derivation
pub const META_FILE_ID: &str = "fileid";
/// Metadata key holding the decimal part size of HKDF-format objects
pub const META_PART_SIZE: &str = "partsize";

/// Value of [`META_STREAMING_FORMAT`] written by this engine
pub const STREAMING_FORMAT_CBC: &str = "cbc";

/// How a remote object was encrypted.
///
/// New uploads always produce [`ObjectFormat::CbcStreaming`]; the other two
/// variants exist so that objects written by older clients stay readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectFormat {
    /// Whole-file AES-CBC with PKCS#7, IV in metadata
    Legacy { iv: Vec<u8> },
    /// Per-part keys derived with HKDF(master, file id, part index); read-only
    HkdfStreaming { file_id: Vec<u8>, part_size: u64 },
    /// CBC chained across parts, PKCS#7 on the final part only
    CbcStreaming { initial_iv: Vec<u8> },
}

/// Determine the encryption format of a remote object from its metadata.
///
/// Metadata names arrive with back-end-specific casing and are matched
/// case-insensitively. Missing or undecodable fields are client errors:
/// the object cannot be decrypted, retrying will not help.
pub fn detect_format(properties: &BlobProperties) -> TransferResult<ObjectFormat> {
    let metadata = &properties.metadata;

    if let Some(streaming) = metadata.get(META_STREAMING_FORMAT) {
        if !streaming.eq_ignore_ascii_case(STREAMING_FORMAT_CBC) {
            return Err(TransferError::Fatal(format!(
                "unsupported streaming format {:?}",
                streaming
            )));
        }
        let initial_iv = decode_field(metadata.get(META_IV), META_IV)?;
        return Ok(ObjectFormat::CbcStreaming { initial_iv });
    }

    if let Some(version) = metadata.get(META_FORMAT_VERSION) {
        if version.trim() != "1" {
            return Err(TransferError::Fatal(format!(
                "unsupported format version {:?}",
                version
            )));
        }
        let file_id = decode_field(metadata.get(META_FILE_ID), META_FILE_ID)?;
        let part_size = metadata
            .get(META_PART_SIZE)
            .ok_or_else(|| missing_field(META_PART_SIZE))?
            .trim()
            .parse::<u64>()
            .map_err(|e| TransferError::Fatal(format!("invalid {}: {}", META_PART_SIZE, e)))?;
        if part_size == 0 {
            return Err(TransferError::Fatal(format!(
                "invalid {}: must be positive",
                META_PART_SIZE
            )));
        }
        return Ok(ObjectFormat::HkdfStreaming { file_id, part_size });
    }

    let iv = decode_field(metadata.get(META_IV), META_IV)?;
    Ok(ObjectFormat::Legacy { iv })
}

fn decode_field(value: Option<&str>, name: &str) -> TransferResult<Vec<u8>> {
    let raw = value.ok_or_else(|| missing_field(name))?;
    BASE64
        .decode(raw.trim())
        .map_err(|e| TransferError::Fatal(format!("invalid {}: {}", name, e)))
}

fn missing_field(name: &str) -> TransferError {
    TransferError::Fatal(format!("object metadata is missing {}", name))
}

/// Exact ciphertext length of a PKCS#7-padded CBC encryption of `plaintext_size`
/// bytes. Padding always adds at least one byte, so a block-aligned input grows
/// by a full block.
pub fn encrypted_size(plaintext_size: u64) -> u64 {
    (plaintext_size / CIPHER_BLOCK_SIZE as u64 + 1) * CIPHER_BLOCK_SIZE as u64
}

/// Whether `encrypted` is a plausible ciphertext length for `plaintext` bytes
/// of input. PKCS#7 adds between 1 and 16 bytes; resume validation must accept
/// the whole range, not a single value, or block-aligned files are needlessly
/// re-transferred.
pub fn encrypted_size_matches(plaintext: u64, encrypted: u64) -> bool {
    encrypted >= plaintext + 1 && encrypted <= plaintext + CIPHER_BLOCK_SIZE as u64
}
