//! Streaming AES-256-CBC encryption of fixed-size parts
//!
//! Parts are chained: the IV of part `i+1` is the last ciphertext block of
//! part `i`, so the concatenated parts equal a single CBC encryption of the
//! whole plaintext. PKCS#7 padding is applied to the final part only and
//! always adds between 1 and 16 bytes. Encryption is strictly sequential;
//! the chaining makes parallel part encryption impossible by construction.
//!
//! The legacy read paths live here too: whole-file CBC (v0) and the retired
//! per-part-key HKDF layout (v1), which new uploads never produce.

use crate::model::error::{TransferError, TransferResult};
use crate::model::format::CIPHER_BLOCK_SIZE;
use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = CIPHER_BLOCK_SIZE;

fn fatal(msg: impl Into<String>) -> TransferError {
    TransferError::Fatal(msg.into())
}

fn check_part_size(part_size: usize) -> TransferResult<()> {
    if part_size == 0 || part_size % CIPHER_BLOCK_SIZE != 0 {
        return Err(fatal(format!(
            "part size {} is not a positive multiple of {}",
            part_size, CIPHER_BLOCK_SIZE
        )));
    }
    Ok(())
}

fn to_key(bytes: &[u8]) -> TransferResult<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| fatal(format!("key must be {} bytes, got {}", KEY_LEN, bytes.len())))
}

fn to_iv(bytes: &[u8]) -> TransferResult<[u8; IV_LEN]> {
    bytes
        .try_into()
        .map_err(|_| fatal(format!("iv must be {} bytes, got {}", IV_LEN, bytes.len())))
}

/// Sequential encryption state for a streaming upload
pub struct StreamingEncryptionState {
    master_key: [u8; KEY_LEN],
    initial_iv: [u8; IV_LEN],
    current_iv: [u8; IV_LEN],
    part_size: usize,
    next_part: u64,
    finalized: bool,
}

impl StreamingEncryptionState {
    /// Fresh state with a random master key and initial IV
    pub fn new(part_size: usize) -> TransferResult<Self> {
        check_part_size(part_size)?;
        let mut master_key = [0u8; KEY_LEN];
        let mut initial_iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut master_key);
        rand::thread_rng().fill_bytes(&mut initial_iv);
        Ok(StreamingEncryptionState {
            master_key,
            initial_iv,
            current_iv: initial_iv,
            part_size,
            next_part: 0,
            finalized: false,
        })
    }

    /// Restore state mid-stream from a resume sidecar
    pub fn from_resume(
        master_key: &[u8],
        initial_iv: &[u8],
        current_iv: &[u8],
        part_size: usize,
        next_part: u64,
    ) -> TransferResult<Self> {
        check_part_size(part_size)?;
        Ok(StreamingEncryptionState {
            master_key: to_key(master_key)?,
            initial_iv: to_iv(initial_iv)?,
            current_iv: to_iv(current_iv)?,
            part_size,
            next_part,
            finalized: false,
        })
    }

    pub fn master_key(&self) -> &[u8; KEY_LEN] {
        &self.master_key
    }

    pub fn initial_iv(&self) -> &[u8; IV_LEN] {
        &self.initial_iv
    }

    pub fn current_iv(&self) -> &[u8; IV_LEN] {
        &self.current_iv
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    pub fn next_part(&self) -> u64 {
        self.next_part
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Encrypt the next part in sequence.
    ///
    /// Non-final parts must be exactly `part_size` bytes; the final part may
    /// be shorter (or empty, yielding a pure padding block) and latches the
    /// state so further calls fail.
    pub fn encrypt_part(&mut self, plaintext: &[u8], is_final: bool) -> TransferResult<Vec<u8>> {
        if self.finalized {
            return Err(fatal("encrypt called after the final part"));
        }
        if !is_final && plaintext.len() != self.part_size {
            return Err(fatal(format!(
                "part {} must be {} bytes, got {}; parts must be encrypted in order",
                self.next_part,
                self.part_size,
                plaintext.len()
            )));
        }
        if is_final && plaintext.len() > self.part_size {
            return Err(fatal(format!(
                "final part exceeds part size: {} > {}",
                plaintext.len(),
                self.part_size
            )));
        }

        let encryptor = Aes256CbcEnc::new(&self.master_key.into(), &self.current_iv.into());
        let ciphertext = if is_final {
            encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            encryptor.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };

        if is_final {
            self.finalized = true;
        } else {
            self.current_iv
                .copy_from_slice(&ciphertext[ciphertext.len() - IV_LEN..]);
        }
        self.next_part += 1;
        Ok(ciphertext)
    }
}

/// Sequential decryption state for a streaming (v2) download
pub struct StreamingDecryptionState {
    master_key: [u8; KEY_LEN],
    current_iv: [u8; IV_LEN],
}

impl StreamingDecryptionState {
    pub fn new(master_key: &[u8], initial_iv: &[u8]) -> TransferResult<Self> {
        Ok(StreamingDecryptionState {
            master_key: to_key(master_key)?,
            current_iv: to_iv(initial_iv)?,
        })
    }

    /// Decrypt the next ciphertext part in order.
    ///
    /// Non-final parts must be block aligned; the final part strips PKCS#7.
    pub fn decrypt_part(&mut self, ciphertext: &[u8], is_final: bool) -> TransferResult<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(fatal(format!(
                "ciphertext part length {} is not a block multiple",
                ciphertext.len()
            )));
        }
        let next_iv = to_iv(&ciphertext[ciphertext.len() - IV_LEN..])?;
        let decryptor = Aes256CbcDec::new(&self.master_key.into(), &self.current_iv.into());
        let plaintext = if is_final {
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| fatal("invalid padding in final part"))?
        } else {
            decryptor
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
                .map_err(|_| fatal("block-aligned decrypt failed"))?
        };
        self.current_iv = next_iv;
        Ok(plaintext)
    }
}

/// One-shot whole-file CBC encryption (the v0 layout). New uploads never use
/// this; it exists for the legacy read path and its tests.
pub fn encrypt_legacy(key: &[u8], iv: &[u8], plaintext: &[u8]) -> TransferResult<Vec<u8>> {
    let encryptor = Aes256CbcEnc::new(&to_key(key)?.into(), &to_iv(iv)?.into());
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// One-shot whole-file CBC decryption (the v0 layout)
pub fn decrypt_legacy(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> TransferResult<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % CIPHER_BLOCK_SIZE != 0 {
        return Err(fatal("legacy ciphertext is not a block multiple"));
    }
    let decryptor = Aes256CbcDec::new(&to_key(key)?.into(), &to_iv(iv)?.into());
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| fatal("invalid padding in legacy ciphertext"))
}

/// Per-part key of the retired HKDF layout: HKDF-SHA256 with the file id as
/// salt and `block-<index>` as the info string
pub fn derive_hkdf_part_key(
    master_key: &[u8],
    file_id: &[u8],
    part_index: u64,
) -> TransferResult<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(Some(file_id), master_key);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(format!("block-{}", part_index).as_bytes(), &mut okm)
        .map_err(|e| fatal(format!("hkdf expand failed: {}", e)))?;
    Ok(okm)
}

/// Decrypt one part of an HKDF-format (v1) object. Each encrypted part is a
/// random IV followed by an independently padded CBC ciphertext.
pub fn decrypt_part_hkdf(
    master_key: &[u8],
    file_id: &[u8],
    part_index: u64,
    encrypted_part: &[u8],
) -> TransferResult<Vec<u8>> {
    if encrypted_part.len() < IV_LEN + CIPHER_BLOCK_SIZE {
        return Err(fatal(format!(
            "hkdf part {} too short: {} bytes",
            part_index,
            encrypted_part.len()
        )));
    }
    let (iv, ciphertext) = encrypted_part.split_at(IV_LEN);
    let part_key = derive_hkdf_part_key(master_key, file_id, part_index)?;
    decrypt_legacy(&part_key, iv, ciphertext)
}

/// Encrypt one HKDF-format part. Kept for the read-path tests; the engine
/// never writes this layout.
pub fn encrypt_part_hkdf(
    master_key: &[u8],
    file_id: &[u8],
    part_index: u64,
    plaintext: &[u8],
) -> TransferResult<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let part_key = derive_hkdf_part_key(master_key, file_id, part_index)?;
    let mut out = iv.to_vec();
    out.extend_from_slice(&encrypt_legacy(&part_key, &iv, plaintext)?);
    Ok(out)
}
