//! Chunk-level authenticated encryption.
//!
//! Every chunk of a stream is sealed independently under one derived key.
//! Nonces follow the STREAM layout `prefix || counter_be32 || last_flag`:
//! the prefix is random per stream, the counter is the chunk index and is
//! owned by the [`ChunkCipher`], and the last flag marks the final chunk so
//! that truncation and reordering fail authentication.

use aes_gcm_siv::Aes256GcmSiv;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use getrandom::fill as getrandom;

use crate::kdf::KEY_LEN;
use crate::types::{AeadAlg, CodecError};

/// AEAD authentication tag length (16 bytes for all supported algorithms).
pub const AEAD_TAG_LEN: usize = 16;

/// Length of the per-stream KDF salt.
pub const SALT_LEN: usize = 16;

/// Length of the associated data bound into every chunk (a BLAKE3 digest).
pub const AAD_LEN: usize = 32;

/// Get the nonce length for a given AEAD algorithm.
pub fn nonce_len_for(alg: AeadAlg) -> usize {
    match alg {
        AeadAlg::XChaCha20Poly1305 => 24,
        AeadAlg::Aes256GcmSiv => 12,
    }
}

/// Length of the random nonce prefix: the nonce minus a 4-byte counter and a 1-byte flag.
pub fn nonce_prefix_len_for(alg: AeadAlg) -> usize {
    nonce_len_for(alg) - 5
}

/// Generate a cryptographically secure random salt.
pub fn generate_salt() -> Result<Vec<u8>, CodecError> {
    let mut salt = vec![0u8; SALT_LEN];
    getrandom(&mut salt).map_err(|_| CodecError::Crypto)?;
    Ok(salt)
}

/// Generate a random nonce prefix for the given algorithm.
pub fn generate_nonce_prefix(alg: AeadAlg) -> Result<Vec<u8>, CodecError> {
    let mut prefix = vec![0u8; nonce_prefix_len_for(alg)];
    getrandom(&mut prefix).map_err(|_| CodecError::Crypto)?;
    Ok(prefix)
}

/// Build the nonce for chunk `counter`.
pub fn chunk_nonce(prefix: &[u8], counter: u32, is_final: bool) -> Vec<u8> {
    let mut nonce = Vec::with_capacity(prefix.len() + 5);
    nonce.extend_from_slice(prefix);
    nonce.extend_from_slice(&counter.to_be_bytes());
    nonce.push(u8::from(is_final));
    nonce
}

enum Backend {
    XChaCha20Poly1305(XChaCha20Poly1305),
    Aes256GcmSiv(Aes256GcmSiv),
}

/// Seals or opens the chunks of one stream, in order.
///
/// One instance belongs to exactly one writer or reader; the chunk counter
/// only moves forward and sealing past the final chunk is refused, so a nonce
/// is never used twice under the same key.
pub struct ChunkCipher {
    backend: Backend,
    nonce_prefix: Vec<u8>,
    aad: [u8; AAD_LEN],
    counter: u32,
    exhausted: bool,
    done: bool,
}

impl ChunkCipher {
    /// Create a cipher for one stream.
    ///
    /// `aad` is bound into every chunk; the codec passes the digest of the
    /// stream header.
    pub fn new(
        alg: AeadAlg,
        key: &[u8; KEY_LEN],
        nonce_prefix: &[u8],
        aad: [u8; AAD_LEN],
    ) -> Result<Self, CodecError> {
        if nonce_prefix.len() != nonce_prefix_len_for(alg) {
            return Err(CodecError::InvalidParameters(
                "nonce prefix length does not match the AEAD algorithm",
            ));
        }
        let backend = match alg {
            AeadAlg::XChaCha20Poly1305 => Backend::XChaCha20Poly1305(
                XChaCha20Poly1305::new_from_slice(key).map_err(|_| CodecError::Crypto)?,
            ),
            AeadAlg::Aes256GcmSiv => Backend::Aes256GcmSiv(
                Aes256GcmSiv::new_from_slice(key).map_err(|_| CodecError::Crypto)?,
            ),
        };
        Ok(Self {
            backend,
            nonce_prefix: nonce_prefix.to_vec(),
            aad,
            counter: 0,
            exhausted: false,
            done: false,
        })
    }

    /// Index of the next chunk to be sealed or opened.
    pub fn chunk_index(&self) -> u32 {
        self.counter
    }

    fn nonce_for_next(&self, is_final: bool) -> Result<Vec<u8>, CodecError> {
        if self.done {
            return Err(CodecError::StreamClosed);
        }
        if self.exhausted {
            return Err(CodecError::InvalidParameters(
                "stream exceeds the 32-bit chunk counter",
            ));
        }
        Ok(chunk_nonce(&self.nonce_prefix, self.counter, is_final))
    }

    fn advance(&mut self, is_final: bool) {
        match self.counter.checked_add(1) {
            Some(next) => self.counter = next,
            None => self.exhausted = true,
        }
        self.done = is_final;
    }

    /// Encrypt one chunk, returning ciphertext with the tag appended.
    pub fn seal(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, CodecError> {
        let nonce = self.nonce_for_next(is_final)?;
        let payload = Payload {
            msg: plaintext,
            aad: &self.aad,
        };
        let sealed = match &self.backend {
            Backend::XChaCha20Poly1305(cipher) => {
                cipher.encrypt(XNonce::from_slice(&nonce), payload)
            }
            Backend::Aes256GcmSiv(cipher) => {
                cipher.encrypt(aes_gcm_siv::Nonce::from_slice(&nonce), payload)
            }
        }
        .map_err(|_| CodecError::Crypto)?;
        self.advance(is_final);
        Ok(sealed)
    }

    /// Decrypt and verify one chunk.
    ///
    /// Nothing is returned unless the tag verifies.
    pub fn open(&mut self, record: &[u8], is_final: bool) -> Result<Vec<u8>, CodecError> {
        if record.len() < AEAD_TAG_LEN {
            return Err(CodecError::AuthenticationFailed);
        }
        let nonce = self.nonce_for_next(is_final)?;
        let payload = Payload {
            msg: record,
            aad: &self.aad,
        };
        let opened = match &self.backend {
            Backend::XChaCha20Poly1305(cipher) => {
                cipher.decrypt(XNonce::from_slice(&nonce), payload)
            }
            Backend::Aes256GcmSiv(cipher) => {
                cipher.decrypt(aes_gcm_siv::Nonce::from_slice(&nonce), payload)
            }
        }
        .map_err(|_| CodecError::AuthenticationFailed)?;
        self.advance(is_final);
        Ok(opened)
    }
}
