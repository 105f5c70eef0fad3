//! Key derivation functionality with security validations.
//!
//! This module provides password-based key derivation using Argon2id. The
//! parameters travel in the stream header, so the reader validates them as
//! untrusted input before spending memory on them.
//!
//! # Security Guidelines
//!
//! - Use `SecretString` from the `secrecy` crate for password storage
//! - Derived keys are returned as `Zeroizing` and wiped on drop
//! - Ensure salts are cryptographically random and unique per stream

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::types::{CodecError, KdfParams};

/// Length of derived keys in bytes.
pub const KEY_LEN: usize = 32;

/// Minimum time cost for Argon2id.
const MIN_TIME_COST: u32 = 1;

/// Upper bound on the memory cost a header may request (4 GiB).
const MAX_MEMORY_COST_KIB: u32 = 4 * 1024 * 1024;

/// Upper bound on the time cost a header may request.
const MAX_TIME_COST: u32 = 64;

/// Maximum parallelism accepted from a header.
const MAX_PARALLELISM: u32 = 64;

/// Minimum salt length (8 bytes).
pub(crate) const MIN_SALT_LENGTH: usize = 8;

/// Validate Argon2id parameters without deriving anything.
///
/// The writer calls this at construction, the reader calls it on the header
/// contents, so a hostile header cannot request an unbounded amount of work.
pub fn validate_kdf_params(params: &KdfParams) -> Result<(), CodecError> {
    if params.t_cost < MIN_TIME_COST || params.t_cost > MAX_TIME_COST {
        return Err(CodecError::InvalidParameters(
            "kdf: time cost must be between 1 and 64",
        ));
    }
    if params.parallelism == 0 || params.parallelism > MAX_PARALLELISM {
        return Err(CodecError::InvalidParameters(
            "kdf: parallelism must be between 1 and 64",
        ));
    }
    // Argon2 requires at least 8 KiB per lane.
    if params.mem_kib < 8 * params.parallelism {
        return Err(CodecError::InvalidParameters(
            "kdf: memory cost must be at least 8 KiB per lane",
        ));
    }
    if params.mem_kib > MAX_MEMORY_COST_KIB {
        return Err(CodecError::InvalidParameters(
            "kdf: memory cost must not exceed 4 GiB",
        ));
    }
    Ok(())
}

/// Derive a 32-byte key from a password using Argon2id.
///
/// Deterministic for identical `(password, params, salt)`; a different salt
/// yields an unrelated key.
///
/// # Errors
///
/// - `CodecError::MissingPassword` if the password is empty
/// - `CodecError::InvalidParameters` if the salt is shorter than 8 bytes or the
///   parameters fail [`validate_kdf_params`]
/// - `CodecError::Crypto` if the Argon2 backend fails
pub fn derive_key_argon2id(
    password: &SecretString,
    params: &KdfParams,
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CodecError> {
    if password.expose_secret().is_empty() {
        return Err(CodecError::MissingPassword);
    }
    if salt.len() < MIN_SALT_LENGTH {
        return Err(CodecError::InvalidParameters(
            "kdf: salt must be at least 8 bytes",
        ));
    }
    validate_kdf_params(params)?;

    let argon_params = Params::new(params.mem_kib, params.t_cost, params.parallelism, Some(KEY_LEN))
        .map_err(|_| CodecError::InvalidParameters("kdf: invalid Argon2 params"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, out.as_mut())
        .map_err(|_| CodecError::Crypto)?;
    Ok(out)
}
