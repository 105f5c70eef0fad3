//! Core types and enums for shardseal.

use std::io;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default size of one encoded data piece (bytes).
pub const DEFAULT_PIECE_SIZE: usize = 508;

/// Default number of data pieces per group (`k`).
pub const DEFAULT_DATA_PIECES: usize = 8;

/// Default number of parity pieces per group (`m`).
pub const DEFAULT_PARITY_PIECES: usize = 1;

/// Default plaintext chunk size for the cipher layer (256 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Resistance layer selected by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResistMode {
    /// Records are written as-is.
    None,
    /// Records are Reed-Solomon coded into `k + m` pieces per group.
    #[default]
    ReedSolomon,
}

/// Cipher layer selected by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherMode {
    /// Chunks pass through unencrypted.
    None,
    /// Each chunk is sealed with an AEAD under a password-derived key.
    #[default]
    Aead,
}

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AeadAlg {
    /// XChaCha20-Poly1305 (24-byte nonces, 19-byte stream prefix).
    #[default]
    XChaCha20Poly1305 = 1,
    /// AES-256-GCM-SIV (12-byte nonces, 7-byte stream prefix).
    Aes256GcmSiv = 2,
}

impl TryFrom<u8> for AeadAlg {
    type Error = CodecError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(AeadAlg::XChaCha20Poly1305),
            2 => Ok(AeadAlg::Aes256GcmSiv),
            other => Err(CodecError::UnsupportedAead(other)),
        }
    }
}

/// Supported password KDFs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum KdfAlg {
    #[default]
    Argon2id = 1,
}

impl TryFrom<u8> for KdfAlg {
    type Error = CodecError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(KdfAlg::Argon2id),
            other => Err(CodecError::UnsupportedKdf(other)),
        }
    }
}

/// Tunable KDF parameters (mem_kib in KiB). Stored in the stream header.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub t_cost: u32,
    pub mem_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            t_cost: 3,
            mem_kib: 64 * 1024,
            parallelism: (num_cpus::get() as u32).clamp(1, 4),
        }
    }
}

/// Writer-side knobs plus the password used by both writer and reader.
///
/// Mode selection is not part of the options: the writer takes it explicitly
/// and the reader learns it from the stream header.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Size of each data piece in bytes.
    pub piece_size: usize,
    /// Data pieces per group (`k`).
    pub data_pieces: usize,
    /// Parity pieces per group (`m`).
    pub parity_pieces: usize,
    /// Plaintext bytes per chunk when the cipher layer is active.
    pub chunk_size: usize,
    /// Password for the cipher layer.
    pub password: Option<SecretString>,
    pub alg: AeadAlg,
    pub kdf: KdfAlg,
    pub kdf_params: KdfParams,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            data_pieces: DEFAULT_DATA_PIECES,
            parity_pieces: DEFAULT_PARITY_PIECES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            password: None,
            alg: AeadAlg::default(),
            kdf: KdfAlg::default(),
            kdf_params: KdfParams::default(),
        }
    }
}

impl CodecOptions {
    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_pieces(
        mut self,
        piece_size: usize,
        data_pieces: usize,
        parity_pieces: usize,
    ) -> Self {
        self.piece_size = piece_size;
        self.data_pieces = data_pieces;
        self.parity_pieces = parity_pieces;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_kdf_params(mut self, kdf_params: KdfParams) -> Self {
        self.kdf_params = kdf_params;
        self
    }
}

/// Coarse classification of a [`CodecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected writer/reader configuration, before any I/O.
    Configuration,
    /// Unrecognized or malformed header or framing.
    Format,
    /// Authentication failure or data loss beyond the erasure budget.
    Integrity,
    /// Failure of the underlying sink or source.
    Io,
    /// Misuse of the API (e.g. writing after close).
    Usage,
}

/// Library error type (no panics for expected failures).
#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("a non-empty password is required when the cipher layer is active")]
    MissingPassword,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported AEAD algorithm id {0}")]
    UnsupportedAead(u8),
    #[error("unsupported KDF algorithm id {0}")]
    UnsupportedKdf(u8),
    #[error("malformed stream: {0}")]
    Malformed(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("authentication failed (wrong password or tampered data)")]
    AuthenticationFailed,
    #[error("insufficient pieces: need {needed}, got {got}")]
    InsufficientPieces { needed: usize, got: usize },
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(usize),
    #[error("malformed piece: expected {expected} bytes, got {got}")]
    MalformedPiece { expected: usize, got: usize },
    #[error("unrecoverable group {group}: {valid} valid pieces, need {needed}")]
    UnrecoverableChunk { group: u64, valid: usize, needed: usize },
    #[error("stream already closed")]
    StreamClosed,
    #[error("cryptographic backend failure")]
    Crypto,
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Io(_) => ErrorKind::Io,
            CodecError::InvalidParameters(_) | CodecError::MissingPassword => {
                ErrorKind::Configuration
            }
            CodecError::UnsupportedVersion(_)
            | CodecError::UnsupportedAead(_)
            | CodecError::UnsupportedKdf(_)
            | CodecError::Malformed(_)
            | CodecError::Serialization(_) => ErrorKind::Format,
            CodecError::AuthenticationFailed
            | CodecError::InsufficientPieces { .. }
            | CodecError::InvalidPieceIndex(_)
            | CodecError::MalformedPiece { .. }
            | CodecError::UnrecoverableChunk { .. }
            | CodecError::Crypto => ErrorKind::Integrity,
            CodecError::StreamClosed => ErrorKind::Usage,
        }
    }

    /// Recover the codec error carried inside an `io::Error` produced by the
    /// `Read`/`Write` implementations.
    pub fn from_io(err: &io::Error) -> Option<&CodecError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<CodecError>())
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(inner) => inner,
            other => {
                let kind = match other.kind() {
                    ErrorKind::Configuration | ErrorKind::Usage => io::ErrorKind::InvalidInput,
                    ErrorKind::Format | ErrorKind::Integrity | ErrorKind::Io => {
                        io::ErrorKind::InvalidData
                    }
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        CodecError::Serialization(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        CodecError::Serialization(err.to_string())
    }
}
