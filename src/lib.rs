#![forbid(unsafe_code)]
//! # shardseal: erasure-resistant, authenticated byte streams
//!
//! `shardseal` turns a byte stream into a self-describing container that
//! survives damage and, optionally, keeps its content secret. Two stages can
//! be switched on independently per stream:
//!
//! - **Resistance**: systematic Reed-Solomon over GF(2^8). Every chunk is cut
//!   into groups of `k` data pieces plus `m` parity pieces; any `m` pieces of a
//!   group may be lost or corrupted and the data still comes back.
//! - **Cipher**: password-based AEAD (XChaCha20-Poly1305 or AES-256-GCM-SIV)
//!   with an Argon2id-derived key. Chunks are sealed with STREAM-style nonces,
//!   so truncated, reordered or tampered streams fail authentication.
//!
//! Encryption runs before erasure coding on the way out and after
//! reconstruction on the way in. Everything the reader needs is stored in the
//! stream header; only the password has to be supplied again.
//!
//! ## Example: encode and decode a byte array
//! ```no_run
//! use shardseal::{CipherMode, CodecOptions, ResistMode, decode_bytes, encode_bytes};
//! use secrecy::SecretString;
//!
//! let opts = CodecOptions::default().with_password(SecretString::new("pw".into()));
//! let sealed =
//!     encode_bytes(b"Hello, world!", ResistMode::ReedSolomon, CipherMode::Aead, &opts).unwrap();
//! assert_eq!(decode_bytes(&sealed, &opts).unwrap(), b"Hello, world!");
//! ```
//!
//! ## Example: streaming
//! ```no_run
//! use std::io::{Read, Write};
//! use shardseal::{CipherMode, CodecOptions, ResistMode, StreamReader, StreamWriter};
//!
//! let opts = CodecOptions::default();
//! let mut w =
//!     StreamWriter::new(Vec::new(), ResistMode::ReedSolomon, CipherMode::None, &opts).unwrap();
//! w.write_all(b"payload").unwrap();
//! let bytes = w.finish().unwrap();
//!
//! let mut out = Vec::new();
//! StreamReader::new(bytes.as_slice(), &opts).unwrap().read_to_end(&mut out).unwrap();
//! ```
//!
//! Safety notes
//! - The crate is not audited or reviewed! Resistance protects against
//!   accidental damage, the cipher against tampering; neither replaces backups.

mod crypto;
mod erasure;
mod format;
mod kdf;
mod reader;
mod types;
mod writer;

pub use crypto::{AEAD_TAG_LEN, ChunkCipher};
pub use erasure::{MAX_TOTAL_PIECES, PieceCodec};
pub use format::{
    CipherHeader, MAGIC, PIECE_FRAME_OVERHEAD, RECORD_FRAME_OVERHEAD, ResistHeader, StreamHeader,
    VERSION, header_block_len,
};
pub use kdf::{derive_key_argon2id, validate_kdf_params};
pub use reader::StreamReader;
pub use types::*;
pub use writer::StreamWriter;

/// Encode `data` into a complete in-memory stream.
pub fn encode_bytes(
    data: &[u8],
    resist: ResistMode,
    cipher: CipherMode,
    opts: &CodecOptions,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = StreamWriter::new(Vec::new(), resist, cipher, opts)?;
    writer.append(data)?;
    writer.finish()
}

/// Decode a complete in-memory stream produced by [`encode_bytes`] or a
/// [`StreamWriter`].
pub fn decode_bytes(bytes: &[u8], opts: &CodecOptions) -> Result<Vec<u8>, CodecError> {
    let mut reader = StreamReader::new(bytes, opts)?;
    let mut out = Vec::new();
    while let Some(chunk) = reader.read_chunk()? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn fast_opts() -> CodecOptions {
        CodecOptions::default()
            .with_password(SecretString::new("pw".into()))
            .with_kdf_params(KdfParams {
                t_cost: 1,
                mem_kib: 64,
                parallelism: 1,
            })
    }

    #[test]
    fn round_trip_small_default() {
        let opts = fast_opts();
        let ct = encode_bytes(b"hi", ResistMode::default(), CipherMode::default(), &opts).unwrap();
        assert_eq!(decode_bytes(&ct, &opts).unwrap(), b"hi");
    }

    #[test]
    fn round_trip_plain_passthrough() {
        let opts = CodecOptions::default().with_chunk_size(7);
        let data = b"not encrypted, not coded";
        let out = encode_bytes(data, ResistMode::None, CipherMode::None, &opts).unwrap();
        assert_eq!(decode_bytes(&out, &opts).unwrap(), data);
    }

    #[test]
    fn decode_requires_password_for_sealed_stream() {
        let opts = fast_opts();
        let ct = encode_bytes(b"x", ResistMode::None, CipherMode::Aead, &opts).unwrap();
        let res = decode_bytes(&ct, &CodecOptions::default());
        assert!(matches!(res, Err(CodecError::MissingPassword)));
    }

    #[test]
    fn reader_and_writer_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<StreamWriter<Vec<u8>>>();
        assert_send::<StreamReader<&[u8]>>();
    }
}
