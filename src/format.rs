//! On-disk format structures and constants.
//!
//! Layout of a stream:
//!
//! ```text
//! MAGIC (8) | header_len u32 LE | header (CBOR) | BLAKE3(header) (32)
//! record frames or piece groups ...
//! ```
//!
//! Without the resistance layer every record is framed as
//! `flags u8 | len u32 BE | bytes`. With it, records are cut into groups of
//! `k + m` pieces, each framed as
//! `index u8 | flags u8 | data_len u32 BE | payload | crc32 u32 BE`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::crypto::{AEAD_TAG_LEN, nonce_prefix_len_for};
use crate::erasure::MAX_TOTAL_PIECES;
use crate::kdf::{MIN_SALT_LENGTH, validate_kdf_params};
use crate::types::{AeadAlg, CipherMode, CodecError, KdfAlg, KdfParams, ResistMode};

pub const MAGIC: &[u8; 8] = b"SHRDSEAL";
pub const VERSION: u16 = 1;

/// Upper bound on the encoded header.
pub const MAX_HEADER_LEN: usize = 64 * 1024;
/// Upper bound on a single piece.
pub const MAX_PIECE_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound on a chunk and on the data carried by one group.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024 * 1024;
const MAX_SALT_LENGTH: usize = 64;

/// Length of the header checksum trailer.
pub const HEADER_DIGEST_LEN: usize = 32;

/// Frame/group flag: last record of the stream.
pub const FLAG_FINAL: u8 = 0b01;
/// Group flag: last group of a record.
pub const FLAG_RECORD_END: u8 = 0b10;

/// Bytes a record frame adds in front of the record.
pub const RECORD_FRAME_OVERHEAD: usize = 5;
/// Bytes a piece frame adds around the payload.
pub const PIECE_FRAME_OVERHEAD: usize = 10;

/// Resistance parameters as persisted in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResistHeader {
    None,
    ReedSolomon {
        piece_size: u32,
        data_pieces: u16,
        parity_pieces: u16,
    },
}

/// Cipher parameters as persisted in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherHeader {
    None,
    Aead {
        aead_alg: u8,
        kdf_alg: u8,
        kdf_params: KdfParams,
        /// Per-stream KDF salt.
        salt: Vec<u8>,
        /// Random nonce prefix; the chunk counter and final flag complete it.
        nonce_prefix: Vec<u8>,
    },
}

/// Versioned stream header (CBOR-encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub version: u16,
    /// Plaintext bytes per chunk; every chunk but the last is exactly this long.
    pub chunk_size: u32,
    pub resist: ResistHeader,
    pub cipher: CipherHeader,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u16,
}

impl StreamHeader {
    pub fn new(chunk_size: u32, resist: ResistHeader, cipher: CipherHeader) -> Self {
        Self {
            version: VERSION,
            chunk_size,
            resist,
            cipher,
        }
    }

    pub fn resist_mode(&self) -> ResistMode {
        match self.resist {
            ResistHeader::None => ResistMode::None,
            ResistHeader::ReedSolomon { .. } => ResistMode::ReedSolomon,
        }
    }

    pub fn cipher_mode(&self) -> CipherMode {
        match self.cipher {
            CipherHeader::None => CipherMode::None,
            CipherHeader::Aead { .. } => CipherMode::Aead,
        }
    }

    /// Length of a full (non-final) record.
    pub fn full_record_len(&self) -> usize {
        match self.cipher {
            CipherHeader::None => self.chunk_size as usize,
            CipherHeader::Aead { .. } => self.chunk_size as usize + AEAD_TAG_LEN,
        }
    }

    /// Check that the parameters describe a stream this version can process.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.version != VERSION {
            return Err(CodecError::UnsupportedVersion(self.version));
        }
        let chunk_size = self.chunk_size as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CodecError::InvalidParameters(
                "chunk_size must be between 1 byte and 256 MiB",
            ));
        }

        if let ResistHeader::ReedSolomon {
            piece_size,
            data_pieces,
            parity_pieces,
        } = self.resist
        {
            let (piece_size, k, m) = (
                piece_size as usize,
                data_pieces as usize,
                parity_pieces as usize,
            );
            if piece_size == 0 || piece_size > MAX_PIECE_SIZE {
                return Err(CodecError::InvalidParameters(
                    "piece_size must be between 1 byte and 16 MiB",
                ));
            }
            if k == 0 || m == 0 || k + m > MAX_TOTAL_PIECES {
                return Err(CodecError::InvalidParameters(
                    "piece counts must satisfy k >= 1, m >= 1, k + m <= 256",
                ));
            }
            if piece_size * k > MAX_CHUNK_SIZE {
                return Err(CodecError::InvalidParameters(
                    "piece_size * data pieces must not exceed 256 MiB",
                ));
            }
            if matches!(self.cipher, CipherHeader::None) && chunk_size != piece_size * k {
                return Err(CodecError::InvalidParameters(
                    "chunk_size must equal piece_size * data pieces without a cipher",
                ));
            }
        }

        if let CipherHeader::Aead {
            aead_alg,
            kdf_alg,
            kdf_params,
            salt,
            nonce_prefix,
        } = &self.cipher
        {
            let alg = AeadAlg::try_from(*aead_alg)?;
            KdfAlg::try_from(*kdf_alg)?;
            validate_kdf_params(kdf_params)?;
            if salt.len() < MIN_SALT_LENGTH || salt.len() > MAX_SALT_LENGTH {
                return Err(CodecError::InvalidParameters(
                    "salt must be between 8 and 64 bytes",
                ));
            }
            if nonce_prefix.len() != nonce_prefix_len_for(alg) {
                return Err(CodecError::InvalidParameters(
                    "nonce prefix length does not match the AEAD algorithm",
                ));
            }
        }
        Ok(())
    }

    /// Serialize the header block to `w`, returning the header digest.
    ///
    /// No validation happens here; writers validate before calling.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<[u8; HEADER_DIGEST_LEN], CodecError> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)?;
        if body.len() > MAX_HEADER_LEN {
            return Err(CodecError::InvalidParameters("header too large"));
        }
        let digest = *blake3::hash(&body).as_bytes();

        w.write_all(MAGIC)?;
        w.write_all(&(body.len() as u32).to_le_bytes())?;
        w.write_all(&body)?;
        w.write_all(&digest)?;
        Ok(digest)
    }

    /// Parse and validate the header block, consuming exactly its bytes.
    ///
    /// The version is checked before anything else in the body, so a stream
    /// from a newer writer fails with [`CodecError::UnsupportedVersion`] even
    /// if its layout changed.
    pub fn read_from<R: Read>(mut r: R) -> Result<(Self, [u8; HEADER_DIGEST_LEN]), CodecError> {
        let mut magic = [0u8; 8];
        read_exact_or(&mut r, &mut magic, "truncated header")?;
        if &magic != MAGIC {
            return Err(CodecError::Malformed("bad magic"));
        }

        let mut len_le = [0u8; 4];
        read_exact_or(&mut r, &mut len_le, "truncated header")?;
        let len = u32::from_le_bytes(len_le) as usize;
        if len == 0 || len > MAX_HEADER_LEN {
            return Err(CodecError::Malformed("header length out of range"));
        }

        let mut body = vec![0u8; len];
        read_exact_or(&mut r, &mut body, "truncated header")?;
        let mut stored = [0u8; HEADER_DIGEST_LEN];
        read_exact_or(&mut r, &mut stored, "truncated header")?;

        let digest = *blake3::hash(&body).as_bytes();
        if digest != stored {
            return Err(CodecError::Malformed("header checksum mismatch"));
        }

        let probe: VersionProbe = ciborium::from_reader(body.as_slice())
            .map_err(|_| CodecError::Malformed("header is not valid CBOR"))?;
        if probe.version != VERSION {
            return Err(CodecError::UnsupportedVersion(probe.version));
        }
        let header: StreamHeader = ciborium::from_reader(body.as_slice())
            .map_err(|_| CodecError::Malformed("header fields do not decode"))?;
        header.validate()?;
        Ok((header, digest))
    }
}

/// Total encoded size of a header block with a body of `body_len` bytes.
pub fn header_block_len(body_len: usize) -> usize {
    MAGIC.len() + 4 + body_len + HEADER_DIGEST_LEN
}

/// Read until `buf` is full or the source ends; returns the bytes read.
pub(crate) fn read_fully<R: Read>(mut r: R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// `read_exact` where a short read is a format error, not an I/O error.
fn read_exact_or<R: Read>(r: R, buf: &mut [u8], what: &'static str) -> Result<(), CodecError> {
    if read_fully(r, buf)? != buf.len() {
        return Err(CodecError::Malformed(what));
    }
    Ok(())
}

/// Write a single framed record.
pub fn write_record_frame<W: Write>(
    mut w: W,
    record: &[u8],
    is_final: bool,
) -> Result<(), CodecError> {
    let flags = if is_final { FLAG_FINAL } else { 0 };
    w.write_all(&[flags])?;
    w.write_all(&(record.len() as u32).to_be_bytes())?;
    w.write_all(record)?;
    Ok(())
}

/// Read one framed record.
///
/// `full_len` is the exact length every non-final record must have; a final
/// record may be shorter but never longer.
pub fn read_record_frame<R: Read>(
    mut r: R,
    full_len: usize,
) -> Result<(Vec<u8>, bool), CodecError> {
    let mut head = [0u8; RECORD_FRAME_OVERHEAD];
    match read_fully(&mut r, &mut head)? {
        0 => return Err(CodecError::Malformed("truncated stream")),
        n if n < head.len() => return Err(CodecError::Malformed("truncated record frame")),
        _ => {}
    }
    let flags = head[0];
    if flags & !FLAG_FINAL != 0 {
        return Err(CodecError::Malformed("unknown record flags"));
    }
    let is_final = flags & FLAG_FINAL != 0;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > full_len || (!is_final && len != full_len) {
        return Err(CodecError::Malformed("record length out of range"));
    }
    let mut record = vec![0u8; len];
    read_exact_or(&mut r, &mut record, "truncated record")?;
    Ok((record, is_final))
}

/// Header fields repeated in every piece of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    pub flags: u8,
    /// Meaningful bytes in the group's `piece_size * k` data region.
    pub data_len: u32,
}

fn piece_crc(seq: u64, index: u8, info: GroupInfo, payload: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&seq.to_be_bytes());
    h.update(&[index, info.flags]);
    h.update(&info.data_len.to_be_bytes());
    h.update(payload);
    h.finalize()
}

/// Frame one piece of group `seq`.
pub fn encode_piece(seq: u64, index: u8, info: GroupInfo, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + PIECE_FRAME_OVERHEAD);
    out.push(index);
    out.push(info.flags);
    out.extend_from_slice(&info.data_len.to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&piece_crc(seq, index, info, payload).to_be_bytes());
    out
}

/// Check one framed piece expected at slot `index` of group `seq`.
///
/// Returns `None` when the piece is damaged or belongs elsewhere; the caller
/// treats it as an erasure.
pub fn decode_piece(seq: u64, index: u8, frame: &[u8]) -> Option<(GroupInfo, Vec<u8>)> {
    if frame.len() < PIECE_FRAME_OVERHEAD || frame[0] != index {
        return None;
    }
    let info = GroupInfo {
        flags: frame[1],
        data_len: u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]),
    };
    let crc_at = frame.len() - 4;
    let payload = &frame[6..crc_at];
    let stored = u32::from_be_bytes([
        frame[crc_at],
        frame[crc_at + 1],
        frame[crc_at + 2],
        frame[crc_at + 3],
    ]);
    if piece_crc(seq, index, info, payload) != stored {
        return None;
    }
    Some((info, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rs_header() -> StreamHeader {
        StreamHeader::new(
            1024,
            ResistHeader::ReedSolomon {
                piece_size: 256,
                data_pieces: 4,
                parity_pieces: 2,
            },
            CipherHeader::None,
        )
    }

    fn aead_header() -> StreamHeader {
        StreamHeader::new(
            64,
            ResistHeader::None,
            CipherHeader::Aead {
                aead_alg: AeadAlg::XChaCha20Poly1305 as u8,
                kdf_alg: KdfAlg::Argon2id as u8,
                kdf_params: KdfParams {
                    t_cost: 1,
                    mem_kib: 64,
                    parallelism: 1,
                },
                salt: vec![1u8; 16],
                nonce_prefix: vec![2u8; 19],
            },
        )
    }

    #[test]
    fn header_round_trip_consumes_exact_bytes() {
        for header in [rs_header(), aead_header()] {
            let mut buf = Vec::new();
            let digest = header.write_to(&mut buf).unwrap();
            buf.extend_from_slice(b"payload");

            let mut cur = Cursor::new(buf.as_slice());
            let (back, d2) = StreamHeader::read_from(&mut cur).unwrap();
            assert_eq!(back, header);
            assert_eq!(digest, d2);
            assert_eq!(cur.position() as usize, buf.len() - b"payload".len());
        }
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut buf = Vec::new();
        rs_header().write_to(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        let res = StreamHeader::read_from(buf.as_slice());
        assert!(matches!(res, Err(CodecError::Malformed("bad magic"))));
    }

    #[test]
    fn body_corruption_is_detected() {
        let mut buf = Vec::new();
        aead_header().write_to(&mut buf).unwrap();
        buf[20] ^= 0x01;
        let res = StreamHeader::read_from(buf.as_slice());
        assert!(matches!(res, Err(CodecError::Malformed("header checksum mismatch"))));
    }

    #[test]
    fn oversized_length_fails_closed() {
        let mut buf = Vec::new();
        rs_header().write_to(&mut buf).unwrap();
        buf[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let res = StreamHeader::read_from(buf.as_slice());
        assert!(matches!(res, Err(CodecError::Malformed("header length out of range"))));
    }

    #[test]
    fn truncated_header_is_malformed() {
        let mut buf = Vec::new();
        rs_header().write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let res = StreamHeader::read_from(buf.as_slice());
        assert!(matches!(res, Err(CodecError::Malformed("truncated header"))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut header = rs_header();
        header.version = 42;
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let res = StreamHeader::read_from(buf.as_slice());
        assert!(matches!(res, Err(CodecError::UnsupportedVersion(42))));
    }

    #[test]
    fn inconsistent_parameters_are_rejected() {
        let mut zero_k = rs_header();
        zero_k.resist = ResistHeader::ReedSolomon {
            piece_size: 256,
            data_pieces: 0,
            parity_pieces: 2,
        };
        assert!(matches!(zero_k.validate(), Err(CodecError::InvalidParameters(_))));

        let mut zero_piece = rs_header();
        zero_piece.resist = ResistHeader::ReedSolomon {
            piece_size: 0,
            data_pieces: 4,
            parity_pieces: 2,
        };
        assert!(matches!(zero_piece.validate(), Err(CodecError::InvalidParameters(_))));

        let mut mismatched = rs_header();
        mismatched.chunk_size = 1000;
        assert!(matches!(mismatched.validate(), Err(CodecError::InvalidParameters(_))));

        let mut zero_chunk = aead_header();
        zero_chunk.chunk_size = 0;
        assert!(matches!(zero_chunk.validate(), Err(CodecError::InvalidParameters(_))));
    }

    #[test]
    fn unknown_aead_id_is_rejected() {
        let mut header = aead_header();
        if let CipherHeader::Aead { aead_alg, .. } = &mut header.cipher {
            *aead_alg = 9;
        }
        assert!(matches!(header.validate(), Err(CodecError::UnsupportedAead(9))));
    }

    #[test]
    fn record_frame_limits() {
        let mut buf = Vec::new();
        write_record_frame(&mut buf, &[1, 2, 3], false).unwrap();
        // Non-final records must be full length.
        assert!(matches!(
            read_record_frame(buf.as_slice(), 4),
            Err(CodecError::Malformed("record length out of range"))
        ));
        let (rec, fin) = read_record_frame(buf.as_slice(), 3).unwrap();
        assert_eq!((rec.as_slice(), fin), (&[1u8, 2, 3][..], false));

        let mut last = Vec::new();
        write_record_frame(&mut last, &[9], true).unwrap();
        let (rec, fin) = read_record_frame(last.as_slice(), 3).unwrap();
        assert_eq!((rec.as_slice(), fin), (&[9u8][..], true));

        assert!(matches!(
            read_record_frame(&[0u8; 0][..], 3),
            Err(CodecError::Malformed("truncated stream"))
        ));
    }

    #[test]
    fn piece_frames_detect_damage_and_misplacement() {
        let info = GroupInfo {
            flags: FLAG_RECORD_END,
            data_len: 5,
        };
        let frame = encode_piece(3, 1, info, &[7u8; 8]);
        assert_eq!(frame.len(), 8 + PIECE_FRAME_OVERHEAD);
        assert_eq!(decode_piece(3, 1, &frame), Some((info, vec![7u8; 8])));

        // wrong group, wrong slot
        assert_eq!(decode_piece(4, 1, &frame), None);
        assert_eq!(decode_piece(3, 2, &frame), None);

        let mut flipped = frame.clone();
        flipped[7] ^= 0x10;
        assert_eq!(decode_piece(3, 1, &flipped), None);
    }
}
