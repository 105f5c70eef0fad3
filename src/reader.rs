//! Streaming decoder: framed container in, plaintext out.
//!
//! Everything the reader needs to know about the stream comes from the
//! header; the options only supply the password.

use std::io::{self, Read};

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::ChunkCipher;
use crate::erasure::PieceCodec;
use crate::format::{
    CipherHeader, FLAG_FINAL, FLAG_RECORD_END, GroupInfo, PIECE_FRAME_OVERHEAD, ResistHeader,
    StreamHeader, decode_piece, read_fully, read_record_frame,
};
use crate::kdf::derive_key_argon2id;
use crate::types::{AeadAlg, CodecError, CodecOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Reading,
    Exhausted,
    Failed,
}

/// Decodes a stream produced by [`StreamWriter`](crate::StreamWriter).
pub struct StreamReader<R: Read> {
    source: R,
    header: StreamHeader,
    cipher: Option<ChunkCipher>,
    pieces: Option<PieceCodec>,
    groups: GroupCursor,
    pending: Zeroizing<Vec<u8>>,
    pos: usize,
    chunks_read: u64,
    repaired_groups: u64,
    state: ReaderState,
}

/// One group as read from the source.
struct GroupRead {
    info: GroupInfo,
    data: Vec<u8>,
    lost: usize,
}

impl<R: Read> StreamReader<R> {
    /// Parse the header from `source` and set up the inverse pipeline.
    ///
    /// Fails before any payload byte is consumed if the header is malformed,
    /// from an unknown version, or carries inconsistent parameters.
    pub fn new(mut source: R, opts: &CodecOptions) -> Result<Self, CodecError> {
        let (header, digest) = StreamHeader::read_from(&mut source)?;

        let pieces = match header.resist {
            ResistHeader::None => None,
            ResistHeader::ReedSolomon {
                piece_size,
                data_pieces,
                parity_pieces,
            } => Some(PieceCodec::new(
                piece_size as usize,
                data_pieces as usize,
                parity_pieces as usize,
            )?),
        };

        let cipher = match &header.cipher {
            CipherHeader::None => None,
            CipherHeader::Aead {
                aead_alg,
                kdf_params,
                salt,
                nonce_prefix,
                ..
            } => {
                let password = opts.password.as_ref().ok_or(CodecError::MissingPassword)?;
                let alg = AeadAlg::try_from(*aead_alg)?;
                let key = derive_key_argon2id(password, kdf_params, salt)?;
                Some(ChunkCipher::new(alg, &key, nonce_prefix, digest)?)
            }
        };

        debug!(
            resist = ?header.resist_mode(),
            cipher = ?header.cipher_mode(),
            chunk_size = header.chunk_size,
            "stream header parsed"
        );

        Ok(Self {
            source,
            header,
            cipher,
            pieces,
            groups: GroupCursor::default(),
            pending: Zeroizing::new(Vec::new()),
            pos: 0,
            chunks_read: 0,
            repaired_groups: 0,
            state: ReaderState::Reading,
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Number of groups that were missing or had damaged pieces and were
    /// rebuilt from parity.
    pub fn repaired_groups(&self) -> u64 {
        self.repaired_groups
    }

    /// Whether the final chunk has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.state == ReaderState::Exhausted
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    /// Return the next plaintext chunk, or `None` once the final chunk has
    /// been consumed.
    ///
    /// Errors are fatal: after one, every further call fails.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        match self.state {
            ReaderState::Exhausted => return Ok(None),
            ReaderState::Failed => return Err(CodecError::Malformed("reader poisoned")),
            ReaderState::Reading => {}
        }
        match self.next_chunk() {
            Ok((chunk, is_final)) => {
                trace!(chunk = self.chunks_read, len = chunk.len(), is_final, "chunk decoded");
                self.chunks_read += 1;
                if is_final {
                    self.state = ReaderState::Exhausted;
                    debug!(
                        chunks = self.chunks_read,
                        repaired = self.repaired_groups,
                        "stream exhausted"
                    );
                    if chunk.is_empty() {
                        return Ok(None);
                    }
                }
                Ok(Some(chunk))
            }
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e)
            }
        }
    }

    fn next_chunk(&mut self) -> Result<(Vec<u8>, bool), CodecError> {
        let full_len = self.header.full_record_len();
        let (record, is_final) = match &self.pieces {
            None => read_record_frame(&mut self.source, full_len)?,
            Some(codec) => read_record_groups(
                &mut self.source,
                codec,
                &mut self.groups,
                &mut self.repaired_groups,
                full_len,
            )?,
        };
        let chunk = match &mut self.cipher {
            Some(cipher) => cipher.open(&record, is_final)?,
            None => record,
        };
        Ok((chunk, is_final))
    }
}

/// Collect the groups of one record.
fn read_record_groups<R: Read>(
    source: &mut R,
    codec: &PieceCodec,
    cursor: &mut GroupCursor,
    repaired: &mut u64,
    full_len: usize,
) -> Result<(Vec<u8>, bool), CodecError> {
    let group_len = codec.group_data_len();
    let mut record = Vec::new();
    loop {
        let seq = cursor.seq;
        let GroupRead {
            info,
            mut data,
            lost,
        } = read_group(source, codec, cursor)?;

        if info.flags & !(FLAG_FINAL | FLAG_RECORD_END) != 0 {
            return Err(CodecError::Malformed("unknown group flags"));
        }
        let record_end = info.flags & FLAG_RECORD_END != 0;
        let is_final = info.flags & FLAG_FINAL != 0;
        let data_len = info.data_len as usize;
        if is_final && !record_end {
            return Err(CodecError::Malformed("final group does not end its record"));
        }
        if data_len > group_len || (!record_end && data_len != group_len) {
            return Err(CodecError::Malformed("group data length out of range"));
        }

        if lost > 0 {
            *repaired += 1;
            warn!(group = seq, lost, "repaired group with missing or damaged pieces");
        }

        data.truncate(data_len);
        record.extend_from_slice(&data);
        if record.len() > full_len {
            return Err(CodecError::Malformed("record length out of range"));
        }
        if record_end {
            if !is_final && record.len() != full_len {
                return Err(CodecError::Malformed("record length out of range"));
            }
            return Ok((record, is_final));
        }
    }
}

/// Position in the piece stream: the group being read and a frame that was
/// read ahead because it already belongs to the following group.
#[derive(Default)]
struct GroupCursor {
    seq: u64,
    carried: Option<Vec<u8>>,
}

/// Read the pieces of group `cursor.seq` and rebuild its data.
///
/// Every frame names its slot and is checksummed together with its group
/// sequence number, so pieces are placed by what they say rather than by
/// position. A group ends after `k + m` frames, at the end of the source, or
/// at the first frame that verifies as part of the next group; that frame is
/// kept for the next call. Damaged, duplicated and deleted pieces all end up
/// as empty slots.
fn read_group<R: Read>(
    source: &mut R,
    codec: &PieceCodec,
    cursor: &mut GroupCursor,
) -> Result<GroupRead, CodecError> {
    let seq = cursor.seq;
    let total = codec.total_pieces();
    let frame_len = codec.piece_size() + PIECE_FRAME_OVERHEAD;
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
    let mut info: Option<GroupInfo> = None;
    let mut frames = 0usize;
    let mut any_input = false;

    while frames < total {
        let frame = match cursor.carried.take() {
            Some(frame) => frame,
            None => {
                let mut frame = vec![0u8; frame_len];
                let n = read_fully(&mut *source, &mut frame)?;
                any_input |= n > 0;
                if n < frame_len {
                    break;
                }
                frame
            }
        };
        any_input = true;

        let index = frame[0];
        if usize::from(index) >= total {
            frames += 1;
            continue;
        }
        if let Some((piece_info, payload)) = decode_piece(seq, index, &frame) {
            frames += 1;
            match info {
                None => info = Some(piece_info),
                Some(known) if known != piece_info => {
                    return Err(CodecError::Malformed("pieces disagree on group framing"));
                }
                Some(_) => {}
            }
            let slot = &mut slots[usize::from(index)];
            if slot.is_none() {
                *slot = Some(payload);
            }
        } else if decode_piece(seq.wrapping_add(1), index, &frame).is_some() {
            cursor.carried = Some(frame);
            break;
        } else {
            frames += 1;
        }
    }
    cursor.seq = seq.wrapping_add(1);

    if !any_input {
        return Err(CodecError::Malformed("truncated stream"));
    }
    let valid = slots.iter().filter(|s| s.is_some()).count();
    let unrecoverable = CodecError::UnrecoverableChunk {
        group: seq,
        valid,
        needed: codec.data_pieces(),
    };
    let Some(info) = info.filter(|_| valid >= codec.data_pieces()) else {
        return Err(unrecoverable);
    };
    let data = codec.decode_slots(slots)?;
    Ok(GroupRead {
        info,
        data,
        lost: total - valid,
    })
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            match self.read_chunk()? {
                Some(chunk) => {
                    self.pending = Zeroizing::new(chunk);
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CipherMode, ResistMode};
    use crate::writer::StreamWriter;
    use std::io::Write;

    fn encode(data: &[u8], resist: ResistMode, opts: &CodecOptions) -> Vec<u8> {
        let mut w = StreamWriter::new(Vec::new(), resist, CipherMode::None, opts).unwrap();
        w.write_all(data).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn read_chunk_yields_chunks_then_none() {
        let opts = CodecOptions::default().with_chunk_size(3);
        let bytes = encode(b"abcdefg", ResistMode::None, &opts);
        let mut r = StreamReader::new(bytes.as_slice(), &opts).unwrap();
        assert_eq!(r.read_chunk().unwrap().unwrap(), b"abc");
        assert_eq!(r.read_chunk().unwrap().unwrap(), b"def");
        assert_eq!(r.read_chunk().unwrap().unwrap(), b"g");
        assert!(r.is_exhausted());
        assert!(r.read_chunk().unwrap().is_none());
        assert!(r.read_chunk().unwrap().is_none());
    }

    #[test]
    fn small_read_buffers_reassemble_the_stream() {
        let opts = CodecOptions::default().with_pieces(4, 3, 2);
        let data: Vec<u8> = (0..100u8).collect();
        let bytes = encode(&data, ResistMode::ReedSolomon, &opts);
        let mut r = StreamReader::new(bytes.as_slice(), &opts).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(r.repaired_groups(), 0);
    }

    #[test]
    fn truncated_plain_stream_is_an_error() {
        let opts = CodecOptions::default().with_chunk_size(4);
        let mut bytes = encode(b"abcdefgh", ResistMode::None, &opts);
        bytes.truncate(bytes.len() - 9);
        let mut r = StreamReader::new(bytes.as_slice(), &opts).unwrap();
        assert_eq!(r.read_chunk().unwrap().unwrap(), b"abcd");
        assert!(matches!(r.read_chunk(), Err(CodecError::Malformed("truncated stream"))));
        assert!(matches!(r.read_chunk(), Err(CodecError::Malformed("reader poisoned"))));
    }

    #[test]
    fn missing_trailing_pieces_are_tolerated() {
        let opts = CodecOptions::default().with_pieces(8, 2, 2);
        let data = b"0123456789abcdef";
        let mut bytes = encode(data, ResistMode::ReedSolomon, &opts);
        // Cut the last parity piece and a half of the one before it.
        bytes.truncate(bytes.len() - (8 + PIECE_FRAME_OVERHEAD) - 5);
        let mut r = StreamReader::new(bytes.as_slice(), &opts).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(r.repaired_groups(), 1);
    }

    #[test]
    fn exhausted_reader_consumes_nothing_more() {
        let opts = CodecOptions::default().with_chunk_size(4);
        let mut bytes = encode(b"xy", ResistMode::None, &opts);
        let stream_len = bytes.len();
        bytes.extend_from_slice(b"trailing");
        let mut cur = std::io::Cursor::new(bytes);
        let mut r = StreamReader::new(&mut cur, &opts).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"xy");
        drop(r);
        assert_eq!(cur.position() as usize, stream_len);
    }
}
