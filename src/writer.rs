//! Streaming encoder: plaintext in, framed container out.

use std::io::{self, Write};

use secrecy::ExposeSecret;
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use crate::crypto::{ChunkCipher, generate_nonce_prefix, generate_salt};
use crate::erasure::PieceCodec;
use crate::format::{
    CipherHeader, FLAG_FINAL, FLAG_RECORD_END, GroupInfo, MAX_CHUNK_SIZE, MAX_PIECE_SIZE,
    ResistHeader, StreamHeader, encode_piece, write_record_frame,
};
use crate::kdf::{derive_key_argon2id, validate_kdf_params};
use crate::types::{CipherMode, CodecError, CodecOptions, ResistMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Writing,
    Closed,
}

/// Encodes a byte stream into `sink`.
///
/// The header is written during construction. Bytes passed to [`Write::write`]
/// are cut into chunks of the stream's chunk size; each chunk is sealed (cipher
/// active), split into piece groups (resistance active) and framed. The last
/// chunk is written by [`close`](Self::close), [`finish`](Self::finish) or, on
/// a best-effort basis, on drop.
pub struct StreamWriter<W: Write> {
    sink: Option<W>,
    header: StreamHeader,
    chunk_size: usize,
    buffer: Vec<u8>,
    cipher: Option<ChunkCipher>,
    pieces: Option<PieceCodec>,
    group_seq: u64,
    chunks_written: u64,
    state: WriterState,
}

impl<W: Write> StreamWriter<W> {
    /// Validate the configuration, derive the key and write the header.
    ///
    /// Configuration problems are reported before anything touches `sink`.
    pub fn new(
        mut sink: W,
        resist: ResistMode,
        cipher: CipherMode,
        opts: &CodecOptions,
    ) -> Result<Self, CodecError> {
        let pieces = match resist {
            ResistMode::None => None,
            ResistMode::ReedSolomon => {
                if opts.piece_size > MAX_PIECE_SIZE {
                    return Err(CodecError::InvalidParameters(
                        "piece_size must be between 1 byte and 16 MiB",
                    ));
                }
                Some(PieceCodec::new(
                    opts.piece_size,
                    opts.data_pieces,
                    opts.parity_pieces,
                )?)
            }
        };

        let chunk_size = match (cipher, &pieces) {
            (CipherMode::None, Some(codec)) => codec.group_data_len(),
            _ => opts.chunk_size,
        };
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CodecError::InvalidParameters(
                "chunk_size must be between 1 byte and 256 MiB",
            ));
        }

        let resist_header = match &pieces {
            None => ResistHeader::None,
            Some(codec) => ResistHeader::ReedSolomon {
                piece_size: codec.piece_size() as u32,
                data_pieces: codec.data_pieces() as u16,
                parity_pieces: codec.parity_pieces() as u16,
            },
        };

        // Checked before any randomness or key derivation.
        let password = match cipher {
            CipherMode::None => None,
            CipherMode::Aead => {
                let pw = opts
                    .password
                    .as_ref()
                    .filter(|pw| !pw.expose_secret().is_empty())
                    .ok_or(CodecError::MissingPassword)?;
                validate_kdf_params(&opts.kdf_params)?;
                Some(pw)
            }
        };

        let (cipher_header, secrets) = match password {
            None => (CipherHeader::None, None),
            Some(pw) => {
                let salt = generate_salt()?;
                let nonce_prefix = generate_nonce_prefix(opts.alg)?;
                let key = derive_key_argon2id(pw, &opts.kdf_params, &salt)?;
                (
                    CipherHeader::Aead {
                        aead_alg: opts.alg as u8,
                        kdf_alg: opts.kdf as u8,
                        kdf_params: opts.kdf_params,
                        salt,
                        nonce_prefix: nonce_prefix.clone(),
                    },
                    Some((key, nonce_prefix)),
                )
            }
        };

        let header = StreamHeader::new(chunk_size as u32, resist_header, cipher_header);
        header.validate()?;

        let mut header_bytes = Vec::new();
        let digest = header.write_to(&mut header_bytes)?;

        let chunk_cipher = match secrets {
            None => None,
            Some((key, nonce_prefix)) => {
                Some(ChunkCipher::new(opts.alg, &key, &nonce_prefix, digest)?)
            }
        };

        sink.write_all(&header_bytes)?;
        debug!(
            resist = ?resist,
            cipher = ?cipher,
            chunk_size,
            header_len = header_bytes.len(),
            "stream header written"
        );

        Ok(Self {
            sink: Some(sink),
            header,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            cipher: chunk_cipher,
            pieces,
            group_seq: 0,
            chunks_written: 0,
            state: WriterState::Writing,
        })
    }

    /// The header this writer emitted.
    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    /// Plaintext bytes per chunk for this stream.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks emitted so far.
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// Buffer `data`, emitting every chunk that fills up.
    ///
    /// A full chunk stays buffered until more input arrives, so the last
    /// chunk of the stream is always the one flagged final at close.
    pub fn append(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        if self.state == WriterState::Closed {
            return Err(CodecError::StreamClosed);
        }
        while !data.is_empty() {
            if self.buffer.len() == self.chunk_size {
                if let Err(e) = self.emit_chunk(false) {
                    self.state = WriterState::Closed;
                    return Err(e);
                }
            }
            let take = (self.chunk_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    fn emit_chunk(&mut self, is_final: bool) -> Result<(), CodecError> {
        let record = match &mut self.cipher {
            Some(cipher) => cipher.seal(&self.buffer, is_final)?,
            None => self.buffer.clone(),
        };
        let plain_len = self.buffer.len();
        self.buffer.zeroize();

        let sink = self.sink.as_mut().ok_or(CodecError::StreamClosed)?;
        match &self.pieces {
            None => write_record_frame(sink, &record, is_final)?,
            Some(codec) => write_groups(sink, codec, &mut self.group_seq, &record, is_final)?,
        }

        trace!(
            chunk = self.chunks_written,
            plain_len,
            record_len = record.len(),
            is_final,
            "chunk emitted"
        );
        self.chunks_written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), CodecError> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        // Marked before emitting so a failed close is never retried into a
        // second final chunk.
        self.state = WriterState::Closed;
        self.emit_chunk(true)?;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        debug!(
            chunks = self.chunks_written,
            groups = self.group_seq,
            "stream closed"
        );
        Ok(())
    }

    /// Write the final chunk, flush and release the sink.
    ///
    /// Calling `close` again is a no-op; writing afterwards fails with
    /// [`CodecError::StreamClosed`].
    pub fn close(&mut self) -> Result<(), CodecError> {
        let res = self.finalize();
        self.sink = None;
        res
    }

    /// Like [`close`](Self::close) but hands the sink back.
    pub fn finish(mut self) -> Result<W, CodecError> {
        self.finalize()?;
        self.sink.take().ok_or(CodecError::StreamClosed)
    }
}

/// Cut `record` into groups of `piece_size * k` bytes and write their pieces.
///
/// An empty record still produces one group so the final marker is carried.
fn write_groups<W: Write>(
    sink: &mut W,
    codec: &PieceCodec,
    seq: &mut u64,
    record: &[u8],
    is_final: bool,
) -> Result<(), CodecError> {
    let group_len = codec.group_data_len();
    let mut parts: Vec<&[u8]> = record.chunks(group_len).collect();
    if parts.is_empty() {
        parts.push(&[]);
    }
    let last = parts.len() - 1;

    let mut padded = vec![0u8; group_len];
    for (i, part) in parts.iter().enumerate() {
        let mut flags = 0;
        if i == last {
            flags |= FLAG_RECORD_END;
            if is_final {
                flags |= FLAG_FINAL;
            }
        }
        padded[..part.len()].copy_from_slice(part);
        padded[part.len()..].fill(0);

        let info = GroupInfo {
            flags,
            data_len: part.len() as u32,
        };
        for (index, piece) in codec.encode(&padded)?.iter().enumerate() {
            sink.write_all(&encode_piece(*seq, index as u8, info, piece))?;
        }
        *seq += 1;
    }
    padded.zeroize();
    Ok(())
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf)?;
        Ok(buf.len())
    }

    /// Flushes the sink. Buffered bytes short of a full chunk stay buffered.
    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for StreamWriter<W> {
    fn drop(&mut self) {
        if self.state == WriterState::Writing {
            if let Err(e) = self.finalize() {
                warn!(error = %e, "failed to finalize stream on drop");
            }
        }
        self.buffer.zeroize();
    }
}
