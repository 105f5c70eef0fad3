//! Reed-Solomon piece codec.
//!
//! Splits exactly `piece_size * k` bytes into `k` data pieces and computes `m`
//! parity pieces. Any `k` of the `k + m` pieces, with their indices, give the
//! original bytes back. The code is systematic: the first `k` pieces are the
//! input itself, so a group with no losses decodes by concatenation.
//!
//! Padding is the caller's job; the codec never guesses at true lengths.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::trace;

use crate::types::CodecError;

/// Largest `k + m` supported by GF(2^8).
pub const MAX_TOTAL_PIECES: usize = 256;

/// Reed-Solomon encoder/decoder for fixed-shape piece groups.
pub struct PieceCodec {
    piece_size: usize,
    data_pieces: usize,
    parity_pieces: usize,
    rs: ReedSolomon,
}

impl std::fmt::Debug for PieceCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceCodec")
            .field("piece_size", &self.piece_size)
            .field("data_pieces", &self.data_pieces)
            .field("parity_pieces", &self.parity_pieces)
            .finish()
    }
}

impl PieceCodec {
    /// Create a codec for groups of `data_pieces + parity_pieces` pieces of
    /// `piece_size` bytes.
    pub fn new(
        piece_size: usize,
        data_pieces: usize,
        parity_pieces: usize,
    ) -> Result<Self, CodecError> {
        if piece_size == 0 {
            return Err(CodecError::InvalidParameters("piece size must be > 0"));
        }
        if data_pieces == 0 {
            return Err(CodecError::InvalidParameters("data piece count must be > 0"));
        }
        if parity_pieces == 0 {
            return Err(CodecError::InvalidParameters(
                "parity piece count must be > 0",
            ));
        }
        if data_pieces + parity_pieces > MAX_TOTAL_PIECES {
            return Err(CodecError::InvalidParameters(
                "data + parity piece count must not exceed 256",
            ));
        }
        let rs = ReedSolomon::new(data_pieces, parity_pieces)
            .map_err(|_| CodecError::InvalidParameters("unsupported piece counts"))?;
        Ok(Self {
            piece_size,
            data_pieces,
            parity_pieces,
            rs,
        })
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub fn data_pieces(&self) -> usize {
        self.data_pieces
    }

    pub fn parity_pieces(&self) -> usize {
        self.parity_pieces
    }

    pub fn total_pieces(&self) -> usize {
        self.data_pieces + self.parity_pieces
    }

    /// Bytes of input consumed by one group (`piece_size * k`).
    pub fn group_data_len(&self) -> usize {
        self.piece_size * self.data_pieces
    }

    /// Encode one group worth of data into `k + m` pieces, data pieces first.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        if data.len() != self.group_data_len() {
            return Err(CodecError::MalformedPiece {
                expected: self.group_data_len(),
                got: data.len(),
            });
        }

        let mut pieces: Vec<Vec<u8>> = data
            .chunks_exact(self.piece_size)
            .map(|c| c.to_vec())
            .collect();
        pieces.resize_with(self.total_pieces(), || vec![0u8; self.piece_size]);

        self.rs
            .encode(&mut pieces)
            .map_err(|_| CodecError::InvalidParameters("reed-solomon encoding failed"))?;

        trace!(
            k = self.data_pieces,
            m = self.parity_pieces,
            piece_size = self.piece_size,
            "encoded group"
        );
        Ok(pieces)
    }

    /// Rebuild the `piece_size * k` data bytes from the pieces at hand.
    ///
    /// # Errors
    ///
    /// - [`CodecError::InvalidPieceIndex`] for an index outside `0..k+m` or one
    ///   given twice
    /// - [`CodecError::MalformedPiece`] for a piece of the wrong length
    /// - [`CodecError::InsufficientPieces`] when fewer than `k` pieces remain
    pub fn decode(&self, pieces: &[(usize, Vec<u8>)]) -> Result<Vec<u8>, CodecError> {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.total_pieces()];
        for (index, data) in pieces {
            let slot = slots
                .get_mut(*index)
                .ok_or(CodecError::InvalidPieceIndex(*index))?;
            if slot.is_some() {
                return Err(CodecError::InvalidPieceIndex(*index));
            }
            if data.len() != self.piece_size {
                return Err(CodecError::MalformedPiece {
                    expected: self.piece_size,
                    got: data.len(),
                });
            }
            *slot = Some(data.clone());
        }
        self.decode_slots(slots)
    }

    /// Same as [`decode`](Self::decode) but takes the group positionally,
    /// `None` marking a missing piece. Used by the stream reader, which
    /// already holds pieces in slot order.
    pub fn decode_slots(&self, mut slots: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>, CodecError> {
        if slots.len() != self.total_pieces() {
            return Err(CodecError::InvalidParameters(
                "slot count must equal data + parity piece count",
            ));
        }
        let present = slots.iter().filter(|s| s.is_some()).count();
        if present < self.data_pieces {
            return Err(CodecError::InsufficientPieces {
                needed: self.data_pieces,
                got: present,
            });
        }
        if let Some(bad) = slots
            .iter()
            .flatten()
            .find(|piece| piece.len() != self.piece_size)
        {
            return Err(CodecError::MalformedPiece {
                expected: self.piece_size,
                got: bad.len(),
            });
        }

        let all_data_present = slots[..self.data_pieces].iter().all(Option::is_some);
        if !all_data_present {
            self.rs
                .reconstruct_data(&mut slots)
                .map_err(|_| CodecError::InsufficientPieces {
                    needed: self.data_pieces,
                    got: present,
                })?;
            trace!(present, k = self.data_pieces, "reconstructed missing data pieces");
        }

        let mut out = Vec::with_capacity(self.group_data_len());
        for piece in slots.into_iter().take(self.data_pieces) {
            match piece {
                Some(p) => out.extend_from_slice(&p),
                None => {
                    return Err(CodecError::InsufficientPieces {
                        needed: self.data_pieces,
                        got: present,
                    });
                }
            }
        }
        Ok(out)
    }
}
