//! Receiver-side frame validation and reassembly
//!
//! Applies the same checks the peripheral firmware applies to each written
//! frame. Used by the simulated peripheral and by tests to prove that what
//! the transfer engine emits is accepted on the other end.

use thiserror::Error;

use super::checksum::ChecksumMode;
use super::frame::FrameHeader;
use super::{DEFAULT_FRAME_SIZE, HEADER_LEN, OTA_MAGIC};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("frame shorter than header ({0} bytes)")]
    TooShort(usize),

    #[error("magic mismatch ({0:#010x})")]
    BadMagic(u32),

    #[error("total size {0} is zero or exceeds the blob limit")]
    InvalidTotalSize(u16),

    #[error("chunk length {0} is zero or exceeds the chunk limit")]
    InvalidChunkLen(u16),

    #[error("frame carries {actual} payload bytes, header declares {declared}")]
    Truncated { declared: usize, actual: usize },

    #[error("expected chunk {expected}, got {got}")]
    OutOfSequence { expected: u8, got: u8 },

    #[error("header changed mid-transfer")]
    InconsistentHeader,

    #[error("transfer would exceed {max} bytes")]
    Overflow { max: usize },

    #[error("checksum mismatch on chunk {index}: header {declared:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        index: u8,
        declared: u16,
        computed: u16,
    },

    #[error("final chunk arrived after {received} of {expected} bytes")]
    Incomplete { received: usize, expected: usize },
}

/// Size limits enforced by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_chunk_len: usize,
    pub max_blob_size: usize,
}

impl Default for ReassemblyLimits {
    /// Limits of the reference peripheral firmware.
    fn default() -> Self {
        Self {
            max_chunk_len: DEFAULT_FRAME_SIZE,
            max_blob_size: 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Partial { received: usize, expected: usize },
    Complete(Vec<u8>),
}

#[derive(Debug, Clone)]
struct InFlight {
    total_size: u16,
    num_chunks: u8,
    last_chunk: u8,
    buffer: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    limits: ReassemblyLimits,
    checksum: ChecksumMode,
    current: Option<InFlight>,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits, checksum: ChecksumMode) -> Self {
        Self {
            limits,
            checksum,
            current: None,
        }
    }

    /// Bytes accepted so far for the transfer in progress.
    pub fn received(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.buffer.len())
    }

    /// Validate one written frame and fold it into the transfer.
    ///
    /// Chunk 0 always starts a fresh transfer, so a sender that restarts
    /// after a failure does not have to reset the receiver first. Any
    /// error drops the transfer in progress.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<Progress, ReassemblyError> {
        let result = self.accept_inner(bytes);
        if result.is_err() {
            self.current = None;
        }
        result
    }

    fn accept_inner(&mut self, bytes: &[u8]) -> Result<Progress, ReassemblyError> {
        let header = FrameHeader::parse(bytes).ok_or(ReassemblyError::TooShort(bytes.len()))?;
        if header.magic != OTA_MAGIC {
            return Err(ReassemblyError::BadMagic(header.magic));
        }
        if header.total_size == 0 || header.total_size as usize > self.limits.max_blob_size {
            return Err(ReassemblyError::InvalidTotalSize(header.total_size));
        }
        if header.chunk_len == 0 || header.chunk_len as usize > self.limits.max_chunk_len {
            return Err(ReassemblyError::InvalidChunkLen(header.chunk_len));
        }
        let payload = &bytes[HEADER_LEN..];
        if payload.len() < header.chunk_len as usize {
            return Err(ReassemblyError::Truncated {
                declared: header.chunk_len as usize,
                actual: payload.len(),
            });
        }
        let payload = &payload[..header.chunk_len as usize];

        if self.checksum.is_verified() {
            let computed = self.checksum.compute(payload);
            if computed != header.checksum {
                return Err(ReassemblyError::ChecksumMismatch {
                    index: header.cur_chunk,
                    declared: header.checksum,
                    computed,
                });
            }
        }

        if header.cur_chunk == 0 {
            self.current = Some(InFlight {
                total_size: header.total_size,
                num_chunks: header.num_chunks,
                last_chunk: 0,
                buffer: Vec::with_capacity(header.total_size as usize),
            });
        } else {
            let expected = self.current.as_ref().map_or(0, |c| c.last_chunk.wrapping_add(1));
            let in_flight = match self.current.as_ref() {
                Some(c) if c.last_chunk.wrapping_add(1) == header.cur_chunk => c,
                _ => {
                    return Err(ReassemblyError::OutOfSequence {
                        expected,
                        got: header.cur_chunk,
                    })
                }
            };
            if in_flight.total_size != header.total_size || in_flight.num_chunks != header.num_chunks {
                return Err(ReassemblyError::InconsistentHeader);
            }
        }

        let max = self.limits.max_blob_size;
        let in_flight = match self.current.as_mut() {
            Some(c) => c,
            None => return Err(ReassemblyError::InconsistentHeader),
        };
        if in_flight.buffer.len() + payload.len() > max.min(in_flight.total_size as usize) {
            return Err(ReassemblyError::Overflow { max });
        }
        in_flight.buffer.extend_from_slice(payload);
        in_flight.last_chunk = header.cur_chunk;

        if !header.is_last() {
            return Ok(Progress::Partial {
                received: in_flight.buffer.len(),
                expected: in_flight.total_size as usize,
            });
        }

        let finished = std::mem::take(&mut in_flight.buffer);
        let expected = in_flight.total_size as usize;
        self.current = None;
        if finished.len() != expected {
            return Err(ReassemblyError::Incomplete {
                received: finished.len(),
                expected,
            });
        }
        Ok(Progress::Complete(finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{split, split_with};

    fn encoded(payload: &[u8], mtu: usize) -> Vec<Vec<u8>> {
        split(payload, mtu).unwrap().iter().map(|f| f.encode()).collect()
    }

    #[test]
    fn test_reassembles_split_payload() {
        let payload: Vec<u8> = (0..250u16).map(|i| i as u8).collect();
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved);

        let frames = encoded(&payload, 68);
        for frame in &frames[..frames.len() - 1] {
            assert!(matches!(rx.accept(frame).unwrap(), Progress::Partial { .. }));
        }
        let last = rx.accept(frames.last().unwrap()).unwrap();
        assert_eq!(last, Progress::Complete(payload));
        assert_eq!(rx.received(), 0);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let frames = encoded(&[7u8; 200], 68);
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved);
        rx.accept(&frames[0]).unwrap();
        assert_eq!(
            rx.accept(&frames[2]).unwrap_err(),
            ReassemblyError::OutOfSequence { expected: 1, got: 2 }
        );
        // The failed transfer was dropped; chunk 1 no longer follows anything.
        assert!(matches!(
            rx.accept(&frames[1]),
            Err(ReassemblyError::OutOfSequence { expected: 0, got: 1 })
        ));
    }

    #[test]
    fn test_chunk_zero_restarts_transfer() {
        let payload = vec![3u8; 200];
        let frames = encoded(&payload, 68);
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved);

        rx.accept(&frames[0]).unwrap();
        rx.accept(&frames[1]).unwrap();
        assert_eq!(rx.received(), 136);

        // Sender restarted from scratch.
        rx.accept(&frames[0]).unwrap();
        assert_eq!(rx.received(), 68);
        rx.accept(&frames[1]).unwrap();
        assert_eq!(rx.accept(&frames[2]).unwrap(), Progress::Complete(payload));
    }

    #[test]
    fn test_enforces_limits() {
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved);
        let oversized_chunk = encoded(&[0u8; 90], 90);
        assert_eq!(
            rx.accept(&oversized_chunk[0]).unwrap_err(),
            ReassemblyError::InvalidChunkLen(90)
        );

        let oversized_blob = encoded(&[0u8; 401], 80);
        assert_eq!(
            rx.accept(&oversized_blob[0]).unwrap_err(),
            ReassemblyError::InvalidTotalSize(401)
        );
    }

    #[test]
    fn test_rejects_malformed_frames() {
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved);
        assert_eq!(rx.accept(&[0u8; 4]).unwrap_err(), ReassemblyError::TooShort(4));

        let mut frame = encoded(b"payload", 68).remove(0);
        frame[3] = 0;
        assert!(matches!(rx.accept(&frame), Err(ReassemblyError::BadMagic(_))));

        let mut frame = encoded(b"payload", 68).remove(0);
        frame.truncate(frame.len() - 2);
        assert_eq!(
            rx.accept(&frame).unwrap_err(),
            ReassemblyError::Truncated { declared: 7, actual: 5 }
        );
    }

    #[test]
    fn test_verifies_checksum_when_enabled() {
        let mut rx = Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Crc32Low16);
        let good = split_with(b"firmware", 68, ChecksumMode::Crc32Low16).unwrap();
        assert_eq!(
            rx.accept(&good[0].encode()).unwrap(),
            Progress::Complete(b"firmware".to_vec())
        );

        let unsigned = encoded(b"firmware", 68);
        assert!(matches!(
            rx.accept(&unsigned[0]),
            Err(ReassemblyError::ChecksumMismatch { index: 0, .. })
        ));
    }
}
