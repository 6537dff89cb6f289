//! Frame header layout, chunk splitting and encode/decode

use super::checksum::ChecksumMode;
use super::{HEADER_LEN, MAX_CHUNKS, MAX_PAYLOAD_SIZE, OTA_MAGIC};
use crate::error::{OtaError, Result};

/// The fixed 12-byte header that precedes every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    /// Length of the whole payload being transferred.
    pub total_size: u16,
    /// Zero-based index of this frame.
    pub cur_chunk: u8,
    pub num_chunks: u8,
    pub checksum: u16,
    /// Length of the payload slice carried by this frame.
    pub chunk_len: u16,
}

impl FrameHeader {
    /// Append the little-endian header bytes to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.push(self.cur_chunk);
        out.push(self.num_chunks);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.chunk_len.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = Vec::with_capacity(HEADER_LEN);
        self.encode_into(&mut out);
        let mut bytes = [0u8; HEADER_LEN];
        bytes.copy_from_slice(&out);
        bytes
    }

    /// Read the header fields without validating them.
    /// Returns `None` if fewer than `HEADER_LEN` bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            total_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            cur_chunk: bytes[6],
            num_chunks: bytes[7],
            checksum: u16::from_le_bytes([bytes[8], bytes[9]]),
            chunk_len: u16::from_le_bytes([bytes[10], bytes[11]]),
        })
    }

    pub fn is_last(&self) -> bool {
        self.cur_chunk as usize + 1 == self.num_chunks as usize
    }
}

/// One header-plus-payload unit, written as a single GATT value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Inverse of [`Frame::encode`]. The frame must carry exactly
    /// `chunk_len` payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(bytes).ok_or(OtaError::FrameTooShort(bytes.len()))?;
        if header.magic != OTA_MAGIC {
            return Err(OtaError::BadMagic(header.magic));
        }
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.chunk_len as usize {
            return Err(OtaError::FrameLengthMismatch {
                declared: header.chunk_len as usize,
                actual: payload.len(),
            });
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Number of frames needed for `len` bytes at `mtu` bytes per frame.
pub fn chunk_count(len: usize, mtu: usize) -> Result<u8> {
    if mtu == 0 || mtu > MAX_PAYLOAD_SIZE {
        return Err(OtaError::InvalidMtu(mtu));
    }
    if len == 0 {
        return Err(OtaError::EmptyPayload);
    }
    let chunks = len.div_ceil(mtu);
    if len > MAX_PAYLOAD_SIZE || chunks > MAX_CHUNKS {
        return Err(OtaError::PayloadTooLarge {
            size: len,
            mtu,
            chunks,
        });
    }
    Ok(chunks as u8)
}

/// Build frame `index` of a transfer whose chunk count is already known.
///
/// Callers guarantee `index < num_chunks` and that `num_chunks` came from
/// [`chunk_count`] for the same payload and MTU.
pub(crate) fn frame_at(
    payload: &[u8],
    mtu: usize,
    num_chunks: u8,
    index: u8,
    checksum: ChecksumMode,
) -> Frame {
    let start = index as usize * mtu;
    let end = (start + mtu).min(payload.len());
    let slice = &payload[start..end];
    Frame {
        header: FrameHeader {
            magic: OTA_MAGIC,
            total_size: payload.len() as u16,
            cur_chunk: index,
            num_chunks,
            checksum: checksum.compute(slice),
            chunk_len: slice.len() as u16,
        },
        payload: slice.to_vec(),
    }
}

/// Split `payload` into frames with the checksum field reserved (zero).
pub fn split(payload: &[u8], mtu: usize) -> Result<Vec<Frame>> {
    split_with(payload, mtu, ChecksumMode::Reserved)
}

/// Split `payload` into frames, filling the checksum field per `checksum`.
pub fn split_with(payload: &[u8], mtu: usize, checksum: ChecksumMode) -> Result<Vec<Frame>> {
    let num_chunks = chunk_count(payload.len(), mtu)?;
    Ok((0..num_chunks)
        .map(|index| frame_at(payload, mtu, num_chunks, index, checksum))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = FrameHeader {
            magic: OTA_MAGIC,
            total_size: 0x0102,
            cur_chunk: 3,
            num_chunks: 4,
            checksum: 0xA1B2,
            chunk_len: 0x0050,
        };
        assert_eq!(
            header.to_bytes(),
            [0x00, 0xD0, 0xBA, 0xDA, 0x02, 0x01, 3, 4, 0xB2, 0xA1, 0x50, 0x00]
        );
        assert_eq!(FrameHeader::parse(&header.to_bytes()), Some(header));
    }

    #[test]
    fn test_split_exact_multiple() {
        let payload = pattern(300);
        let frames = split(&payload, 100).unwrap();
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.header.chunk_len, 100);
            assert_eq!(frame.header.cur_chunk as usize, i);
            assert_eq!(frame.header.num_chunks, 3);
            assert_eq!(frame.header.total_size, 300);
            assert_eq!(frame.header.checksum, 0);
        }
    }

    #[test]
    fn test_split_with_remainder() {
        let payload = pattern(250);
        let frames = split(&payload, 100).unwrap();
        let lens: Vec<u16> = frames.iter().map(|f| f.header.chunk_len).collect();
        assert_eq!(lens, vec![100, 100, 50]);
        assert!(frames[2].header.is_last());
        assert!(!frames[1].header.is_last());
        assert_eq!(frames[2].payload, payload[200..].to_vec());
    }

    #[test]
    fn test_split_invariants_across_lengths() {
        for mtu in [1usize, 7, 68, 100, 244] {
            for len in [1usize, 2, 67, 68, 69, 199, 200, 201, 1000] {
                if len.div_ceil(mtu) > MAX_CHUNKS {
                    assert!(matches!(
                        split(&pattern(len), mtu),
                        Err(OtaError::PayloadTooLarge { .. })
                    ));
                    continue;
                }
                let payload = pattern(len);
                let frames = split(&payload, mtu).unwrap();
                assert_eq!(frames.len(), len.div_ceil(mtu));

                let total: usize = frames.iter().map(|f| f.header.chunk_len as usize).sum();
                assert_eq!(total, len);

                let indices: Vec<usize> = frames.iter().map(|f| f.header.cur_chunk as usize).collect();
                assert_eq!(indices, (0..frames.len()).collect::<Vec<_>>());

                assert!(frames.iter().all(|f| f.header.chunk_len as usize <= mtu));

                let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
                assert_eq!(rebuilt, payload);
            }
        }
    }

    #[test]
    fn test_chunk_limit_boundary() {
        // 255 chunks is the most the header can describe.
        assert_eq!(chunk_count(255 * 10, 10).unwrap(), 255);
        assert!(split(&pattern(255 * 10), 10).is_ok());

        let err = split(&pattern(255 * 10 + 1), 10).unwrap_err();
        assert!(matches!(err, OtaError::PayloadTooLarge { chunks: 256, .. }));
    }

    #[test]
    fn test_total_size_limit() {
        let err = chunk_count(MAX_PAYLOAD_SIZE + 1, MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(matches!(err, OtaError::PayloadTooLarge { .. }));
        assert_eq!(chunk_count(MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE).unwrap(), 1);
    }

    #[test]
    fn test_rejects_zero_mtu_and_empty_payload() {
        assert!(matches!(split(b"abc", 0), Err(OtaError::InvalidMtu(0))));
        assert!(matches!(split(&[], 10), Err(OtaError::EmptyPayload)));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let payload = pattern(150);
        for frame in split_with(&payload, 64, ChecksumMode::Crc32Low16).unwrap() {
            let bytes = frame.encode();
            assert_eq!(bytes.len(), HEADER_LEN + frame.header.chunk_len as usize);
            let decoded = Frame::decode(&bytes).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn test_checksum_filled_per_slice() {
        let payload = pattern(20);
        let frames = split_with(&payload, 10, ChecksumMode::Crc32Low16).unwrap();
        assert_eq!(frames[0].header.checksum, ChecksumMode::Crc32Low16.compute(&payload[..10]));
        assert_eq!(frames[1].header.checksum, ChecksumMode::Crc32Low16.compute(&payload[10..]));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Frame::decode(&[0u8; 5]), Err(OtaError::FrameTooShort(5))));

        let mut bytes = split(b"hello", 8).unwrap()[0].encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(Frame::decode(&bytes), Err(OtaError::BadMagic(_))));

        let mut bytes = split(b"hello", 8).unwrap()[0].encode();
        bytes.push(0);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(OtaError::FrameLengthMismatch { declared: 5, actual: 6 })
        ));
    }
}
