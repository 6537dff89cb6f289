//! OTA wire protocol
//!
//! A payload is cut into frames, each carrying a fixed 12-byte header
//! followed by at most `mtu` payload bytes. One frame is written per GATT
//! write. All multi-byte header fields are little-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     magic       (0xDABAD000)
//! 4       2     total_size
//! 6       1     cur_chunk
//! 7       1     num_chunks
//! 8       2     checksum
//! 10      2     chunk_len
//! 12      n     payload     (n == chunk_len)
//! ```

pub mod checksum;
pub mod frame;
pub mod image;
pub mod reassembly;

pub use checksum::ChecksumMode;
pub use frame::{chunk_count, split, split_with, Frame, FrameHeader};

/// Magic value at the start of every frame.
pub const OTA_MAGIC: u32 = 0xDABA_D000;

/// Size of the encoded frame header.
pub const HEADER_LEN: usize = 12;

/// Largest frame the reference peripheral accepts in one write.
pub const DEFAULT_FRAME_SIZE: usize = 80;

/// Default chunk payload size, leaving room for the header.
pub const DEFAULT_CHUNK_MTU: usize = DEFAULT_FRAME_SIZE - HEADER_LEN;

/// `num_chunks` is a single byte.
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// `total_size` is a 16-bit field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;
