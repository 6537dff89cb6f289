//! Frame integrity field
//!
//! The deployed peripheral reserves the checksum field but never verifies
//! it, so the default is to zero-fill it. A computed value can be selected
//! for peripherals that do check.

use serde::{Deserialize, Serialize};

/// Value written when no checksum is computed.
pub const RESERVED_CHECKSUM: u16 = 0;

/// How the 16-bit `checksum` header field is populated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Field is reserved and always zero.
    #[default]
    Reserved,
    /// Low 16 bits of the CRC-32 (IEEE) of the frame's payload slice.
    Crc32Low16,
    /// Caller-supplied integrity function over the payload slice.
    #[serde(skip)]
    Custom(fn(&[u8]) -> u16),
}

impl ChecksumMode {
    /// Compute the header value for one frame's payload slice.
    pub fn compute(&self, payload: &[u8]) -> u16 {
        match self {
            ChecksumMode::Reserved => RESERVED_CHECKSUM,
            ChecksumMode::Crc32Low16 => (crc32fast::hash(payload) & 0xFFFF) as u16,
            ChecksumMode::Custom(f) => f(payload),
        }
    }

    /// Whether a receiver should verify the field.
    pub fn is_verified(&self) -> bool {
        !matches!(self, ChecksumMode::Reserved)
    }
}
