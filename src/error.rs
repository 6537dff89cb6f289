use thiserror::Error;

use crate::binder::Role;
use crate::ble::BleError;
use crate::retry::Stage;

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Invalid MTU {0}: chunk payload size must be between 1 and 65535")]
    InvalidMtu(usize),

    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Payload of {size} bytes does not fit the frame header at MTU {mtu} ({chunks} chunks, max 255 chunks / 65535 bytes)")]
    PayloadTooLarge {
        size: usize,
        mtu: usize,
        chunks: usize,
    },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Frame length mismatch: header declares {declared} payload bytes, frame carries {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("{role} characteristic at index {index} is {found:?}, expected {expected:?}")]
    CharacteristicMismatch {
        role: Role,
        index: usize,
        expected: String,
        found: String,
    },

    #[error("{role} characteristic index {index} out of range ({len} discovered)")]
    CharacteristicOutOfRange { role: Role, index: usize, len: usize },

    #[error("{stage} attempt failed")]
    AttemptFailed { stage: Stage },

    #[error("{stage} stage exhausted after {attempts} attempts")]
    StageExhausted { stage: Stage, attempts: u32 },

    #[error("Write of chunk {index} failed")]
    ChunkWriteFailed { index: u8 },

    #[error("Image error: {0}")]
    Image(String),

    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OtaError {
    /// Errors that no amount of retrying can fix. The stage controller
    /// aborts on these instead of burning the remaining attempts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OtaError::InvalidMtu(_)
                | OtaError::EmptyPayload
                | OtaError::PayloadTooLarge { .. }
                | OtaError::PreconditionViolation(_)
                | OtaError::CharacteristicMismatch { .. }
                | OtaError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OtaError>;
