//! BLE platform boundary
//!
//! Provides the abstract GATT platform trait the uploader drives, an
//! in-process simulated peripheral for testing, and (behind the
//! `ble-central` feature) a btleplug-backed implementation.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod platform;
pub mod simulated;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth not available: {0}")]
    NotAvailable(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Pairing error: {0}")]
    PairingError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Peer disconnected")]
    Disconnected,
}
