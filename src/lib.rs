// OTA GATT - chunked firmware upload to Bluetooth LE peripherals

pub mod binder;
pub mod ble;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transfer;

pub use config::OtaConfig;
pub use error::{OtaError, Result};
pub use session::{OtaSession, SessionReport};
