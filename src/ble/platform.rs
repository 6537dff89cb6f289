//! GATT platform trait definitions and core types
//!
//! Defines the abstract interface to the BLE stack that both the simulated
//! peripheral and the btleplug adapter conform to. The uploader only ever
//! talks to the radio through [`GattPlatform`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::BleError;

/// Bluetooth SIG base UUID, `0000xxxx-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const SHORT_UUID_MASK: u128 = 0xFFFF_FFFF << 96;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Name a characteristic the way the OS reports it: 16-bit assigned
/// numbers as their decimal value (0xFFF3 -> "65523"), anything else as
/// the hyphenated UUID.
pub fn characteristic_name(uuid: &Uuid) -> String {
    let value = uuid.as_u128();
    if value & !SHORT_UUID_MASK == BLUETOOTH_BASE_UUID && (value >> 96) <= u16::MAX as u128 {
        ((value >> 96) as u16).to_string()
    } else {
        uuid.to_string()
    }
}

/// Identifies a peripheral for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralId {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated peripheral identified by UUID.
    Simulated(Uuid),
    /// An identifier only meaningful to the platform that produced it.
    Opaque(String),
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralId::Real(addr) => {
                let parts: Vec<String> = addr.iter().map(|b| format!("{:02X}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            PeripheralId::Simulated(id) => write!(f, "sim-{}", id),
            PeripheralId::Opaque(id) => write!(f, "{}", id),
        }
    }
}

/// Tags every event of one discovery run so late events from an earlier
/// run can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoverySessionId(pub u64);

/// Notifications produced while discovery runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        session: DiscoverySessionId,
        id: PeripheralId,
        name: Option<String>,
    },
    Updated {
        session: DiscoverySessionId,
        id: PeripheralId,
        name: Option<String>,
    },
    Removed {
        session: DiscoverySessionId,
        id: PeripheralId,
    },
    EnumerationCompleted {
        session: DiscoverySessionId,
    },
    Stopped {
        session: DiscoverySessionId,
    },
}

impl DiscoveryEvent {
    pub fn session(&self) -> DiscoverySessionId {
        match self {
            DiscoveryEvent::Found { session, .. }
            | DiscoveryEvent::Updated { session, .. }
            | DiscoveryEvent::Removed { session, .. }
            | DiscoveryEvent::EnumerationCompleted { session }
            | DiscoveryEvent::Stopped { session } => *session,
        }
    }
}

/// A running discovery: its id and the single-consumer event queue.
#[derive(Debug)]
pub struct DiscoveryHandle {
    pub session: DiscoverySessionId,
    pub events: mpsc::Receiver<DiscoveryEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    AlreadyPaired,
    Paired,
    Failed,
}

impl PairingOutcome {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairingOutcome::AlreadyPaired | PairingOutcome::Paired)
    }
}

/// An established link to a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// A characteristic as enumerated, with the name the platform reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub name: String,
    pub handle: CharacteristicHandle,
}

impl DiscoveredCharacteristic {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self {
            name: characteristic_name(&uuid),
            handle: CharacteristicHandle { service, uuid },
        }
    }
}

/// The BLE collaborator: discovery, pairing, connection and GATT I/O.
#[async_trait]
pub trait GattPlatform: Send + Sync {
    /// Start discovery. Events arrive on the returned handle's queue.
    async fn start_discovery(&self) -> Result<DiscoveryHandle, BleError>;

    /// Stop the given discovery run.
    async fn stop_discovery(&self, session: DiscoverySessionId) -> Result<(), BleError>;

    async fn pair(&self, peripheral: &PeripheralId) -> Result<PairingOutcome, BleError>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<ConnectionHandle, BleError>;

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), BleError>;

    /// Services in the order the peripheral reports them.
    async fn enumerate_services(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<Vec<ServiceHandle>, BleError>;

    /// Characteristics of one service, in the order the peripheral reports them.
    async fn enumerate_characteristics(
        &self,
        connection: &ConnectionHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<DiscoveredCharacteristic>, BleError>;

    /// Write one value with response.
    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError>;

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>, BleError>;
}
