//! In-process GATT peripheral simulator
//!
//! Provides a simulated platform hosting any number of OTA peripherals that
//! can be discovered, paired, connected and written to entirely in-process.
//! Each peripheral runs the receiver-side frame checks, so a test can assert
//! on exactly what arrived. Failures (pairing, connecting, individual
//! writes) can be injected to exercise the retry paths.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::platform::{
    short_uuid, CharacteristicHandle, ConnectionHandle, DiscoveredCharacteristic, DiscoveryEvent,
    DiscoveryHandle, DiscoverySessionId, GattPlatform, PairingOutcome, PeripheralId, ServiceHandle,
};
use super::BleError;
use crate::protocol::checksum::ChecksumMode;
use crate::protocol::reassembly::{Progress, Reassembler, ReassemblyLimits};

/// Generic Access service every peripheral exposes first.
const GENERIC_ACCESS_SERVICE: u16 = 0x1800;
const DEVICE_NAME_CHAR: u16 = 0x2A00;
const APPEARANCE_CHAR: u16 = 0x2A01;

/// Simple GATT profile of the reference peripheral: service 0xFFF0 with
/// characteristics 0xFFF1..0xFFF5. 0xFFF3 takes OTA frames, 0xFFF4 reports
/// the byte count of the last transfer.
pub const OTA_SERVICE: u16 = 0xFFF0;
pub const OTA_WRITE_CHAR: u16 = 0xFFF3;
pub const OTA_STATUS_CHAR: u16 = 0xFFF4;

/// Default ATT payload a single write may carry (247-byte ATT MTU minus
/// the 3-byte opcode/handle overhead).
pub const DEFAULT_MAX_WRITE_LEN: usize = 244;

#[derive(Debug, Clone)]
struct SimService {
    uuid: Uuid,
    characteristics: Vec<Uuid>,
}

/// What a simulated peripheral did, for assertions.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub pair_calls: u32,
    pub connect_calls: u32,
    pub write_calls: u32,
    /// Every frame the peripheral accepted at the link layer, in order.
    pub frames: Vec<Vec<u8>>,
    /// Payloads that were fully reassembled.
    pub completed: Vec<Vec<u8>>,
    pub connected: bool,
}

/// Description and behaviour of one simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    id: PeripheralId,
    name: Option<String>,
    late_name: Option<String>,
    services: Vec<SimService>,
    ota_characteristic: Uuid,
    status_characteristic: Uuid,
    pair_failures: u32,
    pairing_outcome: PairingOutcome,
    connect_failures: u32,
    unresolved_enumerations: u32,
    failing_writes: HashSet<u32>,
    max_write_len: usize,
    write_latency: Duration,
    reassembler: Reassembler,
    last_transfer_len: u32,
    active_connection: Option<ConnectionHandle>,
    stats: SimStats,
}

impl SimPeripheral {
    /// A peripheral advertising `name` with the reference OTA profile.
    pub fn ota_target(name: &str) -> Self {
        let ota_service = short_uuid(OTA_SERVICE);
        Self {
            id: PeripheralId::Simulated(Uuid::new_v4()),
            name: Some(name.to_string()),
            late_name: None,
            services: vec![
                SimService {
                    uuid: short_uuid(GENERIC_ACCESS_SERVICE),
                    characteristics: vec![short_uuid(DEVICE_NAME_CHAR), short_uuid(APPEARANCE_CHAR)],
                },
                SimService {
                    uuid: ota_service,
                    characteristics: (0xFFF1..=0xFFF5).map(short_uuid).collect(),
                },
            ],
            ota_characteristic: short_uuid(OTA_WRITE_CHAR),
            status_characteristic: short_uuid(OTA_STATUS_CHAR),
            pair_failures: 0,
            pairing_outcome: PairingOutcome::AlreadyPaired,
            connect_failures: 0,
            unresolved_enumerations: 0,
            failing_writes: HashSet::new(),
            max_write_len: DEFAULT_MAX_WRITE_LEN,
            write_latency: Duration::ZERO,
            reassembler: Reassembler::new(ReassemblyLimits::default(), ChecksumMode::Reserved),
            last_transfer_len: 0,
            active_connection: None,
            stats: SimStats::default(),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Advertise without a name at first; the name arrives in an update.
    pub fn with_late_name(mut self) -> Self {
        self.late_name = self.name.take();
        self
    }

    /// Fail the first `n` pairing attempts.
    pub fn with_pair_failures(mut self, n: u32) -> Self {
        self.pair_failures = n;
        self
    }

    /// Outcome reported once pairing stops failing.
    pub fn with_pairing_outcome(mut self, outcome: PairingOutcome) -> Self {
        self.pairing_outcome = outcome;
        self
    }

    /// Fail the first `n` connection attempts.
    pub fn with_connect_failures(mut self, n: u32) -> Self {
        self.connect_failures = n;
        self
    }

    /// Report no characteristics for the first `n` enumerations, as a
    /// stack does while GATT resolution is still in progress.
    pub fn with_unresolved_enumerations(mut self, n: u32) -> Self {
        self.unresolved_enumerations = n;
        self
    }

    /// Fail the write with this zero-based call number (counted across the
    /// peripheral's lifetime, not per transfer).
    pub fn fail_write(mut self, call: u32) -> Self {
        self.failing_writes.insert(call);
        self
    }

    /// Replace the characteristics of the OTA service.
    pub fn with_ota_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        if let Some(service) = self.services.last_mut() {
            service.characteristics = characteristics;
        }
        self
    }

    pub fn with_limits(mut self, limits: ReassemblyLimits, checksum: ChecksumMode) -> Self {
        self.reassembler = Reassembler::new(limits, checksum);
        self
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    /// Delay applied to each write. Uses tokio time, so paused clocks
    /// advance instantly in tests.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    fn has_characteristic(&self, handle: &CharacteristicHandle) -> bool {
        self.services
            .iter()
            .any(|s| s.uuid == handle.service && s.characteristics.contains(&handle.uuid))
    }

    fn receive(&mut self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<(), BleError> {
        let call = self.stats.write_calls;
        self.stats.write_calls += 1;

        if self.failing_writes.contains(&call) {
            return Err(BleError::GattError(format!("injected failure on write {}", call)));
        }
        if data.len() > self.max_write_len {
            return Err(BleError::MtuExceeded {
                size: data.len(),
                mtu: self.max_write_len,
            });
        }
        self.stats.frames.push(data.to_vec());

        if characteristic.uuid != self.ota_characteristic {
            return Ok(());
        }
        match self.reassembler.accept(data) {
            Ok(Progress::Partial { received, expected }) => {
                debug!("{}: {}/{} bytes received", self.id, received, expected);
                Ok(())
            }
            Ok(Progress::Complete(payload)) => {
                debug!("{}: transfer complete, {} bytes", self.id, payload.len());
                self.last_transfer_len = payload.len() as u32;
                self.stats.completed.push(payload);
                Ok(())
            }
            // The firmware rejects the write; surface it like an ATT error.
            Err(e) => Err(BleError::GattError(format!("peripheral rejected frame: {}", e))),
        }
    }
}

#[derive(Default)]
struct SimState {
    peripherals: Vec<SimPeripheral>,
    next_session: u64,
    next_connection: u64,
    discovery: Option<(DiscoverySessionId, mpsc::Sender<DiscoveryEvent>)>,
}

impl SimState {
    fn peripheral_mut(&mut self, id: &PeripheralId) -> Result<&mut SimPeripheral, BleError> {
        self.peripherals
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| BleError::ConnectionError(format!("No peripheral at {}", id)))
    }

    fn by_connection(&mut self, connection: &ConnectionHandle) -> Result<&mut SimPeripheral, BleError> {
        self.peripherals
            .iter_mut()
            .find(|p| p.active_connection == Some(*connection))
            .ok_or(BleError::Disconnected)
    }
}

/// The simulated radio environment.
pub struct SimGattPlatform {
    state: Mutex<SimState>,
}

impl SimGattPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
        })
    }

    /// Make a peripheral discoverable. Returns its id.
    pub async fn add_peripheral(&self, peripheral: SimPeripheral) -> PeripheralId {
        let id = peripheral.id.clone();
        self.state.lock().await.peripherals.push(peripheral);
        id
    }

    pub async fn remove_peripheral(&self, id: &PeripheralId) {
        let mut state = self.state.lock().await;
        state.peripherals.retain(|p| &p.id != id);
        if let Some((session, tx)) = &state.discovery {
            let _ = tx.try_send(DiscoveryEvent::Removed {
                session: *session,
                id: id.clone(),
            });
        }
    }

    /// Push an arbitrary event into the active discovery queue.
    pub async fn inject_event(&self, event: DiscoveryEvent) -> bool {
        let state = self.state.lock().await;
        match &state.discovery {
            Some((_, tx)) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    pub async fn stats(&self, id: &PeripheralId) -> Option<SimStats> {
        let state = self.state.lock().await;
        state.peripherals.iter().find(|p| &p.id == id).map(|p| p.stats.clone())
    }
}

#[async_trait]
impl GattPlatform for SimGattPlatform {
    async fn start_discovery(&self) -> Result<DiscoveryHandle, BleError> {
        let mut state = self.state.lock().await;
        state.next_session += 1;
        let session = DiscoverySessionId(state.next_session);

        let mut events = Vec::new();
        for p in &state.peripherals {
            events.push(DiscoveryEvent::Found {
                session,
                id: p.id.clone(),
                name: p.name.clone(),
            });
            if let Some(name) = &p.late_name {
                events.push(DiscoveryEvent::Updated {
                    session,
                    id: p.id.clone(),
                    name: Some(name.clone()),
                });
            }
        }
        events.push(DiscoveryEvent::EnumerationCompleted { session });

        let (tx, rx) = mpsc::channel(events.len() + 64);
        for event in events {
            tx.try_send(event)
                .map_err(|e| BleError::ScanError(format!("event queue full: {}", e)))?;
        }
        state.discovery = Some((session, tx));

        Ok(DiscoveryHandle {
            session,
            events: rx,
        })
    }

    async fn stop_discovery(&self, session: DiscoverySessionId) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        if matches!(&state.discovery, Some((active, _)) if *active == session) {
            if let Some((_, tx)) = state.discovery.take() {
                let _ = tx.try_send(DiscoveryEvent::Stopped { session });
            }
        }
        Ok(())
    }

    async fn pair(&self, peripheral: &PeripheralId) -> Result<PairingOutcome, BleError> {
        let mut state = self.state.lock().await;
        let p = state.peripheral_mut(peripheral)?;
        p.stats.pair_calls += 1;
        if p.pair_failures > 0 {
            p.pair_failures -= 1;
            return Ok(PairingOutcome::Failed);
        }
        Ok(p.pairing_outcome)
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<ConnectionHandle, BleError> {
        let mut state = self.state.lock().await;
        state.next_connection += 1;
        let handle = ConnectionHandle(state.next_connection);

        let p = state.peripheral_mut(peripheral)?;
        p.stats.connect_calls += 1;
        if p.connect_failures > 0 {
            p.connect_failures -= 1;
            return Err(BleError::ConnectionError("Device unreachable".to_string()));
        }
        // A new central connection replaces any previous one.
        p.active_connection = Some(handle);
        p.stats.connected = true;
        Ok(handle)
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), BleError> {
        let mut state = self.state.lock().await;
        let p = state.by_connection(connection)?;
        p.active_connection = None;
        p.stats.connected = false;
        Ok(())
    }

    async fn enumerate_services(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<Vec<ServiceHandle>, BleError> {
        let mut state = self.state.lock().await;
        let p = state.by_connection(connection)?;
        Ok(p.services.iter().map(|s| ServiceHandle { uuid: s.uuid }).collect())
    }

    async fn enumerate_characteristics(
        &self,
        connection: &ConnectionHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<DiscoveredCharacteristic>, BleError> {
        let mut state = self.state.lock().await;
        let p = state.by_connection(connection)?;
        if p.unresolved_enumerations > 0 {
            p.unresolved_enumerations -= 1;
            return Ok(Vec::new());
        }
        let svc = p
            .services
            .iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or_else(|| BleError::GattError(format!("No service {}", service.uuid)))?;
        Ok(svc
            .characteristics
            .iter()
            .map(|c| DiscoveredCharacteristic::new(svc.uuid, *c))
            .collect())
    }

    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError> {
        let latency = {
            let mut state = self.state.lock().await;
            let p = state.by_connection(connection)?;
            p.write_latency
        };
        // Simulate link-layer latency without holding the state lock.
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        let p = state.by_connection(connection)?;
        if !p.has_characteristic(characteristic) {
            return Err(BleError::GattError(format!(
                "No characteristic {}",
                characteristic.uuid
            )));
        }
        p.receive(characteristic, data)
    }

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>, BleError> {
        let mut state = self.state.lock().await;
        let p = state.by_connection(connection)?;
        if !p.has_characteristic(characteristic) {
            return Err(BleError::GattError(format!(
                "No characteristic {}",
                characteristic.uuid
            )));
        }
        if characteristic.uuid == p.status_characteristic {
            Ok(p.last_transfer_len.to_le_bytes().to_vec())
        } else {
            Ok(Vec::new())
        }
    }
}
