//! btleplug-backed GATT platform
//!
//! Drives a real adapter in the central role. Discovery forwards adapter
//! events into the session's queue from a background task. btleplug has no
//! end-of-enumeration signal, so discovery is bounded by the session's
//! window alone. Bonding is left to the OS, which pairs on first encrypted
//! access; `pair` therefore reports the peripheral as already paired.
//!
//! btleplug returns services and characteristics as sorted sets, so their
//! order is UUID order rather than attribute-handle order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as BtPeripheralId};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::platform::{
    CharacteristicHandle, ConnectionHandle, DiscoveredCharacteristic, DiscoveryEvent,
    DiscoveryHandle, DiscoverySessionId, GattPlatform, PairingOutcome, PeripheralId, ServiceHandle,
};
use super::BleError;

const EVENT_QUEUE_DEPTH: usize = 64;

struct Scan {
    session: DiscoverySessionId,
    events: mpsc::Sender<DiscoveryEvent>,
    task: JoinHandle<()>,
}

pub struct BtleplugPlatform {
    adapter: Adapter,
    next_session: AtomicU64,
    next_connection: AtomicU64,
    scan: Mutex<Option<Scan>>,
    known: Arc<Mutex<HashMap<String, BtPeripheralId>>>,
    connections: Mutex<HashMap<u64, Peripheral>>,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter on the system.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::NotAvailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::NotAvailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::NotAvailable("no Bluetooth adapter found".into()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using adapter {}", info);
        }

        Ok(Arc::new(Self {
            adapter,
            next_session: AtomicU64::new(0),
            next_connection: AtomicU64::new(0),
            scan: Mutex::new(None),
            known: Arc::new(Mutex::new(HashMap::new())),
            connections: Mutex::new(HashMap::new()),
        }))
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BleError> {
        let key = match id {
            PeripheralId::Opaque(key) => key,
            other => {
                return Err(BleError::ConnectionError(format!(
                    "{} was not discovered by this adapter",
                    other
                )))
            }
        };
        let bt_id = self
            .known
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("Unknown peripheral {}", key)))?;
        self.adapter
            .peripheral(&bt_id)
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))
    }

    async fn connected(&self, connection: &ConnectionHandle) -> Result<Peripheral, BleError> {
        self.connections
            .lock()
            .await
            .get(&connection.0)
            .cloned()
            .ok_or(BleError::Disconnected)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic, BleError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service)
            .ok_or_else(|| BleError::GattError(format!("No characteristic {}", handle.uuid)))
    }
}

/// Translate one adapter event for the session queue.
async fn translate(
    adapter: &Adapter,
    known: &Mutex<HashMap<String, BtPeripheralId>>,
    session: DiscoverySessionId,
    event: CentralEvent,
) -> Option<DiscoveryEvent> {
    let (bt_id, updated) = match event {
        CentralEvent::DeviceDiscovered(id) => (id, false),
        CentralEvent::DeviceUpdated(id) => (id, true),
        _ => return None,
    };

    let key = format!("{:?}", bt_id);
    known.lock().await.insert(key.clone(), bt_id.clone());

    let name = match adapter.peripheral(&bt_id).await {
        Ok(p) => p.properties().await.ok().flatten().and_then(|props| props.local_name),
        Err(e) => {
            debug!("Properties of {} unavailable: {}", key, e);
            None
        }
    };

    let id = PeripheralId::Opaque(key);
    Some(if updated {
        DiscoveryEvent::Updated { session, id, name }
    } else {
        DiscoveryEvent::Found { session, id, name }
    })
}

#[async_trait]
impl GattPlatform for BtleplugPlatform {
    async fn start_discovery(&self) -> Result<DiscoveryHandle, BleError> {
        let session = DiscoverySessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let mut stream = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.known);
        let forward = tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Some(event) = translate(&adapter, &known, session, event).await {
                    if forward.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.scan.lock().await.replace(Scan {
            session,
            events: tx,
            task,
        }) {
            previous.task.abort();
        }
        info!("Scanning (session {})", session.0);

        Ok(DiscoveryHandle {
            session,
            events: rx,
        })
    }

    async fn stop_discovery(&self, session: DiscoverySessionId) -> Result<(), BleError> {
        let scan = {
            let mut guard = self.scan.lock().await;
            match guard.as_ref() {
                Some(scan) if scan.session == session => guard.take(),
                _ => None,
            }
        };
        let Some(scan) = scan else {
            return Ok(());
        };

        scan.task.abort();
        let _ = scan.events.try_send(DiscoveryEvent::Stopped { session });
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn pair(&self, peripheral: &PeripheralId) -> Result<PairingOutcome, BleError> {
        self.peripheral(peripheral).await?;
        Ok(PairingOutcome::AlreadyPaired)
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<ConnectionHandle, BleError> {
        let p = self.peripheral(peripheral).await?;
        p.connect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        p.discover_services()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;

        let handle = ConnectionHandle(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.lock().await.insert(handle.0, p);
        debug!("Connected to {} as {:?}", peripheral, handle);
        Ok(handle)
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), BleError> {
        let p = self
            .connections
            .lock()
            .await
            .remove(&connection.0)
            .ok_or(BleError::Disconnected)?;
        p.disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))
    }

    async fn enumerate_services(
        &self,
        connection: &ConnectionHandle,
    ) -> Result<Vec<ServiceHandle>, BleError> {
        let p = self.connected(connection).await?;
        Ok(p.services()
            .into_iter()
            .map(|s| ServiceHandle { uuid: s.uuid })
            .collect())
    }

    async fn enumerate_characteristics(
        &self,
        connection: &ConnectionHandle,
        service: &ServiceHandle,
    ) -> Result<Vec<DiscoveredCharacteristic>, BleError> {
        let p = self.connected(connection).await?;
        let svc = p
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or_else(|| BleError::GattError(format!("No service {}", service.uuid)))?;
        Ok(svc
            .characteristics
            .iter()
            .map(|c| DiscoveredCharacteristic::new(svc.uuid, c.uuid))
            .collect())
    }

    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<(), BleError> {
        let p = self.connected(connection).await?;
        let c = Self::find_characteristic(&p, characteristic)?;
        p.write(&c, data, WriteType::WithResponse).await.map_err(|e| {
            warn!("Write to {} failed: {}", characteristic.uuid, e);
            BleError::GattError(e.to_string())
        })
    }

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: &CharacteristicHandle,
    ) -> Result<Vec<u8>, BleError> {
        let p = self.connected(connection).await?;
        let c = Self::find_characteristic(&p, characteristic)?;
        p.read(&c)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))
    }
}
