//! OTA session orchestration
//!
//! One session takes a payload to one peripheral:
//!
//! ```text
//! Discover -> Pair -> Connect -> Send -> Done
//! ```
//!
//! Discovery runs once. Pair, Connect and Send each run under their own
//! [`RetryController`]; an exhausted or aborted stage ends the session.
//! The connection is always torn down before returning.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::binder::{Bindings, CharacteristicBinder};
use crate::ble::platform::{ConnectionHandle, GattPlatform, PairingOutcome, PeripheralId};
use crate::ble::BleError;
use crate::config::OtaConfig;
use crate::discovery::{DiscoveredPeripheral, DiscoveryRegistry};
use crate::error::{OtaError, Result};
use crate::protocol::frame::chunk_count;
use crate::retry::{RetryController, Stage};
use crate::transfer::TransferStrategy;

/// What a successful session did.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peripheral: DiscoveredPeripheral,
    pub chunks: u8,
    pub bytes: usize,
    pub pair_attempts: u32,
    pub connect_attempts: u32,
    pub send_attempts: u32,
    /// Value of the read characteristic after the transfer, when requested
    /// and available.
    pub read_back: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    connection: ConnectionHandle,
    bindings: Bindings,
}

pub struct OtaSession {
    platform: Arc<dyn GattPlatform>,
    config: OtaConfig,
    registry: DiscoveryRegistry,
    link: Mutex<Option<Link>>,
}

impl OtaSession {
    pub fn new(platform: Arc<dyn GattPlatform>, config: OtaConfig) -> Self {
        Self {
            platform,
            config,
            registry: DiscoveryRegistry::new(),
            link: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    /// Upload `payload`. True only when every chunk was written.
    pub async fn run(&self, payload: &[u8]) -> bool {
        match self.run_detailed(payload).await {
            Ok(report) => {
                info!(
                    "OTA complete: {} bytes in {} chunks to {} ({})",
                    report.bytes, report.chunks, report.peripheral.name, report.peripheral.id
                );
                true
            }
            Err(e) => {
                error!("OTA failed: {}", e);
                false
            }
        }
    }

    pub async fn run_detailed(&self, payload: &[u8]) -> Result<SessionReport> {
        self.config.validate()?;
        // Reject payloads the header cannot describe before touching the radio.
        let chunks = chunk_count(payload.len(), self.config.mtu)?;

        let peripheral = self.discover().await?;
        let result = self.upload(&peripheral, payload, chunks).await;
        self.teardown().await;

        result.map(|(pair_attempts, connect_attempts, send_attempts, read_back)| SessionReport {
            peripheral,
            chunks,
            bytes: payload.len(),
            pair_attempts,
            connect_attempts,
            send_attempts,
            read_back,
        })
    }

    async fn upload(
        &self,
        peripheral: &DiscoveredPeripheral,
        payload: &[u8],
        chunks: u8,
    ) -> Result<(u32, u32, u32, Option<Vec<u8>>)> {
        let id = &peripheral.id;

        let pair = RetryController::new(Stage::Pair, self.config.pair)
            .run(|_| self.pair_once(id))
            .await?;
        debug!("Pairing state: {:?}", pair.value);

        let connect = RetryController::new(Stage::Connect, self.config.connect)
            .run(|_| self.connect_once(id))
            .await?;

        info!(
            "Sending {} bytes in {} chunks of up to {} bytes",
            payload.len(),
            chunks,
            self.config.mtu
        );
        let resume_from = AtomicU8::new(0);
        let strategy = self.config.strategy;
        let send = RetryController::new(Stage::Send, self.config.send)
            .run(|_| {
                let start = match strategy {
                    TransferStrategy::Restart => 0,
                    TransferStrategy::Resume => resume_from.load(Ordering::Relaxed),
                };
                let resume_from = &resume_from;
                async move {
                    let result = self.send_once(payload, start).await;
                    if let Err(OtaError::ChunkWriteFailed { index }) = &result {
                        resume_from.store(*index, Ordering::Relaxed);
                    }
                    result
                }
            })
            .await?;

        let read_back = if self.config.verify_read {
            self.read_back().await
        } else {
            None
        };

        Ok((pair.attempts, connect.attempts, send.attempts, read_back))
    }

    /// Collect candidates for one discovery window and require exactly one.
    async fn discover(&self) -> Result<DiscoveredPeripheral> {
        let mut handle = self.platform.start_discovery().await?;
        let session = handle.session;
        self.registry.begin(session).await;

        info!("Discovering peripherals (up to {:?})", self.config.discovery_window);
        self.registry
            .drain(&mut handle, self.config.discovery_window)
            .await;
        self.registry.end().await;
        if let Err(e) = self.platform.stop_discovery(session).await {
            warn!("Failed to stop discovery: {}", e);
        }

        let mut candidates = self.registry.candidates().await;
        if let Some(target) = &self.config.target_name {
            candidates.retain(|c| &c.name == target);
        }

        match candidates.len() {
            1 => {
                let peripheral = candidates.remove(0);
                info!("Selected {} ({})", peripheral.name, peripheral.id);
                Ok(peripheral)
            }
            0 => Err(OtaError::PreconditionViolation(
                "no peripheral found, expected exactly one".into(),
            )),
            n => {
                let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
                Err(OtaError::PreconditionViolation(format!(
                    "{} peripherals found, expected exactly one: {}",
                    n,
                    names.join(", ")
                )))
            }
        }
    }

    async fn pair_once(&self, id: &PeripheralId) -> Result<PairingOutcome> {
        let outcome = self.platform.pair(id).await?;
        if outcome.is_paired() {
            Ok(outcome)
        } else {
            Err(BleError::PairingError(format!("{} refused pairing", id)).into())
        }
    }

    async fn connect_once(&self, id: &PeripheralId) -> Result<()> {
        self.teardown().await;

        let connection = self.platform.connect(id).await?;
        match self.bind(&connection).await {
            Ok(bindings) => {
                debug!("Bound write {} read {:?}", bindings.write.uuid, bindings.read.map(|r| r.uuid));
                *self.link.lock().await = Some(Link {
                    connection,
                    bindings,
                });
                Ok(())
            }
            Err(e) => {
                if let Err(disconnect) = self.platform.disconnect(&connection).await {
                    debug!("Disconnect after failed bind: {}", disconnect);
                }
                Err(e)
            }
        }
    }

    /// Enumerate the last service and bind both roles in it.
    async fn bind(&self, connection: &ConnectionHandle) -> Result<Bindings> {
        let services = self.platform.enumerate_services(connection).await?;
        let service = services
            .last()
            .ok_or_else(|| BleError::GattError("peripheral exposes no services".into()))?;

        let discovered = self
            .platform
            .enumerate_characteristics(connection, service)
            .await?;
        debug!(
            "Service {} characteristics: {:?}",
            service.uuid,
            discovered.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );

        CharacteristicBinder::new(self.config.characteristics.clone()).resolve(&discovered)
    }

    async fn send_once(&self, payload: &[u8], start: u8) -> Result<()> {
        let link = self.current_link().await?;
        if start > 0 {
            info!("Resuming at chunk {}", start);
        }

        let platform = &self.platform;
        let connection = link.connection;
        let write = link.bindings.write;
        self.config
            .transfer_engine()
            .send_from(payload, start, |bytes| async move {
                match platform.write(&connection, &write, &bytes).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("GATT write failed: {}", e);
                        false
                    }
                }
            })
            .await
    }

    async fn read_back(&self) -> Option<Vec<u8>> {
        let link = self.current_link().await.ok()?;
        let read = link.bindings.read?;
        match self.platform.read(&link.connection, &read).await {
            Ok(value) => {
                info!("Read back {}", hex::encode(&value));
                Some(value)
            }
            Err(e) => {
                warn!("Read back failed: {}", e);
                None
            }
        }
    }

    async fn current_link(&self) -> Result<Link> {
        self.link
            .lock()
            .await
            .ok_or(OtaError::Ble(BleError::Disconnected))
    }

    async fn teardown(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = self.platform.disconnect(&link.connection).await {
                debug!("Disconnect failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimGattPlatform, SimPeripheral};

    #[tokio::test(start_paused = true)]
    async fn test_rejects_oversized_payload_before_discovery() {
        let platform = SimGattPlatform::new();
        let id = platform.add_peripheral(SimPeripheral::ota_target("OTA")).await;
        let session = OtaSession::new(platform.clone(), OtaConfig::default());

        let result = session.run_detailed(&vec![0u8; 68 * 255 + 1]).await;
        assert!(matches!(result, Err(OtaError::PayloadTooLarge { .. })));
        assert!(matches!(session.run_detailed(&[]).await, Err(OtaError::EmptyPayload)));
        assert_eq!(platform.stats(&id).await.unwrap().pair_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_name_filter() {
        let platform = SimGattPlatform::new();
        platform.add_peripheral(SimPeripheral::ota_target("Other")).await;
        let id = platform.add_peripheral(SimPeripheral::ota_target("OTA")).await;

        let config = OtaConfig {
            target_name: Some("OTA".into()),
            ..OtaConfig::default()
        };
        let session = OtaSession::new(platform.clone(), config);
        let report = session.run_detailed(&[7u8; 100]).await.unwrap();
        assert_eq!(report.peripheral.id, id);
        assert_eq!(report.chunks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnects_when_done() {
        let platform = SimGattPlatform::new();
        let id = platform.add_peripheral(SimPeripheral::ota_target("OTA")).await;
        let session = OtaSession::new(platform.clone(), OtaConfig::default());

        assert!(session.run(&[1u8; 10]).await);
        assert!(!platform.stats(&id).await.unwrap().connected);
        assert!(session.current_link().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_back() {
        let platform = SimGattPlatform::new();
        platform.add_peripheral(SimPeripheral::ota_target("OTA")).await;
        let config = OtaConfig {
            verify_read: true,
            ..OtaConfig::default()
        };
        let session = OtaSession::new(platform, config);

        let report = session.run_detailed(&[3u8; 150]).await.unwrap();
        assert_eq!(report.read_back, Some(150u32.to_le_bytes().to_vec()));
    }
}
