//! Discovered peripheral registry
//!
//! Discovery events arrive on the platform's single-consumer queue and are
//! folded into a registry that only accepts events of the active discovery
//! session. Peripherals advertised without a name wait in an unnamed list
//! until an update supplies one.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ble::platform::{DiscoveryEvent, DiscoveryHandle, DiscoverySessionId, PeripheralId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub name: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    active: Option<DiscoverySessionId>,
    named: Vec<DiscoveredPeripheral>,
    unnamed: Vec<PeripheralId>,
    completed: bool,
}

impl RegistryState {
    fn upsert(&mut self, id: PeripheralId, name: Option<String>) {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                self.unnamed.retain(|u| u != &id);
                match self.named.iter_mut().find(|p| p.id == id) {
                    Some(existing) => existing.name = name,
                    None => {
                        info!("Found {} ({})", name, id);
                        self.named.push(DiscoveredPeripheral { id, name });
                    }
                }
            }
            None => {
                if !self.unnamed.contains(&id) && !self.named.iter().any(|p| p.id == id) {
                    debug!("Found unnamed peripheral {}", id);
                    self.unnamed.push(id);
                }
            }
        }
    }

    fn remove(&mut self, id: &PeripheralId) {
        self.named.retain(|p| &p.id != id);
        self.unnamed.retain(|u| u != id);
    }
}

/// Shared view of what the active discovery session has seen.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and accept events of `session` only.
    pub async fn begin(&self, session: DiscoverySessionId) {
        let mut state = self.state.lock().await;
        *state = RegistryState {
            active: Some(session),
            ..RegistryState::default()
        };
    }

    /// Stop accepting events. Collected peripherals are kept.
    pub async fn end(&self) {
        self.state.lock().await.active = None;
    }

    /// Fold one event into the registry. Returns false for events of any
    /// session other than the active one.
    pub async fn apply(&self, event: DiscoveryEvent) -> bool {
        let mut state = self.state.lock().await;
        if state.active != Some(event.session()) {
            debug!("Ignoring stale discovery event {:?}", event);
            return false;
        }

        match event {
            DiscoveryEvent::Found { id, name, .. } => state.upsert(id, name),
            DiscoveryEvent::Updated { id, name, .. } => state.upsert(id, name),
            DiscoveryEvent::Removed { id, .. } => state.remove(&id),
            DiscoveryEvent::EnumerationCompleted { .. } | DiscoveryEvent::Stopped { .. } => {
                state.completed = true;
            }
        }
        true
    }

    /// Named peripherals in the order they were first seen.
    pub async fn candidates(&self) -> Vec<DiscoveredPeripheral> {
        self.state.lock().await.named.clone()
    }

    pub async fn unnamed(&self) -> Vec<PeripheralId> {
        self.state.lock().await.unnamed.clone()
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.completed
    }

    /// Consume events from `handle` until the platform reports the
    /// enumeration complete, the queue closes, or `window` elapses.
    /// Returns the number of events applied.
    pub async fn drain(&self, handle: &mut DiscoveryHandle, window: Duration) -> usize {
        let deadline = Instant::now() + window;
        let mut applied = 0;

        loop {
            let event = match tokio::time::timeout_at(deadline, handle.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("Discovery queue closed");
                    break;
                }
                Err(_) => {
                    debug!("Discovery window of {:?} elapsed", window);
                    break;
                }
            };

            let terminal = matches!(
                event,
                DiscoveryEvent::EnumerationCompleted { .. } | DiscoveryEvent::Stopped { .. }
            );
            if self.apply(event).await {
                applied += 1;
                if terminal {
                    break;
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn peripheral(n: u8) -> PeripheralId {
        PeripheralId::Real([0, 0, 0, 0, 0, n])
    }

    fn found(session: u64, n: u8, name: Option<&str>) -> DiscoveryEvent {
        DiscoveryEvent::Found {
            session: DiscoverySessionId(session),
            id: peripheral(n),
            name: name.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_stale_session_ignored() {
        let registry = DiscoveryRegistry::new();
        registry.begin(DiscoverySessionId(2)).await;

        assert!(!registry.apply(found(1, 1, Some("old"))).await);
        assert!(registry.apply(found(2, 2, Some("new"))).await);
        assert!(
            !registry
                .apply(DiscoveryEvent::EnumerationCompleted {
                    session: DiscoverySessionId(1)
                })
                .await
        );

        let candidates = registry.candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "new");
        assert!(!registry.is_complete().await);
    }

    #[tokio::test]
    async fn test_nothing_accepted_outside_session() {
        let registry = DiscoveryRegistry::new();
        assert!(!registry.apply(found(1, 1, Some("A"))).await);

        registry.begin(DiscoverySessionId(1)).await;
        registry.end().await;
        assert!(!registry.apply(found(1, 1, Some("A"))).await);
        assert!(registry.candidates().await.is_empty());
    }

    #[tokio::test]
    async fn test_unnamed_promoted_on_update() {
        let registry = DiscoveryRegistry::new();
        let session = DiscoverySessionId(7);
        registry.begin(session).await;

        registry.apply(found(7, 1, None)).await;
        registry.apply(found(7, 2, Some(""))).await;
        assert!(registry.candidates().await.is_empty());
        assert_eq!(registry.unnamed().await.len(), 2);

        registry
            .apply(DiscoveryEvent::Updated {
                session,
                id: peripheral(1),
                name: Some("OTA".into()),
            })
            .await;
        assert_eq!(
            registry.candidates().await,
            vec![DiscoveredPeripheral {
                id: peripheral(1),
                name: "OTA".into()
            }]
        );
        assert_eq!(registry.unnamed().await, vec![peripheral(2)]);
    }

    #[tokio::test]
    async fn test_removed_dropped() {
        let registry = DiscoveryRegistry::new();
        let session = DiscoverySessionId(1);
        registry.begin(session).await;

        registry.apply(found(1, 1, Some("A"))).await;
        registry.apply(found(1, 2, None)).await;
        registry.apply(DiscoveryEvent::Removed { session, id: peripheral(1) }).await;
        registry.apply(DiscoveryEvent::Removed { session, id: peripheral(2) }).await;

        assert!(registry.candidates().await.is_empty());
        assert!(registry.unnamed().await.is_empty());
    }

    #[tokio::test]
    async fn test_begin_resets() {
        let registry = DiscoveryRegistry::new();
        registry.begin(DiscoverySessionId(1)).await;
        registry.apply(found(1, 1, Some("A"))).await;
        registry.begin(DiscoverySessionId(2)).await;
        assert!(registry.candidates().await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_stops_on_completion() {
        let (tx, rx) = mpsc::channel(8);
        let session = DiscoverySessionId(3);
        let mut handle = DiscoveryHandle { session, events: rx };

        tx.send(found(2, 9, Some("stale"))).await.unwrap();
        tx.send(found(3, 1, Some("A"))).await.unwrap();
        tx.send(DiscoveryEvent::EnumerationCompleted { session }).await.unwrap();
        tx.send(found(3, 2, Some("late"))).await.unwrap();

        let registry = DiscoveryRegistry::new();
        registry.begin(session).await;
        let applied = registry.drain(&mut handle, Duration::from_secs(10)).await;

        assert_eq!(applied, 2);
        assert!(registry.is_complete().await);
        assert_eq!(registry.candidates().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_bounded_by_window() {
        let (tx, rx) = mpsc::channel(8);
        let session = DiscoverySessionId(1);
        let mut handle = DiscoveryHandle { session, events: rx };
        tx.send(found(1, 1, Some("A"))).await.unwrap();

        let registry = DiscoveryRegistry::new();
        registry.begin(session).await;

        let before = Instant::now();
        let applied = registry.drain(&mut handle, Duration::from_secs(10)).await;
        assert_eq!(applied, 1);
        assert!(before.elapsed() >= Duration::from_secs(10));
        assert!(!registry.is_complete().await);
        drop(tx);
    }
}
