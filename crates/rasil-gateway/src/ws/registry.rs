//! Per-license WebSocket connection registry with pub/sub fan-out.
//!
//! Every event is published to the bus; each worker runs one forwarder task
//! per license with local connections, delivering bus traffic to its own
//! sockets only. With the in-proc bus this collapses to a local loop, so
//! single-worker deployments behave identically.

use std::collections::HashMap;

use dashmap::DashMap;
use rasil_cache::EventBus;
use rasil_core::types::{EventKind, LicenseId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound frame shape: {event, data, timestamp}.
pub fn frame(kind: EventKind, data: &serde_json::Value) -> String {
    serde_json::json!({
        "event": kind.as_str(),
        "data": data,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

pub struct WsRegistry {
    bus: EventBus,
    connections: DashMap<LicenseId, HashMap<String, mpsc::Sender<String>>>,
    forwarders: DashMap<LicenseId, JoinHandle<()>>,
}

impl WsRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            connections: DashMap::new(),
            forwarders: DashMap::new(),
        }
    }

    /// Register a connection; the first local connection for a license
    /// spawns its bus forwarder.
    pub async fn register(
        self: std::sync::Arc<Self>,
        license_id: LicenseId,
        conn_id: String,
        tx: mpsc::Sender<String>,
    ) {
        let first = {
            let mut entry = self.connections.entry(license_id).or_default();
            let first = entry.is_empty();
            entry.insert(conn_id.clone(), tx);
            first
        };
        info!(license_id, conn_id, total = self.connection_count(), "ws connected");

        if first {
            match self.bus.subscribe(license_id).await {
                Ok(mut subscription) => {
                    let registry = self.clone();
                    let handle = tokio::spawn(async move {
                        while let Ok(payload) = subscription.next().await {
                            registry.deliver_local(license_id, payload).await;
                        }
                        debug!(license_id, "ws bus forwarder ended");
                    });
                    self.forwarders.insert(license_id, handle);
                }
                Err(e) => warn!(license_id, error = %e, "bus subscribe failed, local-only fan-out"),
            }
        }
    }

    /// Drop a connection; the last one for a license stops its forwarder.
    pub fn unregister(&self, license_id: LicenseId, conn_id: &str) {
        let now_empty = {
            match self.connections.get_mut(&license_id) {
                Some(mut entry) => {
                    entry.remove(conn_id);
                    entry.is_empty()
                }
                None => false,
            }
        };
        if now_empty {
            self.connections.remove(&license_id);
            if let Some((_, handle)) = self.forwarders.remove(&license_id) {
                handle.abort();
            }
        }
        info!(license_id, conn_id, "ws disconnected");
    }

    /// Publish an event for a license. When the bus is up it carries the
    /// frame to every worker; delivery to sockets happens in the forwarders.
    pub async fn broadcast(&self, license_id: LicenseId, kind: EventKind, data: serde_json::Value) {
        let payload = frame(kind, &data);
        if self.bus.publish(license_id, payload.clone()).await.is_err() {
            // Bus down: deliver to our own sockets so local clients still
            // see the event.
            self.deliver_local(license_id, payload).await;
        }
    }

    async fn deliver_local(&self, license_id: LicenseId, payload: String) {
        let senders: Vec<(String, mpsc::Sender<String>)> = match self.connections.get(&license_id)
        {
            Some(entry) => entry
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for (conn_id, tx) in senders {
            if tx.send(payload.clone()).await.is_err() {
                dead.push(conn_id);
            }
        }
        for conn_id in dead {
            self.unregister(license_id, &conn_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.len()).sum()
    }

    pub fn connected_licenses(&self) -> Vec<LicenseId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn broadcast_reaches_only_that_licenses_connections() {
        let registry = Arc::new(WsRegistry::new(EventBus::local()));
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.clone().register(1, "c1".into(), tx1).await;
        registry.clone().register(2, "c2".into(), tx2).await;

        registry
            .broadcast(1, EventKind::NewMessage, serde_json::json!({"x": 1}))
            .await;

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("new_message"));
        assert!(rx2.try_recv().is_err(), "license 2 must not receive it");
    }

    #[tokio::test]
    async fn dead_connections_are_swept() {
        let registry = Arc::new(WsRegistry::new(EventBus::local()));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        registry.clone().register(1, "dead".into(), tx).await;

        registry
            .broadcast(1, EventKind::Notification, serde_json::json!({}))
            .await;
        // Give the forwarder a moment to hit the dead sender.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(registry.connection_count(), 0);
    }
}
