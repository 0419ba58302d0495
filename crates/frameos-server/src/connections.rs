//! Registry of device connections held by this process.

use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, RwLock};
use tracing::info;
use uuid::Uuid;

/// Online/offline notifications for observers (UI pushes, audit logs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Online { device_id: String, conn_id: Uuid },
    Offline { device_id: String, conn_id: Uuid },
}

/// Authenticated connections in this process, grouped by device.
pub struct ConnectionRegistry {
    by_device: RwLock<HashMap<String, HashSet<Uuid>>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_device: RwLock::new(HashMap::new()),
            events: broadcast::channel(256).0,
        }
    }

    /// Record a connection. Returns `true` if it is the device's first one here.
    pub async fn register(&self, device_id: &str, conn_id: Uuid) -> bool {
        let first = {
            let mut map = self.by_device.write().await;
            let conns = map.entry(device_id.to_string()).or_default();
            conns.insert(conn_id);
            conns.len() == 1
        };
        info!(device_id = %device_id, conn_id = %conn_id, "device online");
        let _ = self.events.send(DeviceEvent::Online {
            device_id: device_id.to_string(),
            conn_id,
        });
        first
    }

    /// Drop a connection. Returns `true` if the device has none left here.
    pub async fn unregister(&self, device_id: &str, conn_id: Uuid) -> bool {
        let (removed, last) = {
            let mut map = self.by_device.write().await;
            match map.get_mut(device_id) {
                Some(conns) => {
                    let removed = conns.remove(&conn_id);
                    let last = conns.is_empty();
                    if last {
                        map.remove(device_id);
                    }
                    (removed, last)
                }
                None => (false, false),
            }
        };
        if removed {
            info!(device_id = %device_id, conn_id = %conn_id, "device offline");
            let _ = self.events.send(DeviceEvent::Offline {
                device_id: device_id.to_string(),
                conn_id,
            });
        }
        removed && last
    }

    /// Whether this process holds a live connection for `device_id`.
    pub async fn has_local(&self, device_id: &str) -> bool {
        self.by_device.read().await.contains_key(device_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_and_last_connection_flags() {
        let registry = ConnectionRegistry::new();
        let mut events = registry.subscribe();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(registry.register("frame-1", c1).await);
        assert!(!registry.register("frame-1", c2).await);
        assert!(registry.has_local("frame-1").await);

        assert!(!registry.unregister("frame-1", c1).await);
        assert!(registry.unregister("frame-1", c2).await);
        assert!(!registry.has_local("frame-1").await);
        assert!(!registry.unregister("frame-1", c2).await);

        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent::Online {
                device_id: "frame-1".into(),
                conn_id: c1
            }
        );
    }
}
