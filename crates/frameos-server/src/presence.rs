//! Connection presence registry.
//!
//! Every live device connection, in any controller process, owns one TTL'd
//! key `frame:{deviceId}:conn:{connId}` in the shared store. The key is
//! refreshed on each verified inbound frame and by a heartbeat; when a
//! process dies its keys simply lapse. Counting the keys for a device answers
//! "is this device connected anywhere?".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use frameos_core::FrameResult;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::SharedStore;

fn conn_prefix(device_id: &str) -> String {
    format!("frame:{device_id}:conn:")
}

fn conn_key(device_id: &str, conn_id: &Uuid) -> String {
    format!("{}{conn_id}", conn_prefix(device_id))
}

/// Presence records for the connections held by this process.
pub struct PresenceRegistry {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    /// conn id → device id, for the connections this process owns.
    local: RwLock<HashMap<Uuid, String>>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Record a freshly authenticated connection.
    pub async fn mark_alive(&self, device_id: &str, conn_id: Uuid) -> FrameResult<()> {
        self.store
            .set_ex(&conn_key(device_id, &conn_id), "1", self.ttl)
            .await?;
        self.local.write().await.insert(conn_id, device_id.to_string());
        debug!(device_id = %device_id, conn_id = %conn_id, "presence marked");
        Ok(())
    }

    /// Extend the TTL of a connection's record.
    ///
    /// If the record lapsed while the connection stayed up (store hiccup,
    /// long GC pause) it is recreated.
    pub async fn refresh(&self, conn_id: Uuid) -> FrameResult<()> {
        let Some(device_id) = self.local.read().await.get(&conn_id).cloned() else {
            return Ok(());
        };
        let key = conn_key(&device_id, &conn_id);
        if !self.store.expire(&key, self.ttl).await? {
            self.store.set_ex(&key, "1", self.ttl).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, conn_id: Uuid) -> FrameResult<()> {
        let device_id = self.local.write().await.remove(&conn_id);
        if let Some(device_id) = device_id {
            self.store.del(&conn_key(&device_id, &conn_id)).await?;
            debug!(device_id = %device_id, conn_id = %conn_id, "presence removed");
        }
        Ok(())
    }

    /// Live connections for `device_id` across all processes.
    pub async fn count_alive(&self, device_id: &str) -> FrameResult<usize> {
        self.store.count_prefix(&conn_prefix(device_id)).await
    }

    /// Refresh `conn_id` every `interval` until the returned task is aborted.
    pub fn spawn_heartbeat(self: &Arc<Self>, conn_id: Uuid, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.refresh(conn_id).await {
                    warn!(conn_id = %conn_id, error = %e, "presence heartbeat failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> Arc<PresenceRegistry> {
        Arc::new(PresenceRegistry::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn count_drops_to_zero_after_refreshes_stop() {
        let presence = registry();
        let conn = Uuid::new_v4();
        presence.mark_alive("frame-1", conn).await.unwrap();
        let heartbeat = presence.spawn_heartbeat(conn, Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(presence.count_alive("frame-1").await.unwrap(), 1);

        heartbeat.abort();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(presence.count_alive("frame-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counts_are_per_device() {
        let presence = registry();
        let a1 = Uuid::new_v4();
        presence.mark_alive("frame-a", a1).await.unwrap();
        presence.mark_alive("frame-a", Uuid::new_v4()).await.unwrap();
        presence.mark_alive("frame-ab", Uuid::new_v4()).await.unwrap();
        assert_eq!(presence.count_alive("frame-a").await.unwrap(), 2);

        presence.remove(a1).await.unwrap();
        assert_eq!(presence.count_alive("frame-a").await.unwrap(), 1);
        assert_eq!(presence.count_alive("frame-ab").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_recreates_lapsed_record() {
        let presence = registry();
        let conn = Uuid::new_v4();
        presence.mark_alive("frame-1", conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(presence.count_alive("frame-1").await.unwrap(), 0);
        presence.refresh(conn).await.unwrap();
        assert_eq!(presence.count_alive("frame-1").await.unwrap(), 1);
    }
}
