//! Shared key/value store used for presence and cross-process dispatch.
//!
//! Only the handful of primitives the controller needs are exposed: TTL'd
//! string keys, prefix counting, and FIFO lists with a blocking pop.
//! [`MemoryStore`] serves a single process (and tests); `RedisStore` lets
//! several controller processes share one keyspace.

#[cfg(feature = "redis")]
mod redis_store;

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use frameos_core::{FrameError, FrameResult};
use tokio::sync::Notify;
use tokio::time::Instant;

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FrameResult<()>;

    /// Reset the expiry of an existing key. Returns `false` if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> FrameResult<bool>;

    async fn del(&self, key: &str) -> FrameResult<()>;

    /// Number of live keys starting with `prefix`.
    async fn count_prefix(&self, prefix: &str) -> FrameResult<usize>;

    /// Append to the tail of the list at `key`.
    async fn rpush(&self, key: &str, value: String) -> FrameResult<()>;

    /// Pop the head of the list at `key`, waiting up to `timeout` for one.
    async fn blpop(&self, key: &str, timeout: Duration) -> FrameResult<Option<String>>;
}

#[derive(Debug)]
enum SlotValue {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Slot {
    value: SlotValue,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local store with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_pop(&self, key: &str) -> FrameResult<Option<String>> {
        let now = Instant::now();
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return Ok(None);
        };
        if !slot.is_live(now) {
            slots.remove(key);
            return Ok(None);
        }
        let popped = match &mut slot.value {
            SlotValue::List(list) => list.pop_front(),
            SlotValue::Str(_) => return Err(wrong_type(key)),
        };
        if matches!(&slot.value, SlotValue::List(list) if list.is_empty()) {
            slots.remove(key);
        }
        Ok(popped)
    }
}

fn wrong_type(key: &str) -> FrameError {
    FrameError::Store(format!("key {key} holds the wrong kind of value"))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FrameResult<()> {
        self.slots().insert(
            key.to_string(),
            Slot {
                value: SlotValue::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FrameResult<bool> {
        let now = Instant::now();
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(slot) if slot.is_live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            Some(_) => {
                slots.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> FrameResult<()> {
        self.slots().remove(key);
        Ok(())
    }

    async fn count_prefix(&self, prefix: &str) -> FrameResult<usize> {
        let now = Instant::now();
        let mut slots = self.slots();
        slots.retain(|_, slot| slot.is_live(now));
        Ok(slots.keys().filter(|k| k.starts_with(prefix)).count())
    }

    async fn rpush(&self, key: &str, value: String) -> FrameResult<()> {
        {
            let now = Instant::now();
            let mut slots = self.slots();
            if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
                slots.remove(key);
            }
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                value: SlotValue::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut slot.value {
                SlotValue::List(list) => list.push_back(value),
                SlotValue::Str(_) => return Err(wrong_type(key)),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> FrameResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set_ex("frame:a:conn:1", "1", Duration::from_secs(60)).await.unwrap();
        store.set_ex("frame:a:conn:2", "1", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.count_prefix("frame:a:conn:").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.count_prefix("frame:a:conn:").await.unwrap(), 1);
        assert!(!store.expire("frame:a:conn:2", Duration::from_secs(60)).await.unwrap());

        assert!(store.expire("frame:a:conn:1", Duration::from_secs(60)).await.unwrap());
        tokio::time::advance(Duration::from_secs(55)).await;
        assert_eq!(store.count_prefix("frame:a:conn:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_is_fifo() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c"] {
            store.rpush("q", v.to_string()).await.unwrap();
        }
        let mut out = Vec::new();
        while let Some(v) = store.blpop("q", Duration::ZERO).await.unwrap() {
            out.push(v);
        }
        assert_eq!(out, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn blpop_waits_for_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.blpop("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.rpush("q", "job".into()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().as_deref(), Some("job"));
    }

    #[tokio::test(start_paused = true)]
    async fn blpop_times_out_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.blpop("q", Duration::from_secs(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_type_is_a_store_error() {
        let store = MemoryStore::new();
        store.set_ex("k", "1", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(store.rpush("k", "x".into()).await, Err(FrameError::Store(_))));
    }
}
