//! Per-device command queues and reply correlation.
//!
//! Callers enqueue commands and await a [`CompletionHandle`]. The send loop
//! of whichever connection currently serves the device pulls commands in FIFO
//! order. Replies are matched back by command id. Every command has its own
//! timer; once it fires the command is forgotten, so a late reply or a
//! still-queued copy is ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use frameos_core::messages::error_text;
use frameos_core::{Command, FrameError};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::completion::{completion, CommandOutcome, CompletionHandle, CompletionSlot};
use super::reassembly::merge_body;

/// A command waiting for (or being handed to) a send loop.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub device_id: String,
    pub command: Command,
    pub blob: Option<Vec<u8>>,
}

#[derive(Debug)]
struct Pending {
    device_id: String,
    command: &'static str,
    slot: CompletionSlot,
    /// Connection the command was sent on, once it has been sent.
    owner: Option<Uuid>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    items: VecDeque<QueuedCommand>,
    ready: Arc<Notify>,
}

#[derive(Debug, Default)]
pub struct DispatchEngine {
    queues: Mutex<HashMap<String, DeviceQueue>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DispatchEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `command` for `device_id`; it fails with `Timeout` after `timeout`.
    pub fn enqueue(
        self: &Arc<Self>,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> (CompletionHandle, Uuid) {
        let id = Uuid::new_v4();
        let (slot, handle) = completion(id);
        let name = command.name();

        let timer = {
            let engine: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(engine) = engine.upgrade() {
                    engine.expire(id, timeout);
                }
            })
        };

        locked(&self.pending).insert(
            id,
            Pending {
                device_id: device_id.to_string(),
                command: name,
                slot,
                owner: None,
                timer: Some(timer),
            },
        );

        let ready = {
            let mut queues = locked(&self.queues);
            let queue = queues.entry(device_id.to_string()).or_default();
            queue.items.push_back(QueuedCommand {
                id,
                device_id: device_id.to_string(),
                command,
                blob,
            });
            queue.ready.clone()
        };
        ready.notify_waiters();
        debug!(device_id = %device_id, cmd_id = %id, command = name, "command queued");
        (handle, id)
    }

    fn expire(&self, id: Uuid, timeout: Duration) {
        let Some(pending) = locked(&self.pending).remove(&id) else {
            return;
        };
        warn!(
            device_id = %pending.device_id,
            cmd_id = %id,
            command = pending.command,
            "command timed out"
        );
        let _ = pending.slot.resolve(Err(FrameError::Timeout {
            device_id: pending.device_id,
            command: pending.command.to_string(),
            secs: timeout.as_secs(),
        }));
    }

    fn ready_for(&self, device_id: &str) -> Arc<Notify> {
        locked(&self.queues)
            .entry(device_id.to_string())
            .or_default()
            .ready
            .clone()
    }

    fn pop_live(&self, device_id: &str) -> Option<QueuedCommand> {
        let mut queues = locked(&self.queues);
        let queue = queues.get_mut(device_id)?;
        let pending = locked(&self.pending);
        while let Some(item) = queue.items.pop_front() {
            if pending.contains_key(&item.id) {
                return Some(item);
            }
            debug!(device_id = %device_id, cmd_id = %item.id, "dropping expired command");
        }
        None
    }

    /// Wait for the next live command for `device_id`.
    pub async fn next_for(&self, device_id: &str) -> QueuedCommand {
        let ready = self.ready_for(device_id);
        loop {
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.pop_live(device_id) {
                return item;
            }
            notified.await;
        }
    }

    /// Put an undelivered command back at the head of its device queue.
    pub fn requeue_front(&self, item: QueuedCommand) {
        self.unmark(&item.id);
        let ready = {
            let mut queues = locked(&self.queues);
            let queue = queues.entry(item.device_id.clone()).or_default();
            debug!(device_id = %item.device_id, cmd_id = %item.id, "command requeued");
            queue.items.push_front(item);
            queue.ready.clone()
        };
        ready.notify_waiters();
    }

    /// Record that `id` went out on `conn_id`. `false` if it already resolved.
    pub fn mark_sent(&self, id: &Uuid, conn_id: Uuid) -> bool {
        match locked(&self.pending).get_mut(id) {
            Some(p) => {
                p.owner = Some(conn_id);
                true
            }
            None => false,
        }
    }

    pub fn unmark(&self, id: &Uuid) {
        if let Some(p) = locked(&self.pending).get_mut(id) {
            p.owner = None;
        }
    }

    /// Resolve `id` with `outcome`. `false` if it was no longer pending.
    pub fn resolve(&self, id: &Uuid, outcome: CommandOutcome) -> bool {
        let Some(mut pending) = locked(&self.pending).remove(id) else {
            debug!(cmd_id = %id, "reply for unknown or expired command ignored");
            return false;
        };
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.slot.resolve(outcome).is_ok()
    }

    /// Resolve `id` from a device `cmd/resp`.
    pub fn resolve_response(&self, id: &Uuid, ok: bool, result: Value, body: Option<Vec<u8>>) -> bool {
        let outcome = if ok {
            merge_body(result, body)
        } else {
            let (device_id, command) = self
                .describe(id)
                .unwrap_or_else(|| (String::new(), String::new()));
            Err(FrameError::Device {
                device_id,
                command,
                message: error_text(&result),
            })
        };
        self.resolve(id, outcome)
    }

    fn describe(&self, id: &Uuid) -> Option<(String, String)> {
        locked(&self.pending)
            .get(id)
            .map(|p| (p.device_id.clone(), p.command.to_string()))
    }

    /// Fail every command that was sent on `conn_id` and is still unanswered.
    pub fn fail_connection(&self, conn_id: Uuid) -> usize {
        let owned: Vec<(Uuid, Pending)> = {
            let mut pending = locked(&self.pending);
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.owner == Some(conn_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let n = owned.len();
        for (id, mut p) in owned {
            if let Some(timer) = p.timer.take() {
                timer.abort();
            }
            debug!(device_id = %p.device_id, cmd_id = %id, "connection closed with command in flight");
            let _ = p.slot.resolve(Err(FrameError::ConnectionClosed {
                device_id: p.device_id,
                command: p.command.to_string(),
            }));
        }
        n
    }

    /// Whether `id` is still waiting for its reply.
    pub fn is_pending(&self, id: &Uuid) -> bool {
        locked(&self.pending).contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        locked(&self.pending).len()
    }

    pub fn queued_count(&self, device_id: &str) -> usize {
        locked(&self.queues)
            .get(device_id)
            .map_or(0, |q| q.items.len())
    }
}
