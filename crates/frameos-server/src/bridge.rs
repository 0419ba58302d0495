//! Cross-process dispatch through the shared store.
//!
//! A controller process that does not hold a device's connection pushes a job
//! onto `frame:{deviceId}:cmd`. Whichever process does hold it runs a worker
//! that pops jobs, feeds them to its local [`DispatchEngine`], and pushes the
//! outcome to `frame:cmd:resp:{jobId}`, which lapses after a minute if nobody
//! collects it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use frameos_core::{Command, CommandReply, FrameError, FrameResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionRegistry;
use crate::dispatch::{CommandOutcome, DispatchEngine};
use crate::store::SharedStore;

/// How long an uncollected response list survives.
pub const RESPONSE_TTL: Duration = Duration::from_secs(60);

/// Grace on top of the command timeout before the submitter gives up, so the
/// worker's own typed timeout can arrive first.
const SUBMIT_GRACE: Duration = Duration::from_secs(2);

/// How long one worker BLPOP blocks before looping.
const WORKER_POLL: Duration = Duration::from_secs(5);

pub fn job_key(device_id: &str) -> String {
    format!("frame:{device_id}:cmd")
}

pub fn response_key(job_id: &Uuid) -> String {
    format!("frame:cmd:resp:{job_id}")
}

fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A command travelling between processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeJob {
    pub id: Uuid,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub command: Command,
    /// Command timeout in seconds.
    pub timeout: f64,
    /// Unix milliseconds after which the job is worthless.
    pub deadline: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Classification of a failed job, so the submitter can rebuild a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionClosed,
    Device,
    Decode,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeReply {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl BridgeReply {
    fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            body: None,
            error: Some(error.into()),
            kind: Some(kind),
        }
    }

    fn from_outcome(outcome: CommandOutcome) -> Self {
        match outcome {
            Ok(reply) => Self {
                ok: true,
                result: reply.result,
                body: reply.body.map(|b| BASE64.encode(b)),
                error: None,
                kind: None,
            },
            Err(e) => {
                let kind = match &e {
                    FrameError::Timeout { .. } => FailureKind::Timeout,
                    FrameError::ConnectionClosed { .. } => FailureKind::ConnectionClosed,
                    FrameError::Device { message, .. } => {
                        return Self::failure(FailureKind::Device, message.clone())
                    }
                    FrameError::Decode(_) => FailureKind::Decode,
                    _ => FailureKind::Other,
                };
                Self::failure(kind, e.to_string())
            }
        }
    }

    fn into_outcome(self, device_id: &str, command: &str, timeout: Duration) -> CommandOutcome {
        if self.ok {
            let body = match self.body {
                Some(b) => Some(
                    BASE64
                        .decode(b)
                        .map_err(|e| FrameError::Decode(format!("bridge body: {e}")))?,
                ),
                None => None,
            };
            return Ok(CommandReply {
                result: self.result,
                body,
            });
        }
        let message = self.error.unwrap_or_else(|| "agent error".to_string());
        Err(match self.kind.unwrap_or(FailureKind::Other) {
            FailureKind::Timeout => FrameError::Timeout {
                device_id: device_id.to_string(),
                command: command.to_string(),
                secs: timeout.as_secs(),
            },
            FailureKind::ConnectionClosed => FrameError::ConnectionClosed {
                device_id: device_id.to_string(),
                command: command.to_string(),
            },
            FailureKind::Device => FrameError::Device {
                device_id: device_id.to_string(),
                command: command.to_string(),
                message,
            },
            FailureKind::Decode => FrameError::Decode(message),
            FailureKind::Other => FrameError::Other(message),
        })
    }
}

/// Submits jobs for devices connected to some other process.
pub struct BridgeClient {
    store: Arc<dyn SharedStore>,
    /// One outstanding job per device from this process keeps them in order.
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BridgeClient {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .await
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn submit(
        &self,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> FrameResult<CommandReply> {
        let lock = self.lock_for(device_id).await;
        let _guard = lock.lock().await;

        let name = command.name();
        let job = BridgeJob {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            command,
            timeout: timeout.as_secs_f64(),
            deadline: unix_millis() + timeout.as_millis() as i64,
            blob: blob.map(|b| BASE64.encode(b)),
        };
        let job_id = job.id;
        self.store
            .rpush(&job_key(device_id), serde_json::to_string(&job)?)
            .await?;
        debug!(device_id = %device_id, cmd_id = %job_id, command = name, "bridge job submitted");

        let raw = self
            .store
            .blpop(&response_key(&job_id), timeout + SUBMIT_GRACE)
            .await?
            .ok_or_else(|| FrameError::Timeout {
                device_id: device_id.to_string(),
                command: name.to_string(),
                secs: timeout.as_secs(),
            })?;
        let reply: BridgeReply = serde_json::from_str(&raw)
            .map_err(|e| FrameError::Decode(format!("bridge reply: {e}")))?;
        reply.into_outcome(device_id, name, timeout)
    }
}

/// Per-device job consumers for the devices connected to this process.
pub struct BridgeWorkers {
    store: Arc<dyn SharedStore>,
    engine: Arc<DispatchEngine>,
    connections: Arc<ConnectionRegistry>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BridgeWorkers {
    pub fn new(store: Arc<dyn SharedStore>, engine: Arc<DispatchEngine>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            engine,
            connections,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Run a worker for `device_id` exactly when this process holds one of its
    /// connections. Call after every register/unregister; the registry is read
    /// under the workers lock, so overlapping sessions of one device settle on
    /// the state left by the last registry change. Returns whether a worker runs.
    pub async fn sync(&self, device_id: &str) -> bool {
        let mut workers = self.workers.lock().await;
        let wanted = self.connections.has_local(device_id).await;
        let running = workers.get(device_id).is_some_and(|w| !w.is_finished());
        match (wanted, running) {
            (true, false) => {
                let store = self.store.clone();
                let engine = self.engine.clone();
                let device = device_id.to_string();
                workers.insert(
                    device_id.to_string(),
                    tokio::spawn(async move { worker_loop(store, engine, device).await }),
                );
                info!(device_id = %device_id, "bridge worker started");
            }
            (false, _) => {
                if let Some(worker) = workers.remove(device_id) {
                    worker.abort();
                    info!(device_id = %device_id, "bridge worker stopped");
                }
            }
            (true, true) => {}
        }
        wanted
    }
}

async fn worker_loop(store: Arc<dyn SharedStore>, engine: Arc<DispatchEngine>, device_id: String) {
    let key = job_key(&device_id);
    loop {
        match store.blpop(&key, WORKER_POLL).await {
            Ok(Some(raw)) => handle_job(&store, &engine, &device_id, &raw).await,
            Ok(None) => {}
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "bridge worker pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn push_reply(store: &Arc<dyn SharedStore>, job_id: &Uuid, reply: &BridgeReply) {
    let key = response_key(job_id);
    let pushed = match serde_json::to_string(reply) {
        Ok(raw) => store.rpush(&key, raw).await,
        Err(e) => Err(e.into()),
    };
    let expired = match pushed {
        Ok(()) => store.expire(&key, RESPONSE_TTL).await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = expired {
        warn!(cmd_id = %job_id, error = %e, "failed to push bridge reply");
    }
}

async fn handle_job(
    store: &Arc<dyn SharedStore>,
    engine: &Arc<DispatchEngine>,
    device_id: &str,
    raw: &str,
) {
    let job: BridgeJob = match serde_json::from_str(raw) {
        Ok(job) => job,
        Err(e) => {
            // Reply if at least the id is readable so the submitter fails fast.
            let id = serde_json::from_str::<Value>(raw)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                .and_then(|id| Uuid::parse_str(&id).ok());
            warn!(device_id = %device_id, error = %e, "malformed bridge job");
            if let Some(id) = id {
                push_reply(store, &id, &BridgeReply::failure(FailureKind::Other, format!("malformed job: {e}"))).await;
            }
            return;
        }
    };

    let remaining_ms = job.deadline - unix_millis();
    if remaining_ms <= 0 {
        debug!(device_id = %device_id, cmd_id = %job.id, "dropping bridge job past its deadline");
        return;
    }

    let blob = match job.blob.as_deref().map(|b| BASE64.decode(b)).transpose() {
        Ok(blob) => blob,
        Err(e) => {
            push_reply(store, &job.id, &BridgeReply::failure(FailureKind::Decode, format!("bad blob: {e}"))).await;
            return;
        }
    };

    let timeout = Duration::from_millis(remaining_ms as u64);
    let (handle, local_id) = engine.enqueue(device_id, job.command, blob, timeout);
    debug!(device_id = %device_id, cmd_id = %job.id, local_id = %local_id, "bridge job enqueued");

    let store = store.clone();
    tokio::spawn(async move {
        let reply = BridgeReply::from_outcome(handle.wait().await);
        push_reply(&store, &job.id, &reply).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn job_round_trips_through_worker() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let engine = DispatchEngine::new();
        let connections = Arc::new(ConnectionRegistry::new());
        let workers = BridgeWorkers::new(store.clone(), engine.clone(), connections.clone());
        let conn = Uuid::new_v4();
        connections.register("frame-1", conn).await;
        assert!(workers.sync("frame-1").await);

        // Play the device: answer whatever the engine hands out.
        let device = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let item = engine.next_for("frame-1").await;
                assert_eq!(item.blob.as_deref(), Some(&b"payload"[..]));
                engine.resolve_response(&item.id, true, json!({"exit": 0}), Some(b"out".to_vec()));
            })
        };

        let client = BridgeClient::new(store.clone());
        let reply = client
            .submit("frame-1", Command::shell("echo hi"), Some(b"payload".to_vec()), Duration::from_secs(5))
            .await
            .unwrap();
        device.await.unwrap();
        assert_eq!(reply.exit_code(), Some(0));
        assert_eq!(reply.body.as_deref(), Some(&b"out"[..]));
        connections.unregister("frame-1", conn).await;
        assert!(!workers.sync("frame-1").await);
        assert!(workers.workers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn quick_reconnect_keeps_worker() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let engine = DispatchEngine::new();
        let connections = Arc::new(ConnectionRegistry::new());
        let workers = BridgeWorkers::new(store.clone(), engine.clone(), connections.clone());

        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        connections.register("frame-1", old).await;
        assert!(workers.sync("frame-1").await);

        // Old session unregisters, new one registers and syncs, then the old
        // session's sync runs last.
        assert!(connections.unregister("frame-1", old).await);
        assert!(connections.register("frame-1", new).await);
        assert!(workers.sync("frame-1").await);
        assert!(workers.sync("frame-1").await);

        let workers_map = workers.workers.lock().await;
        assert!(workers_map.get("frame-1").is_some_and(|w| !w.is_finished()));
        drop(workers_map);

        // The surviving worker still serves cross-process jobs.
        let device = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let item = engine.next_for("frame-1").await;
                engine.resolve_response(&item.id, true, json!({"exit": 0}), None);
            })
        };
        let reply = BridgeClient::new(store)
            .submit("frame-1", Command::shell("true"), None, Duration::from_secs(5))
            .await
            .unwrap();
        device.await.unwrap();
        assert_eq!(reply.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn device_errors_keep_their_type() {
        let reply = BridgeReply::from_outcome(Err(FrameError::Device {
            device_id: "frame-1".into(),
            command: "shell".into(),
            message: "no such file".into(),
        }));
        let raw = serde_json::to_string(&reply).unwrap();
        let back: BridgeReply = serde_json::from_str(&raw).unwrap();
        match back.into_outcome("frame-1", "shell", Duration::from_secs(1)) {
            Err(FrameError::Device { message, .. }) => assert_eq!(message, "no such file"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_blob_gets_immediate_error_reply() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let engine = DispatchEngine::new();
        let id = Uuid::new_v4();
        let raw = json!({
            "id": id,
            "deviceId": "frame-1",
            "command": {"name": "shell", "args": {"cmd": "true"}},
            "timeout": 5.0,
            "deadline": unix_millis() + 5_000,
            "blob": "***not base64***",
        })
        .to_string();
        handle_job(&store, &engine, "frame-1", &raw).await;

        let reply = store.blpop(&response_key(&id), Duration::ZERO).await.unwrap().unwrap();
        let reply: BridgeReply = serde_json::from_str(&reply).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.kind, Some(FailureKind::Decode));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn expired_jobs_are_dropped() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let engine = DispatchEngine::new();
        let job = BridgeJob {
            id: Uuid::new_v4(),
            device_id: "frame-1".into(),
            command: Command::shell("true"),
            timeout: 1.0,
            deadline: unix_millis() - 1,
            blob: None,
        };
        handle_job(&store, &engine, "frame-1", &serde_json::to_string(&job).unwrap()).await;
        assert_eq!(engine.queued_count("frame-1"), 0);
        assert_eq!(engine.pending_count(), 0);
    }
}
