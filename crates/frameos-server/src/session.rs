//! One device connection, from accepted socket to cleanup.
//!
//! After the handshake the socket is split: a send-loop task drains the
//! device's command queue, while the receive loop verifies every inbound
//! envelope, feeds replies back to the dispatch engine and collects binary
//! reply bodies.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frameos_core::envelope::unix_now;
use frameos_core::{sign, verify_text, DeviceMessage, FrameError, FrameResult, NonceTracker};
use futures_util::{Sink, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::devices::DeviceRecord;
use crate::dispatch::{Appended, QueuedCommand, ReassemblyTable};
use crate::handshake::{authenticate, Handshake};
use crate::logsink::forward_lines;
use crate::server::ServerState;
use crate::transport::websocket::{close_with, recv_frame, send_binary, send_text, Inbound, WebSocketConnection};

/// Binary blobs go out in frames of at most this size.
pub const BLOB_FRAME_SIZE: usize = 1024 * 1024;

/// How long cleanup waits for the send loop to notice it should stop.
const SEND_LOOP_GRACE: Duration = Duration::from_secs(5);

/// Decrements the live socket count when the connection ends.
struct SocketSlot<'a>(&'a ServerState);

impl Drop for SocketSlot<'_> {
    fn drop(&mut self) {
        self.0.active_sockets.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one accepted socket through the handshake and, if it succeeds, the session.
pub async fn serve_connection(state: Arc<ServerState>, conn: WebSocketConnection) {
    let WebSocketConnection {
        mut ws_stream,
        remote_addr,
    } = conn;

    let live = state.active_sockets.fetch_add(1, Ordering::SeqCst) + 1;
    let _slot = SocketSlot(&state);
    if live > state.config.max_connections {
        warn!(remote = %remote_addr, live, "connection limit reached");
        close_with(&mut ws_stream, CloseCode::Again, "server busy").await;
        return;
    }

    let allowed = state.rate_limits.lock().await.allows(remote_addr.ip());
    if !allowed {
        warn!(remote = %remote_addr, "too many failed handshakes");
        close_with(&mut ws_stream, CloseCode::Policy, "rate limited").await;
        return;
    }

    let mut handshake = Handshake::new(state.directory.clone());
    let device = match authenticate(&mut ws_stream, &mut handshake, state.config.hello_timeout).await {
        Ok(device) => device,
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "handshake failed");
            if !matches!(e, FrameError::Transport(_)) {
                state.rate_limits.lock().await.record_failure(remote_addr.ip());
                close_with(&mut ws_stream, CloseCode::Policy, "handshake failed").await;
            }
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    if let Err(e) = handshake.activate() {
        warn!(device_id = %device.device_id, error = %e, "handshake state out of sync");
    }
    info!(device_id = %device.device_id, conn_id = %conn_id, remote = %remote_addr, "session started");
    run_session(&state, ws_stream, device, conn_id).await;
    handshake.close();
}

async fn run_session<T>(state: &Arc<ServerState>, mut ws: WebSocketStream<T>, device: DeviceRecord, conn_id: Uuid)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let device_id = device.device_id.clone();
    state.connections.register(&device_id, conn_id).await;
    state.bridge.sync(&device_id).await;
    // Presence goes last so a visible record always has a local route behind it.
    if let Err(e) = state.presence.mark_alive(&device_id, conn_id).await {
        warn!(device_id = %device_id, error = %e, "cannot record presence");
        close_with(&mut ws, CloseCode::Again, "presence unavailable").await;
        state.connections.unregister(&device_id, conn_id).await;
        state.bridge.sync(&device_id).await;
        return;
    }
    let heartbeat = state
        .presence
        .spawn_heartbeat(conn_id, state.config.presence_refresh);

    let (sink, mut stream) = ws.split();
    let sink = Arc::new(AsyncMutex::new(sink));
    let reassembly = Arc::new(Mutex::new(ReassemblyTable::new()));
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut sender = tokio::spawn(send_loop(
        state.clone(),
        sink.clone(),
        reassembly.clone(),
        device.clone(),
        conn_id,
        stop_rx,
    ));

    let mut nonces = NonceTracker::new(state.config.nonce_policy);
    let close: Option<(CloseCode, &'static str)> = loop {
        let frame = match tokio::time::timeout(state.config.idle_timeout, recv_frame(&mut stream)).await {
            Err(_) => {
                info!(device_id = %device_id, conn_id = %conn_id, "idle timeout");
                break Some((CloseCode::Normal, "idle timeout"));
            }
            Ok(Err(e)) => {
                debug!(device_id = %device_id, conn_id = %conn_id, error = %e, "receive failed");
                break None;
            }
            Ok(Ok(frame)) => frame,
        };
        match frame {
            Inbound::Closed => break None,
            Inbound::Binary(data) => {
                let appended = lock(&reassembly).append(&data, |id| state.engine.is_pending(id));
                match appended {
                    Appended::Stored => {}
                    Appended::NoCommand => {
                        warn!(device_id = %device_id, len = data.len(), "binary frame with no waiting command dropped");
                    }
                    Appended::Discarded => {
                        debug!(device_id = %device_id, len = data.len(), "binary frame for expired or oversized reply dropped");
                    }
                }
            }
            Inbound::Text(raw) => {
                if let Err(e) = handle_text(state, &device, conn_id, &reassembly, &mut nonces, &raw).await {
                    warn!(device_id = %device_id, conn_id = %conn_id, error = %e, "rejecting connection");
                    break Some((CloseCode::Policy, "invalid message"));
                }
            }
        }
    };

    // Cleanup: stop sending, fail in-flight work, drop presence.
    let _ = stop_tx.send(true);
    if tokio::time::timeout(SEND_LOOP_GRACE, &mut sender).await.is_err() {
        sender.abort();
    }
    heartbeat.abort();
    if let Some((code, reason)) = close {
        close_with(&mut *sink.lock().await, code, reason).await;
    }
    let failed = state.engine.fail_connection(conn_id);
    let discarded = lock(&reassembly).discard_all();
    if let Err(e) = state.presence.remove(conn_id).await {
        warn!(device_id = %device_id, error = %e, "failed to remove presence record");
    }
    state.connections.unregister(&device_id, conn_id).await;
    let bridged = state.bridge.sync(&device_id).await;
    info!(
        device_id = %device_id,
        conn_id = %conn_id,
        failed,
        discarded,
        queued = state.engine.queued_count(&device_id),
        pending = state.engine.pending_count(),
        bridged,
        "session closed"
    );
}

fn lock(table: &Mutex<ReassemblyTable>) -> std::sync::MutexGuard<'_, ReassemblyTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn handle_text(
    state: &ServerState,
    device: &DeviceRecord,
    conn_id: Uuid,
    reassembly: &Mutex<ReassemblyTable>,
    nonces: &mut NonceTracker,
    raw: &str,
) -> FrameResult<()> {
    let (nonce, payload) = verify_text(raw, &device.api_key, &device.shared_secret)?;
    nonces.check(nonce, unix_now())?;
    if let Err(e) = state.presence.refresh(conn_id).await {
        warn!(device_id = %device.device_id, error = %e, "presence refresh failed");
    }

    match DeviceMessage::from_payload(payload)? {
        DeviceMessage::CmdResp { id, ok, result } => {
            let Ok(id) = Uuid::parse_str(&id) else {
                warn!(device_id = %device.device_id, id = %id, "cmd/resp with malformed id");
                return Ok(());
            };
            let body = lock(reassembly).take(&id, |id| state.engine.is_pending(id));
            let resolved = match body {
                Ok(body) => state.engine.resolve_response(&id, ok, result, body),
                Err(e) => state.engine.resolve(&id, Err(e)),
            };
            if !resolved {
                debug!(device_id = %device.device_id, cmd_id = %id, "late reply ignored");
            }
        }
        DeviceMessage::CmdStream { stream, data, .. } => {
            forward_lines(&*state.log_sink, &device.device_id, stream, &data);
        }
        DeviceMessage::Unknown => {
            debug!(device_id = %device.device_id, "ignoring unknown message type");
        }
    }
    Ok(())
}

type SharedSink<K> = Arc<AsyncMutex<K>>;

async fn send_loop<K>(
    state: Arc<ServerState>,
    sink: SharedSink<K>,
    reassembly: Arc<Mutex<ReassemblyTable>>,
    device: DeviceRecord,
    conn_id: Uuid,
    mut stop: watch::Receiver<bool>,
) where
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    let engine = &state.engine;
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.changed() => break,
            item = engine.next_for(&device.device_id) => item,
        };
        if !engine.mark_sent(&item.id, conn_id) {
            continue;
        }
        let text = match item
            .command
            .to_payload(&item.id)
            .and_then(|payload| sign(payload, &device.api_key, &device.shared_secret).to_text())
        {
            Ok(text) => text,
            Err(e) => {
                engine.resolve(&item.id, Err(e));
                continue;
            }
        };
        if item.command.expects_binary_reply() {
            lock(&reassembly).expect(item.id);
        }
        if let Err(e) = deliver(&sink, text, &item).await {
            warn!(
                device_id = %device.device_id,
                conn_id = %conn_id,
                cmd_id = %item.id,
                error = %e,
                "send failed, requeueing"
            );
            lock(&reassembly).cancel(&item.id);
            engine.requeue_front(item);
            break;
        }
        debug!(device_id = %device.device_id, cmd_id = %item.id, command = item.command.name(), "command sent");
    }
}

async fn deliver<K>(sink: &SharedSink<K>, text: String, item: &QueuedCommand) -> FrameResult<()>
where
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    let mut sink = sink.lock().await;
    send_text(&mut *sink, text).await?;
    if let Some(blob) = &item.blob {
        for chunk in blob.chunks(BLOB_FRAME_SIZE) {
            send_binary(&mut *sink, chunk.to_vec()).await?;
        }
    }
    Ok(())
}
