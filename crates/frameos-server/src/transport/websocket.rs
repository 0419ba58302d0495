//! WebSocket listener for device agents, using tokio-tungstenite.
//!
//! Accepts TCP (optionally wrapped in TLS), performs the WebSocket upgrade on
//! `/ws/agent` only, and hands accepted sockets to the server over a channel.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use frameos_core::{FrameError, FrameResult};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// The only path devices may upgrade on.
pub const AGENT_PATH: &str = "/ws/agent";

/// Largest single WebSocket message accepted from a device.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Time allowed for the TLS handshake plus the WebSocket upgrade.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain TCP or TLS, so one socket type flows through the rest of the server.
pub enum AgentStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AgentStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AgentStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AgentStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub type AgentSocket = WebSocketStream<AgentStream>;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: AgentSocket,
    pub remote_addr: SocketAddr,
}

/// Load a PEM certificate chain and private key into a rustls server config.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> FrameResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| FrameError::Config(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| FrameError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FrameError::Config(format!("bad certificate PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| FrameError::Config(format!("bad key PEM: {e}")))?
        .ok_or_else(|| FrameError::Config("no private key found in PEM".into()))?;

    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| FrameError::Config(format!("tls protocol setup: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| FrameError::Config(format!("tls certificate: {e}")))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(tls_config)
}

/// Reject upgrades on any path other than [`AGENT_PATH`].
fn check_path(req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() == AGENT_PATH {
        Ok(resp)
    } else {
        let mut err = ErrorResponse::new(Some("not found".to_string()));
        *err.status_mut() = StatusCode::NOT_FOUND;
        Err(err)
    }
}

type UpgradeError = Box<dyn std::error::Error + Send + Sync>;

async fn upgrade(stream: TcpStream, tls: Option<TlsAcceptor>, limit: Duration) -> Result<AgentSocket, UpgradeError> {
    tokio::time::timeout(limit, upgrade_inner(stream, tls))
        .await
        .map_err(|_| UpgradeError::from(format!("upgrade not finished within {limit:?}")))?
}

async fn upgrade_inner(stream: TcpStream, tls: Option<TlsAcceptor>) -> Result<AgentSocket, UpgradeError> {
    let stream = match tls {
        Some(acceptor) => AgentStream::Tls(Box::new(acceptor.accept(stream).await?)),
        None => AgentStream::Plain(stream),
    };
    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };
    Ok(tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(config)).await?)
}

/// Bind `bind_addr` and start accepting device sockets.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    upgrade_timeout: Duration,
) -> FrameResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| FrameError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;
    let acceptor = tls_config.map(TlsAcceptor::from);

    info!(addr = %local_addr, tls = acceptor.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, acceptor, upgrade_timeout).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                debug!(remote = %addr, error = %e, "WebSocket upgrade failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// One inbound frame, with control frames filtered out.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Closed,
}

/// Receive the next data frame. Pings are answered by tungstenite itself.
pub async fn recv_frame<S>(stream: &mut S) -> FrameResult<Inbound>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text)),
            Some(Ok(Message::Binary(data))) => return Ok(Inbound::Binary(data)),
            Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                return Ok(Inbound::Closed)
            }
            Some(Err(e)) => return Err(FrameError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}

pub async fn send_text<S>(sink: &mut S, text: String) -> FrameResult<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(text))
        .await
        .map_err(|e| FrameError::Transport(format!("WS send failed: {e}")))
}

pub async fn send_binary<S>(sink: &mut S, data: Vec<u8>) -> FrameResult<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Binary(data))
        .await
        .map_err(|e| FrameError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame; errors are ignored since the peer may already be gone.
pub async fn close_with<S>(sink: &mut S, code: CloseCode, reason: &'static str)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn silent_socket_is_dropped_after_upgrade_timeout() {
        let (addr, _conns) = start_listener("127.0.0.1:0".parse().unwrap(), None, Duration::from_millis(100))
            .await
            .unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
            .await
            .expect("server never dropped the silent socket");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn agent_path_upgrades() {
        let (addr, mut conns) = start_listener("127.0.0.1:0".parse().unwrap(), None, UPGRADE_TIMEOUT)
            .await
            .unwrap();
        let client = tokio::spawn(tokio_tungstenite::connect_async(format!("ws://{addr}{AGENT_PATH}")));
        let conn = conns.recv().await.unwrap();
        assert_eq!(conn.remote_addr.ip(), addr.ip());
        assert!(client.await.unwrap().is_ok());
    }
}
