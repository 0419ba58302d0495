//! Controller server: owns every registry and accepts device sockets.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use frameos_core::{FrameError, FrameResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::auth::HelloRateLimiter;
use crate::bridge::{BridgeClient, BridgeWorkers};
use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::devices::DeviceDirectory;
use crate::dispatch::DispatchEngine;
use crate::logsink::DeviceLogSink;
use crate::presence::PresenceRegistry;
use crate::remote_exec::{ChannelTransport, LocalChannel, RemoteExec, RoutedChannel, SshTransport};
use crate::session::serve_connection;
use crate::store::SharedStore;
use crate::transport::websocket;

/// State shared by every connection task.
pub struct ServerState {
    pub config: ServerConfig,
    pub directory: Arc<dyn DeviceDirectory>,
    pub engine: Arc<DispatchEngine>,
    pub presence: Arc<PresenceRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub bridge: Arc<BridgeWorkers>,
    pub log_sink: Arc<dyn DeviceLogSink>,
    pub rate_limits: Mutex<HelloRateLimiter>,
    /// Accepted sockets, authenticated or not.
    pub active_sockets: AtomicUsize,
}

/// The FrameOS controller instance.
pub struct FrameServer {
    state: Arc<ServerState>,
    remote: Arc<RemoteExec>,
}

impl FrameServer {
    pub fn new(
        config: ServerConfig,
        directory: Arc<dyn DeviceDirectory>,
        store: Arc<dyn SharedStore>,
        log_sink: Arc<dyn DeviceLogSink>,
    ) -> Self {
        let engine = DispatchEngine::new();
        let presence = Arc::new(PresenceRegistry::new(store.clone(), config.presence_ttl));
        let connections = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BridgeWorkers::new(store.clone(), engine.clone(), connections.clone()));

        let routed = RoutedChannel::new(
            connections.clone(),
            LocalChannel::new(engine.clone()),
            BridgeClient::new(store.clone()),
        );
        let channel = Arc::new(ChannelTransport::new(
            Arc::new(routed),
            config.command_timeout,
            config.chunk_size,
            config.chunk_retries,
        ));
        let remote = Arc::new(RemoteExec::new(
            presence.clone(),
            channel,
            Arc::new(SshTransport::new(log_sink.clone())),
            log_sink.clone(),
        ));

        let state = Arc::new(ServerState {
            config,
            directory,
            engine,
            presence,
            connections,
            bridge,
            log_sink,
            rate_limits: Mutex::new(HelloRateLimiter::default()),
            active_sockets: AtomicUsize::new(0),
        });
        Self { state, remote }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Facade for issuing commands to devices.
    pub fn remote(&self) -> &Arc<RemoteExec> {
        &self.remote
    }

    /// Bind the listener and start accepting. Returns the bound address and
    /// the accept task.
    pub async fn listen(&self) -> FrameResult<(SocketAddr, JoinHandle<()>)> {
        let config = &self.state.config;
        let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port)
            .parse()
            .map_err(|e| FrameError::Config(format!("invalid bind address: {e}")))?;

        let tls = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(websocket::load_tls_config(cert, key)?)),
            _ => None,
        };

        let (local_addr, mut conns) = websocket::start_listener(bind_addr, tls, websocket::UPGRADE_TIMEOUT).await?;

        // Periodic housekeeping for the hello limiter.
        let gc_state = self.state.clone();
        let gc = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                gc_state.rate_limits.lock().await.gc();
            }
        });

        let state = self.state.clone();
        let accept = tokio::spawn(async move {
            while let Some(conn) = conns.recv().await {
                tokio::spawn(serve_connection(state.clone(), conn));
            }
            gc.abort();
            info!("listener closed");
        });

        info!(
            addr = %local_addr,
            max_connections = self.state.config.max_connections,
            "frameos controller ready"
        );
        Ok((local_addr, accept))
    }

    /// Listen and serve until the listener stops.
    pub async fn run(&self) -> FrameResult<()> {
        let (_, accept) = self.listen().await?;
        accept
            .await
            .map_err(|e| FrameError::Other(format!("accept task failed: {e}")))
    }
}
