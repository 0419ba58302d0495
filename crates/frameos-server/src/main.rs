//! frameos-server: FrameOS controller.
//!
//! Listens for device agents on `/ws/agent`, keeps presence in the shared
//! store and serves commands issued from any controller process.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use frameos_core::{FrameError, FrameResult};
use frameos_server::config::{CliOverrides, ServerConfig};
use frameos_server::devices::StaticDirectory;
use frameos_server::logsink::TracingLogSink;
use frameos_server::store::{MemoryStore, SharedStore};
use frameos_server::FrameServer;
use tracing::{error, info, warn};

/// frameos-server: FrameOS device controller
#[derive(Parser, Debug)]
#[command(name = "frameos-server", version, about = "FrameOS device controller")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.frameos/controller.toml")]
    config: String,

    /// Shared store for multi-process deployments (redis://...)
    #[arg(long)]
    redis_url: Option<String>,

    /// Maximum concurrent device sockets
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting frameos-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        cert: cli.cert,
        key: cli.key,
        redis_url: cli.redis_url,
        max_connections: cli.max_connections,
    };
    let config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let directory = match StaticDirectory::new(config.devices.clone()) {
        Ok(dir) => dir,
        Err(e) => {
            error!(error = %e, "invalid device list");
            std::process::exit(1);
        }
    };
    if config.devices.is_empty() {
        warn!("no devices configured, every hello will be rejected");
    }

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "failed to open shared store");
            std::process::exit(1);
        }
    };

    let server = FrameServer::new(config, Arc::new(directory), store, Arc::new(TracingLogSink));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("frameos-server stopped");
}

/// Redis when a URL is configured, otherwise an in-process store.
async fn open_store(config: &ServerConfig) -> FrameResult<Arc<dyn SharedStore>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(frameos_server::store::RedisStore::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(FrameError::Config(
            "redis_url is set but this build lacks the `redis` feature".into(),
        )),
        None => {
            info!("no redis_url configured, using in-process store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
