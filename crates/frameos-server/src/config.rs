//! Controller configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use frameos_core::{FrameError, FrameResult, NoncePolicy};
use serde::Deserialize;
use tracing::info;

use crate::devices::DeviceRecord;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: None,
            key: None,
            max_connections: default_max_connections(),
            hello_timeout: default_hello_timeout(),
            idle_timeout: default_idle_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// `[presence]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_presence_ttl")]
    pub ttl: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ttl: default_presence_ttl(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

/// `[store]` section. Without a redis URL the controller runs single-process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// `[transfer]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub nonce_policy: NoncePolicy,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8989
}
fn default_max_connections() -> usize {
    1000
}
fn default_hello_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    90
}
fn default_command_timeout() -> u64 {
    120
}
fn default_presence_ttl() -> u64 {
    60
}
fn default_refresh_interval() -> u64 {
    20
}
fn default_chunk_size() -> usize {
    2 * 1024 * 1024
}
fn default_chunk_retries() -> u32 {
    3
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub redis_url: Option<String>,
    pub max_connections: Option<usize>,
}

/// Resolved controller configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_connections: usize,
    pub hello_timeout: Duration,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
    pub presence_ttl: Duration,
    pub presence_refresh: Duration,
    pub redis_url: Option<String>,
    pub chunk_size: usize,
    pub chunk_retries: u32,
    pub nonce_policy: NoncePolicy,
    pub devices: Vec<DeviceRecord>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> FrameResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| FrameError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile, cli: CliOverrides) -> Self {
        let cert = cli.cert.or(file.server.cert);
        let key = cli.key.or(file.server.key);
        Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            hello_timeout: Duration::from_secs(file.server.hello_timeout),
            idle_timeout: Duration::from_secs(file.server.idle_timeout),
            command_timeout: Duration::from_secs(file.server.command_timeout),
            presence_ttl: Duration::from_secs(file.presence.ttl),
            presence_refresh: Duration::from_secs(file.presence.refresh_interval),
            redis_url: cli.redis_url.or(file.store.redis_url),
            chunk_size: file.transfer.chunk_size,
            chunk_retries: file.transfer.chunk_retries,
            nonce_policy: file.auth.nonce_policy,
            devices: file.devices,
        }
    }

    fn validate(&self) -> FrameResult<()> {
        if self.presence_refresh.is_zero() || self.presence_refresh >= self.presence_ttl {
            return Err(FrameError::Config(format!(
                "presence refresh_interval ({}s) must be non-zero and below ttl ({}s)",
                self.presence_refresh.as_secs(),
                self.presence_ttl.as_secs()
            )));
        }
        if self.chunk_size == 0 {
            return Err(FrameError::Config("transfer chunk_size must be non-zero".into()));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(FrameError::Config("cert and key must be configured together".into()));
        }
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, CliOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8989);
        assert_eq!(cfg.presence_ttl, Duration::from_secs(60));
        assert_eq!(cfg.chunk_size, 2 * 1024 * 1024);
        assert_eq!(cfg.nonce_policy, NoncePolicy::Advisory);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000
idle_timeout = 45

[auth]
nonce_policy = "strict"

[[devices]]
device_id = "frame-1"
api_key = "k1"
shared_secret = "s1"
host = "10.0.0.5"

[devices.agent]
enabled = true
run_commands = true
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(
            Some(file.path()),
            CliOverrides {
                port: Some(9100),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(45));
        assert_eq!(cfg.nonce_policy, NoncePolicy::Strict);
        assert_eq!(cfg.devices.len(), 1);
        assert!(cfg.devices[0].agent.prefers_channel());
        assert_eq!(cfg.devices[0].ssh_port, 22);
    }

    #[test]
    fn refresh_must_be_below_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[presence]\nttl = 10\nrefresh_interval = 10").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(file.path()), CliOverrides::default()),
            Err(FrameError::Config(_))
        ));
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x.pem"), home.join("x.pem"));
        }
        assert_eq!(expand_tilde_str("/etc/x.pem"), PathBuf::from("/etc/x.pem"));
    }
}
