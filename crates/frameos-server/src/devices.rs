//! Device directory: the persistence seam the channel needs.
//!
//! The controller only needs to find a device by its API key during the
//! handshake, fetch it by id for dispatch, and rotate its key. The file-backed
//! [`StaticDirectory`] is loaded from the `[[devices]]` tables of the config.

use std::collections::HashMap;

use async_trait::async_trait;
use frameos_core::identity::generate_api_key;
use frameos_core::{fingerprint, FrameError, FrameResult};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

/// Agent settings controlling transport selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub run_commands: bool,
}

impl AgentSettings {
    /// Commands for this device must go over the persistent channel.
    pub fn prefers_channel(&self) -> bool {
        self.enabled && self.run_commands
    }
}

/// Everything the controller knows about one device.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub api_key: String,
    pub shared_secret: String,
    #[serde(default)]
    pub key_version: u64,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub agent: AgentSettings,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "frame".to_string()
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("device_id", &self.device_id)
            .field("api_key", &fingerprint(&self.api_key))
            .field("key_version", &self.key_version)
            .field("host", &self.host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

/// Lookup and rotation of device credentials.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Find the device that owns `api_key`.
    async fn by_api_key(&self, api_key: &str) -> FrameResult<Option<DeviceRecord>>;

    /// Fetch a device by id.
    async fn get(&self, device_id: &str) -> FrameResult<Option<DeviceRecord>>;

    /// Issue a new API key for `device_id` and bump its key version.
    async fn rotate_key(&self, device_id: &str) -> FrameResult<DeviceRecord>;
}

/// In-memory directory seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl StaticDirectory {
    pub fn new(records: Vec<DeviceRecord>) -> FrameResult<Self> {
        let mut devices = HashMap::with_capacity(records.len());
        for record in records {
            if record.api_key.is_empty() || record.shared_secret.is_empty() {
                return Err(FrameError::Config(format!(
                    "device {} needs both api_key and shared_secret",
                    record.device_id
                )));
            }
            if devices.values().any(|d: &DeviceRecord| d.api_key == record.api_key) {
                return Err(FrameError::Config(format!(
                    "device {} reuses another device's api_key",
                    record.device_id
                )));
            }
            if devices.insert(record.device_id.clone(), record).is_some() {
                return Err(FrameError::Config("duplicate device_id in config".into()));
            }
        }
        Ok(Self {
            devices: RwLock::new(devices),
        })
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn by_api_key(&self, api_key: &str) -> FrameResult<Option<DeviceRecord>> {
        if api_key.is_empty() {
            return Ok(None);
        }
        let devices = self.devices.read().await;
        Ok(devices.values().find(|d| d.api_key == api_key).cloned())
    }

    async fn get(&self, device_id: &str) -> FrameResult<Option<DeviceRecord>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn rotate_key(&self, device_id: &str) -> FrameResult<DeviceRecord> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| FrameError::UnknownDevice(device_id.to_string()))?;
        record.api_key = generate_api_key()?;
        record.key_version += 1;
        info!(
            device_id = %device_id,
            key_version = record.key_version,
            key = %fingerprint(&record.api_key),
            "rotated device api key"
        );
        Ok(record.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_record(device_id: &str, api_key: &str, secret: &str) -> DeviceRecord {
    DeviceRecord {
        device_id: device_id.into(),
        api_key: api_key.into(),
        shared_secret: secret.into(),
        key_version: 0,
        host: "127.0.0.1".into(),
        ssh_port: 22,
        ssh_user: "frame".into(),
        ssh_key_path: None,
        agent: AgentSettings {
            enabled: true,
            run_commands: true,
        },
    }
}
