use thiserror::Error;

/// Errors produced by the device channel.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {device_id}: {command} timed out after {secs}s")]
    Timeout {
        device_id: String,
        command: String,
        secs: u64,
    },

    #[error("device {device_id}: connection closed before {command} completed")]
    ConnectionClosed { device_id: String, command: String },

    #[error("device {device_id}: channel required but no live connection")]
    DeviceUnreachable { device_id: String },

    #[error("device {device_id}: {command} failed: {message}")]
    Device {
        device_id: String,
        command: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("completion already resolved")]
    AlreadyResolved,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type FrameResult<T> = Result<T, FrameError>;
