//! Device channel message types.
//!
//! Handshake messages are plain JSON tagged by `action`. After the handshake
//! every message is a signed [`Envelope`](crate::envelope::Envelope) whose
//! payload is tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FrameError, FrameResult};

// ── Handshake ──────────────────────────────────────────────────────────

/// Unsigned messages exchanged before the device is authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ControlMessage {
    /// Device identifies itself with its server-issued API key.
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "deviceApiKey", alias = "serverApiKey", default)]
        device_api_key: String,
    },
    /// Random challenge the device must sign.
    #[serde(rename = "challenge")]
    Challenge { c: String },
    /// Device proof: `HMAC(secret, api_key || challenge)`.
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(default)]
        mac: String,
    },
    #[serde(rename = "handshake/ok")]
    HandshakeOk,
}

impl ControlMessage {
    pub fn to_text(&self) -> FrameResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(raw: &str) -> FrameResult<Self> {
        serde_json::from_str(raw).map_err(|e| FrameError::InvalidMessage(e.to_string()))
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Challenge { .. } => "challenge",
            ControlMessage::Handshake { .. } => "handshake",
            ControlMessage::HandshakeOk => "handshake/ok",
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellArgs {
    pub cmd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

/// Arguments for `file_write`. The body travels as binary frames after the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWriteArgs {
    pub path: String,
    /// Size of the (compressed) blob that follows.
    pub size: u64,
    /// Byte offset of this chunk in the uncompressed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Uncompressed size of the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameArgs {
    pub src: String,
    pub dst: String,
}

/// An HTTP request the device performs against its own local server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpArgs {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Every command the controller can send to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Command {
    Shell(ShellArgs),
    FileRead(PathArgs),
    FileWrite(FileWriteArgs),
    FileDelete(PathArgs),
    FileMkdir(PathArgs),
    FileRename(RenameArgs),
    AssetsList(PathArgs),
    Http(HttpArgs),
}

impl Command {
    pub fn shell(cmd: impl Into<String>) -> Self {
        Command::Shell(ShellArgs { cmd: cmd.into() })
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Shell(_) => "shell",
            Command::FileRead(_) => "file_read",
            Command::FileWrite(_) => "file_write",
            Command::FileDelete(_) => "file_delete",
            Command::FileMkdir(_) => "file_mkdir",
            Command::FileRename(_) => "file_rename",
            Command::AssetsList(_) => "assets_list",
            Command::Http(_) => "http",
        }
    }

    /// Whether the reply may be followed by binary frames.
    pub fn expects_binary_reply(&self) -> bool {
        match self {
            Command::FileRead(_) | Command::Http(_) => true,
            Command::Shell(_)
            | Command::FileWrite(_)
            | Command::FileDelete(_)
            | Command::FileMkdir(_)
            | Command::FileRename(_)
            | Command::AssetsList(_) => false,
        }
    }

    /// Build the envelope payload `{type:"cmd", name, args, id}`.
    pub fn to_payload(&self, id: &Uuid) -> FrameResult<Value> {
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| FrameError::Other("command did not serialize to an object".into()))?;
        obj.insert("type".into(), Value::String("cmd".into()));
        obj.insert("id".into(), Value::String(id.to_string()));
        Ok(value)
    }
}

// ── Device replies ─────────────────────────────────────────────────────

/// Which output stream a `cmd/stream` line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Verified payloads a device sends after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceMessage {
    #[serde(rename = "cmd/resp")]
    CmdResp {
        id: String,
        ok: bool,
        #[serde(default)]
        result: Value,
    },
    #[serde(rename = "cmd/stream")]
    CmdStream {
        #[serde(default)]
        id: Option<String>,
        stream: StreamKind,
        #[serde(default)]
        data: String,
    },
    #[serde(other)]
    Unknown,
}

impl DeviceMessage {
    pub fn from_payload(payload: Value) -> FrameResult<Self> {
        serde_json::from_value(payload).map_err(|e| FrameError::InvalidMessage(e.to_string()))
    }
}

/// Final outcome of a command: the device's JSON result plus any binary body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandReply {
    pub result: Value,
    pub body: Option<Vec<u8>>,
}

impl CommandReply {
    pub fn json(result: Value) -> Self {
        Self { result, body: None }
    }

    /// Exit code reported by a `shell` command, if any.
    pub fn exit_code(&self) -> Option<i64> {
        self.result.get("exit").and_then(Value::as_i64)
    }
}

/// Extract the device's error text from a failed `cmd/resp` result.
pub fn error_text(result: &Value) -> String {
    match result {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string()),
        Value::Null => "device reported failure".to_string(),
        other => other.to_string(),
    }
}
