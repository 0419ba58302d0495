//! Remote execution facade.
//!
//! Callers ask to run a command or move files on a device without caring how
//! the device is reached. Each call picks a transport once: devices whose
//! agent is set to run commands must be reached over the live channel (and
//! fail fast with `DeviceUnreachable` when no connection exists anywhere);
//! every other device goes through the SSH fallback.

pub mod channel;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frameos_core::{Command, CommandReply, FrameError, FrameResult, StreamKind};
use tracing::debug;

use crate::devices::DeviceRecord;
use crate::logsink::DeviceLogSink;
use crate::presence::PresenceRegistry;

pub use channel::{ChannelTransport, CommandChannel, LocalChannel, RoutedChannel};
pub use ssh::SshTransport;

/// One way of reaching a device.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn run_command(&self, device: &DeviceRecord, cmd: &str) -> FrameResult<CommandReply>;

    /// Run `cmds` in order, stopping at the first failure.
    async fn run_commands(&self, device: &DeviceRecord, cmds: &[String]) -> FrameResult<Vec<CommandReply>>;

    async fn upload_file(&self, device: &DeviceRecord, path: &str, data: &[u8]) -> FrameResult<()>;

    async fn read_file(&self, device: &DeviceRecord, path: &str) -> FrameResult<Vec<u8>>;

    async fn delete_path(&self, device: &DeviceRecord, path: &str) -> FrameResult<()>;

    async fn rename_path(&self, device: &DeviceRecord, src: &str, dst: &str) -> FrameResult<()>;

    async fn make_dir(&self, device: &DeviceRecord, path: &str) -> FrameResult<()>;
}

/// Treat a non-zero shell exit as a device failure.
pub(crate) fn check_exit(device: &DeviceRecord, reply: CommandReply) -> FrameResult<CommandReply> {
    match reply.exit_code() {
        Some(code) if code != 0 => Err(FrameError::Device {
            device_id: device.device_id.clone(),
            command: "shell".into(),
            message: format!("exit status {code}"),
        }),
        _ => Ok(reply),
    }
}

pub struct RemoteExec {
    presence: Arc<PresenceRegistry>,
    channel: Arc<ChannelTransport>,
    fallback: Arc<dyn RemoteTransport>,
    log: Arc<dyn DeviceLogSink>,
}

impl RemoteExec {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        channel: Arc<ChannelTransport>,
        fallback: Arc<dyn RemoteTransport>,
        log: Arc<dyn DeviceLogSink>,
    ) -> Self {
        Self {
            presence,
            channel,
            fallback,
            log,
        }
    }

    async fn require_channel(&self, device: &DeviceRecord) -> FrameResult<()> {
        if self.presence.count_alive(&device.device_id).await? == 0 {
            return Err(FrameError::DeviceUnreachable {
                device_id: device.device_id.clone(),
            });
        }
        Ok(())
    }

    /// Pick the transport for one facade call.
    async fn select(&self, device: &DeviceRecord) -> FrameResult<Arc<dyn RemoteTransport>> {
        let transport: Arc<dyn RemoteTransport> = if device.agent.prefers_channel() {
            self.require_channel(device).await?;
            self.channel.clone()
        } else {
            self.fallback.clone()
        };
        debug!(device_id = %device.device_id, transport = transport.kind(), "transport selected");
        Ok(transport)
    }

    fn report<T>(&self, device: &DeviceRecord, what: &str, result: FrameResult<T>) -> FrameResult<T> {
        if let Err(e) = &result {
            self.log
                .output(&device.device_id, StreamKind::Stderr, &format!("{what} error ({e})"));
        }
        result
    }

    pub async fn run_command(&self, device: &DeviceRecord, cmd: &str) -> FrameResult<CommandReply> {
        let transport = self.select(device).await?;
        self.log.action(&device.device_id, cmd);
        let result = transport.run_command(device, cmd).await;
        self.report(device, "exec", result)
    }

    pub async fn run_commands(&self, device: &DeviceRecord, cmds: &[String]) -> FrameResult<Vec<CommandReply>> {
        let transport = self.select(device).await?;
        for cmd in cmds {
            self.log.action(&device.device_id, cmd);
        }
        let result = transport.run_commands(device, cmds).await;
        self.report(device, "exec", result)
    }

    pub async fn upload_file(&self, device: &DeviceRecord, path: &str, data: &[u8]) -> FrameResult<()> {
        let transport = self.select(device).await?;
        self.log.action(
            &device.device_id,
            &format!("write {path} ({} bytes, {})", data.len(), transport.kind()),
        );
        let result = transport.upload_file(device, path, data).await;
        self.report(device, "file_write", result)
    }

    pub async fn read_file(&self, device: &DeviceRecord, path: &str) -> FrameResult<Vec<u8>> {
        let transport = self.select(device).await?;
        self.log.action(&device.device_id, &format!("read {path} ({})", transport.kind()));
        let result = transport.read_file(device, path).await;
        self.report(device, "file_read", result)
    }

    pub async fn delete_path(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        let transport = self.select(device).await?;
        self.log.action(&device.device_id, &format!("rm -rf {path} ({})", transport.kind()));
        let result = transport.delete_path(device, path).await;
        self.report(device, "delete", result)
    }

    pub async fn rename_path(&self, device: &DeviceRecord, src: &str, dst: &str) -> FrameResult<()> {
        let transport = self.select(device).await?;
        self.log.action(&device.device_id, &format!("mv {src} {dst} ({})", transport.kind()));
        let result = transport.rename_path(device, src, dst).await;
        self.report(device, "rename", result)
    }

    pub async fn make_dir(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        let transport = self.select(device).await?;
        self.log.action(&device.device_id, &format!("mkdir -p {path} ({})", transport.kind()));
        let result = transport.make_dir(device, path).await;
        self.report(device, "mkdir", result)
    }

    /// Send any command kind over the channel; there is no fallback for these.
    pub async fn send_command(
        &self,
        device: &DeviceRecord,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> FrameResult<CommandReply> {
        self.require_channel(device).await?;
        self.log.action(&device.device_id, &format!("{} (agent)", command.name()));
        let result = self.channel.send(device, command, blob, timeout).await;
        self.report(device, "agent", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::test_record;
    use crate::logsink::testing::RecordingSink;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Records which operations reached it.
    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        fn kind(&self) -> &'static str {
            "fake"
        }
        async fn run_command(&self, _: &DeviceRecord, cmd: &str) -> FrameResult<CommandReply> {
            self.calls.lock().unwrap().push(format!("run {cmd}"));
            Ok(CommandReply::json(json!({"exit": 0})))
        }
        async fn run_commands(&self, d: &DeviceRecord, cmds: &[String]) -> FrameResult<Vec<CommandReply>> {
            let mut out = Vec::new();
            for cmd in cmds {
                out.push(self.run_command(d, cmd).await?);
            }
            Ok(out)
        }
        async fn upload_file(&self, _: &DeviceRecord, path: &str, _: &[u8]) -> FrameResult<()> {
            self.calls.lock().unwrap().push(format!("upload {path}"));
            Ok(())
        }
        async fn read_file(&self, _: &DeviceRecord, _: &str) -> FrameResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn delete_path(&self, _: &DeviceRecord, path: &str) -> FrameResult<()> {
            self.calls.lock().unwrap().push(format!("delete {path}"));
            Ok(())
        }
        async fn rename_path(&self, _: &DeviceRecord, _: &str, _: &str) -> FrameResult<()> {
            Ok(())
        }
        async fn make_dir(&self, _: &DeviceRecord, _: &str) -> FrameResult<()> {
            Ok(())
        }
    }

    /// Channel that answers every shell command with `exit: 0`.
    struct EchoChannel;

    #[async_trait]
    impl CommandChannel for EchoChannel {
        async fn send(&self, _: &str, _: Command, _: Option<Vec<u8>>, _: Duration) -> FrameResult<CommandReply> {
            Ok(CommandReply::json(json!({"exit": 0})))
        }
    }

    fn facade() -> (RemoteExec, Arc<PresenceRegistry>, Arc<FakeTransport>, Arc<RecordingSink>) {
        let presence = Arc::new(PresenceRegistry::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
        ));
        let fallback = Arc::new(FakeTransport::default());
        let sink = Arc::new(RecordingSink::default());
        let channel = Arc::new(ChannelTransport::new(
            Arc::new(EchoChannel),
            Duration::from_secs(5),
            1024,
            3,
        ));
        let exec = RemoteExec::new(presence.clone(), channel, fallback.clone(), sink.clone());
        (exec, presence, fallback, sink)
    }

    #[tokio::test]
    async fn channel_device_offline_is_unreachable() {
        let (exec, _, fallback, _) = facade();
        let device = test_record("frame-1", "k1", "s1");
        let err = exec.run_command(&device, "uptime").await.unwrap_err();
        assert!(matches!(err, FrameError::DeviceUnreachable { .. }));
        assert!(fallback.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_device_online_uses_channel() {
        let (exec, presence, fallback, sink) = facade();
        let device = test_record("frame-1", "k1", "s1");
        presence.mark_alive("frame-1", Uuid::new_v4()).await.unwrap();
        let reply = exec.run_command(&device, "echo hi").await.unwrap();
        assert_eq!(reply.exit_code(), Some(0));
        assert!(fallback.calls.lock().unwrap().is_empty());
        assert!(sink
            .lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, l)| l == "> echo hi"));
    }

    #[tokio::test]
    async fn other_devices_use_fallback() {
        let (exec, _, fallback, _) = facade();
        let mut device = test_record("frame-2", "k2", "s2");
        device.agent.run_commands = false;
        exec.delete_path(&device, "/tmp/x").await.unwrap();
        exec.upload_file(&device, "/tmp/y", b"data").await.unwrap();
        assert_eq!(*fallback.calls.lock().unwrap(), ["delete /tmp/x", "upload /tmp/y"]);
    }

    #[tokio::test]
    async fn send_command_needs_a_connection() {
        let (exec, _, _, _) = facade();
        let mut device = test_record("frame-3", "k3", "s3");
        device.agent.enabled = false;
        let err = exec
            .send_command(&device, Command::shell("true"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::DeviceUnreachable { .. }));
    }
}
