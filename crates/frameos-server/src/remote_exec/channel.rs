//! Live-channel transport.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use frameos_core::messages::{FileWriteArgs, PathArgs, RenameArgs};
use frameos_core::{Command, CommandReply, FrameError, FrameResult};
use tracing::{debug, warn};

use super::{check_exit, RemoteTransport};
use crate::bridge::BridgeClient;
use crate::connections::ConnectionRegistry;
use crate::devices::DeviceRecord;
use crate::dispatch::DispatchEngine;

/// Something that delivers one command to a device and awaits its reply.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send(
        &self,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> FrameResult<CommandReply>;
}

/// Straight into this process's dispatch engine.
pub struct LocalChannel {
    engine: Arc<DispatchEngine>,
}

impl LocalChannel {
    pub fn new(engine: Arc<DispatchEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn send(
        &self,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> FrameResult<CommandReply> {
        let (handle, _) = self.engine.enqueue(device_id, command, blob, timeout);
        handle.wait().await
    }
}

#[async_trait]
impl CommandChannel for BridgeClient {
    async fn send(
        &self,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> FrameResult<CommandReply> {
        self.submit(device_id, command, blob, timeout).await
    }
}

/// Local engine when this process holds the device's socket, bridge otherwise.
pub struct RoutedChannel {
    connections: Arc<ConnectionRegistry>,
    local: LocalChannel,
    bridge: BridgeClient,
}

impl RoutedChannel {
    pub fn new(connections: Arc<ConnectionRegistry>, local: LocalChannel, bridge: BridgeClient) -> Self {
        Self {
            connections,
            local,
            bridge,
        }
    }
}

#[async_trait]
impl CommandChannel for RoutedChannel {
    async fn send(
        &self,
        device_id: &str,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Duration,
    ) -> FrameResult<CommandReply> {
        if self.connections.has_local(device_id).await {
            self.local.send(device_id, command, blob, timeout).await
        } else {
            debug!(device_id = %device_id, "device connected elsewhere, using bridge");
            self.bridge.send(device_id, command, blob, timeout).await
        }
    }
}

fn gzip(data: &[u8]) -> FrameResult<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::default());
    enc.write_all(data)?;
    Ok(enc.finish()?)
}

/// Facade operations expressed as channel commands.
pub struct ChannelTransport {
    channel: Arc<dyn CommandChannel>,
    timeout: Duration,
    chunk_size: usize,
    chunk_retries: u32,
}

impl ChannelTransport {
    pub fn new(channel: Arc<dyn CommandChannel>, timeout: Duration, chunk_size: usize, chunk_retries: u32) -> Self {
        Self {
            channel,
            timeout,
            chunk_size: chunk_size.max(1),
            chunk_retries,
        }
    }

    pub async fn send(
        &self,
        device: &DeviceRecord,
        command: Command,
        blob: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> FrameResult<CommandReply> {
        self.channel
            .send(&device.device_id, command, blob, timeout.unwrap_or(self.timeout))
            .await
    }

    async fn send_chunk(&self, device: &DeviceRecord, path: &str, offset: usize, total: usize, chunk: &[u8]) -> FrameResult<()> {
        let zipped = gzip(chunk)?;
        let mut attempt = 0;
        loop {
            let command = Command::FileWrite(FileWriteArgs {
                path: path.to_string(),
                size: zipped.len() as u64,
                offset: Some(offset as u64),
                total: Some(total as u64),
            });
            match self.send(device, command, Some(zipped.clone()), None).await {
                Ok(_) => return Ok(()),
                Err(e @ FrameError::DeviceUnreachable { .. }) => return Err(e),
                Err(e) if attempt >= self.chunk_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    warn!(
                        device_id = %device.device_id,
                        path = %path,
                        offset,
                        attempt,
                        error = %e,
                        "chunk upload failed, retrying"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl RemoteTransport for ChannelTransport {
    fn kind(&self) -> &'static str {
        "agent"
    }

    async fn run_command(&self, device: &DeviceRecord, cmd: &str) -> FrameResult<CommandReply> {
        let reply = self.send(device, Command::shell(cmd), None, None).await?;
        check_exit(device, reply)
    }

    async fn run_commands(&self, device: &DeviceRecord, cmds: &[String]) -> FrameResult<Vec<CommandReply>> {
        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            replies.push(self.run_command(device, cmd).await?);
        }
        Ok(replies)
    }

    /// Chunked, per-chunk gzipped upload; only a failed chunk is resent.
    async fn upload_file(&self, device: &DeviceRecord, path: &str, data: &[u8]) -> FrameResult<()> {
        if data.is_empty() {
            return self.send_chunk(device, path, 0, 0, data).await;
        }
        for (i, chunk) in data.chunks(self.chunk_size).enumerate() {
            self.send_chunk(device, path, i * self.chunk_size, data.len(), chunk)
                .await?;
        }
        Ok(())
    }

    async fn read_file(&self, device: &DeviceRecord, path: &str) -> FrameResult<Vec<u8>> {
        let reply = self
            .send(device, Command::FileRead(PathArgs { path: path.to_string() }), None, None)
            .await?;
        Ok(reply.body.unwrap_or_default())
    }

    async fn delete_path(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        self.send(device, Command::FileDelete(PathArgs { path: path.to_string() }), None, None)
            .await
            .map(drop)
    }

    async fn rename_path(&self, device: &DeviceRecord, src: &str, dst: &str) -> FrameResult<()> {
        let args = RenameArgs {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        self.send(device, Command::FileRename(args), None, None)
            .await
            .map(drop)
    }

    async fn make_dir(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        self.send(device, Command::FileMkdir(PathArgs { path: path.to_string() }), None, None)
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::test_record;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;
    use std::sync::Mutex;

    const MIB: usize = 1024 * 1024;

    /// Records file_write offsets and fails the listed offsets once each.
    #[derive(Default)]
    struct FlakyChannel {
        fail_once: Mutex<Vec<u64>>,
        writes: Mutex<Vec<u64>>,
        received: Mutex<Vec<u8>>,
    }

    #[async_trait]
    impl CommandChannel for FlakyChannel {
        async fn send(&self, device_id: &str, command: Command, blob: Option<Vec<u8>>, _: Duration) -> FrameResult<CommandReply> {
            let Command::FileWrite(args) = command else {
                return Ok(CommandReply::json(json!({"exit": 0})));
            };
            let offset = args.offset.unwrap_or(0);
            self.writes.lock().unwrap().push(offset);
            let zipped = blob.unwrap_or_default();
            assert_eq!(zipped.len() as u64, args.size);
            {
                let mut fail = self.fail_once.lock().unwrap();
                if let Some(pos) = fail.iter().position(|o| *o == offset) {
                    fail.remove(pos);
                    return Err(FrameError::Timeout {
                        device_id: device_id.into(),
                        command: "file_write".into(),
                        secs: 1,
                    });
                }
            }
            let mut plain = Vec::new();
            GzDecoder::new(zipped.as_slice()).read_to_end(&mut plain).unwrap();
            self.received.lock().unwrap().extend_from_slice(&plain);
            Ok(CommandReply::json(json!({})))
        }
    }

    fn transport(channel: Arc<FlakyChannel>, retries: u32) -> ChannelTransport {
        ChannelTransport::new(channel, Duration::from_secs(5), 2 * MIB, retries)
    }

    #[tokio::test]
    async fn six_mib_upload_is_three_chunks() {
        let channel = Arc::new(FlakyChannel::default());
        let data: Vec<u8> = (0..6 * MIB).map(|i| (i % 253) as u8).collect();
        transport(channel.clone(), 3)
            .upload_file(&test_record("frame-1", "k1", "s1"), "/srv/frameos/app", &data)
            .await
            .unwrap();
        assert_eq!(*channel.writes.lock().unwrap(), [0, 2 * MIB as u64, 4 * MIB as u64]);
        assert_eq!(*channel.received.lock().unwrap(), data);
    }

    #[tokio::test]
    async fn failed_chunk_is_the_only_one_resent() {
        let channel = Arc::new(FlakyChannel::default());
        channel.fail_once.lock().unwrap().push(2 * MIB as u64);
        let data = vec![7u8; 6 * MIB];
        transport(channel.clone(), 3)
            .upload_file(&test_record("frame-1", "k1", "s1"), "/srv/a", &data)
            .await
            .unwrap();
        let m = MIB as u64;
        assert_eq!(*channel.writes.lock().unwrap(), [0, 2 * m, 2 * m, 4 * m]);
        assert_eq!(channel.received.lock().unwrap().len(), data.len());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let channel = Arc::new(FlakyChannel::default());
        channel.fail_once.lock().unwrap().extend([0, 0, 0]);
        let err = transport(channel.clone(), 2)
            .upload_file(&test_record("frame-1", "k1", "s1"), "/srv/a", b"tiny")
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout { .. }));
        assert_eq!(channel.writes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        struct Exit1;
        #[async_trait]
        impl CommandChannel for Exit1 {
            async fn send(&self, _: &str, _: Command, _: Option<Vec<u8>>, _: Duration) -> FrameResult<CommandReply> {
                Ok(CommandReply::json(json!({"exit": 1})))
            }
        }
        let t = ChannelTransport::new(Arc::new(Exit1), Duration::from_secs(1), MIB, 0);
        let cmds = vec!["false".to_string(), "never".to_string()];
        let err = t
            .run_commands(&test_record("frame-1", "k1", "s1"), &cmds)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Device { .. }));
    }
}
