//! Fallback transport over the system `ssh` client.
//!
//! Every operation spawns `ssh` in batch mode, so a call opens, authenticates,
//! runs and closes on its own. A batch from `run_commands` shares one
//! multiplexed master connection that is torn down when the batch ends.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frameos_core::{CommandReply, FrameError, FrameResult, StreamKind};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as Process;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RemoteTransport;
use crate::devices::DeviceRecord;
use crate::logsink::{forward_lines, DeviceLogSink};

fn quote(s: &str) -> String {
    shell_escape::escape(Cow::Borrowed(s)).into_owned()
}

pub struct SshTransport {
    log: Arc<dyn DeviceLogSink>,
    program: String,
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(log: Arc<dyn DeviceLogSink>) -> Self {
        Self {
            log,
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir(),
        }
    }

    /// Options shared by every invocation against `device`.
    fn base_args(&self, device: &DeviceRecord, control: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            device.ssh_port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];
        if let Some(key) = &device.ssh_key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        if let Some(path) = control {
            args.push("-o".to_string());
            args.push("ControlMaster=auto".to_string());
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", path.display()));
            args.push("-o".to_string());
            args.push("ControlPersist=60".to_string());
        }
        args.push(format!("{}@{}", device.ssh_user, device.host));
        args
    }

    async fn exec(
        &self,
        device: &DeviceRecord,
        control: Option<&Path>,
        remote_cmd: &str,
        stdin: Option<Vec<u8>>,
    ) -> FrameResult<Output> {
        if device.host.is_empty() {
            return Err(FrameError::Transport(format!(
                "device {} has no ssh host configured",
                device.device_id
            )));
        }
        debug!(device_id = %device.device_id, cmd = %remote_cmd, "ssh exec");
        let mut child = Process::new(&self.program)
            .args(self.base_args(device, control))
            .arg("--")
            .arg(remote_cmd)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FrameError::Transport(format!("failed to spawn {}: {e}", self.program)))?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(tokio::spawn(async move {
                pipe.write_all(&data).await?;
                pipe.shutdown().await
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FrameError::Transport(format!("ssh to {} failed: {e}", device.host)))?;
        // Exit status and stderr take precedence over a broken stdin pipe.
        let stdin_error = match writer {
            Some(writer) => match writer.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("writer task: {e}")),
            },
            None => None,
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut message = format!(
                "'{remote_cmd}' on {} failed with code {code}: {}",
                device.device_id,
                stderr.trim()
            );
            if let Some(e) = stdin_error {
                message.push_str(&format!(" (stdin: {e})"));
            }
            return Err(FrameError::Transport(message));
        }
        if let Some(e) = stdin_error {
            return Err(FrameError::Transport(format!("ssh stdin to {}: {e}", device.device_id)));
        }
        Ok(output)
    }

    async fn run_logged(&self, device: &DeviceRecord, control: Option<&Path>, cmd: &str) -> FrameResult<CommandReply> {
        let output = self.exec(device, control, cmd, None).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        forward_lines(&*self.log, &device.device_id, StreamKind::Stdout, &stdout);
        forward_lines(&*self.log, &device.device_id, StreamKind::Stderr, &stderr);
        Ok(CommandReply::json(json!({
            "exit": output.status.code().unwrap_or(0),
            "stdout": stdout,
            "stderr": stderr,
        })))
    }

    async fn close_master(&self, device: &DeviceRecord, control: &Path) {
        let status = Process::new(&self.program)
            .arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg(format!("{}@{}", device.ssh_user, device.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            warn!(device_id = %device.device_id, error = %e, "failed to close ssh master");
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn run_command(&self, device: &DeviceRecord, cmd: &str) -> FrameResult<CommandReply> {
        self.run_logged(device, None, cmd).await
    }

    async fn run_commands(&self, device: &DeviceRecord, cmds: &[String]) -> FrameResult<Vec<CommandReply>> {
        let simple = Uuid::new_v4().simple().to_string();
        let control = self.control_dir.join(format!("fos-{}", &simple[..12]));
        let mut replies = Vec::with_capacity(cmds.len());
        let mut result = Ok(());
        for cmd in cmds {
            match self.run_logged(device, Some(&control), cmd).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if !cmds.is_empty() {
            self.close_master(device, &control).await;
        }
        result.map(|()| replies)
    }

    async fn upload_file(&self, device: &DeviceRecord, path: &str, data: &[u8]) -> FrameResult<()> {
        let cmd = format!("cat > {}", quote(path));
        self.exec(device, None, &cmd, Some(data.to_vec())).await.map(drop)
    }

    async fn read_file(&self, device: &DeviceRecord, path: &str) -> FrameResult<Vec<u8>> {
        let cmd = format!("cat {}", quote(path));
        Ok(self.exec(device, None, &cmd, None).await?.stdout)
    }

    async fn delete_path(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        self.run_logged(device, None, &format!("rm -rf {}", quote(path)))
            .await
            .map(drop)
    }

    async fn rename_path(&self, device: &DeviceRecord, src: &str, dst: &str) -> FrameResult<()> {
        self.run_logged(device, None, &format!("mv {} {}", quote(src), quote(dst)))
            .await
            .map(drop)
    }

    async fn make_dir(&self, device: &DeviceRecord, path: &str) -> FrameResult<()> {
        self.run_logged(device, None, &format!("mkdir -p {}", quote(path)))
            .await
            .map(drop)
    }
}
