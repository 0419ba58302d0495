//! Per-device log sink.
//!
//! Streamed stdout/stderr lines and facade actions end up here. The default
//! sink writes them to `tracing`; the web UI's log store would plug in its own.

use frameos_core::StreamKind;
use tracing::info;

pub trait DeviceLogSink: Send + Sync {
    /// One line of command output.
    fn output(&self, device_id: &str, stream: StreamKind, line: &str);

    /// An action the controller took against the device (`> cmd`).
    fn action(&self, device_id: &str, line: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl DeviceLogSink for TracingLogSink {
    fn output(&self, device_id: &str, stream: StreamKind, line: &str) {
        info!(target: "frameos::device", device_id = %device_id, stream = stream.as_str(), "{line}");
    }

    fn action(&self, device_id: &str, line: &str) {
        info!(target: "frameos::device", device_id = %device_id, "> {line}");
    }
}

/// Forward every line of `data` to `sink`, skipping a trailing empty line.
pub fn forward_lines(sink: &dyn DeviceLogSink, device_id: &str, stream: StreamKind, data: &str) {
    for line in data.lines() {
        sink.output(device_id, stream, line);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records everything it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub lines: Mutex<Vec<(String, String)>>,
    }

    impl DeviceLogSink for RecordingSink {
        fn output(&self, device_id: &str, stream: StreamKind, line: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((device_id.to_string(), format!("{}: {line}", stream.as_str())));
        }

        fn action(&self, device_id: &str, line: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((device_id.to_string(), format!("> {line}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn splits_multi_line_data() {
        let sink = RecordingSink::default();
        forward_lines(&sink, "frame-1", StreamKind::Stdout, "a\nb\n");
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].1, "stdout: b");
    }
}
