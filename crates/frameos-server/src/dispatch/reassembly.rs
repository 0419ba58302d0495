//! Per-connection reassembly of binary reply bodies.
//!
//! Devices stream a command's binary body as raw binary frames before the
//! matching `cmd/resp`. Frames carry no id. Devices answer in send order, so
//! binary-reply commands wait in a FIFO and frames always belong to the
//! oldest one still waiting. A `cmd/resp` takes its command out of the FIFO.

use std::collections::VecDeque;
use std::io::Read;

use flate2::read::GzDecoder;
use frameos_core::{CommandReply, FrameError, FrameResult};
use serde_json::Value;
use uuid::Uuid;

/// Largest reply body buffered for one command.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Where an inbound binary frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Stored,
    /// No binary-reply command is waiting on this connection.
    NoCommand,
    /// The owning command already timed out or overflowed.
    Discarded,
}

#[derive(Debug)]
struct Waiting {
    id: Uuid,
    data: Vec<u8>,
    overflowed: bool,
}

#[derive(Debug)]
pub struct ReassemblyTable {
    waiting: VecDeque<Waiting>,
    limit: usize,
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::with_limit(MAX_BODY_SIZE)
    }
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            limit,
        }
    }

    /// Queue `id` as the newest command whose reply may carry binary frames.
    pub fn expect(&mut self, id: Uuid) {
        self.waiting.push_back(Waiting {
            id,
            data: Vec::new(),
            overflowed: false,
        });
    }

    /// Append a frame to the oldest waiting command. A command for which
    /// `is_live` is false has timed out: it keeps its place so its late frames
    /// are not mistaken for the next command's, but the data is dropped.
    pub fn append(&mut self, frame: &[u8], is_live: impl Fn(&Uuid) -> bool) -> Appended {
        let limit = self.limit;
        let Some(front) = self.waiting.front_mut() else {
            return Appended::NoCommand;
        };
        if !is_live(&front.id) {
            front.data = Vec::new();
            return Appended::Discarded;
        }
        if front.overflowed {
            return Appended::Discarded;
        }
        if front.data.len() + frame.len() > limit {
            front.overflowed = true;
            front.data = Vec::new();
            return Appended::Discarded;
        }
        front.data.extend_from_slice(frame);
        Appended::Stored
    }

    /// Take `id`'s body on its `cmd/resp`. Timed-out commands queued ahead of
    /// it will never be answered now and are dropped too.
    pub fn take(&mut self, id: &Uuid, is_live: impl Fn(&Uuid) -> bool) -> FrameResult<Option<Vec<u8>>> {
        let Some(pos) = self.waiting.iter().position(|w| w.id == *id) else {
            return Ok(None);
        };
        let mut ahead: Vec<Waiting> = self.waiting.drain(..=pos).collect();
        let Some(entry) = ahead.pop() else {
            return Ok(None);
        };
        for w in ahead.into_iter().rev() {
            if is_live(&w.id) {
                self.waiting.push_front(w);
            }
        }
        if entry.overflowed {
            return Err(FrameError::Decode(format!(
                "reply body for {id} exceeds {} bytes",
                self.limit
            )));
        }
        Ok(Some(entry.data).filter(|buf| !buf.is_empty()))
    }

    /// Forget `id` without touching the commands around it (it was never sent).
    pub fn cancel(&mut self, id: &Uuid) {
        self.waiting.retain(|w| w.id != *id);
    }

    /// Drop every partial buffer. Returns how many there were.
    pub fn discard_all(&mut self) -> usize {
        let n = self.waiting.len();
        self.waiting.clear();
        n
    }
}

fn is_gzipped(result: &Value) -> bool {
    result.get("compressed").and_then(Value::as_str) == Some("gzip")
        || result.get("gzip").and_then(Value::as_bool) == Some(true)
}

/// Combine a `cmd/resp` result with its reassembled body, gunzipping when declared.
pub fn merge_body(result: Value, body: Option<Vec<u8>>) -> FrameResult<CommandReply> {
    let body = match body {
        Some(bytes) if is_gzipped(&result) => {
            let mut out = Vec::with_capacity(bytes.len() * 2);
            GzDecoder::new(bytes.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| FrameError::Decode(format!("gzip body: {e}")))?;
            Some(out)
        }
        other => other,
    };
    Ok(CommandReply { result, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn live(_: &Uuid) -> bool {
        true
    }

    #[test]
    fn reassembles_any_chunking() {
        let data = blob(10_000);
        for k in [1usize, 2, 100] {
            let mut table = ReassemblyTable::new();
            let id = Uuid::new_v4();
            table.expect(id);
            for chunk in data.chunks(data.len().div_ceil(k)) {
                assert_eq!(table.append(chunk, live), Appended::Stored);
            }
            assert_eq!(table.take(&id, live).unwrap().unwrap(), data, "k = {k}");
            assert_eq!(table.append(b"after", live), Appended::NoCommand);
        }
    }

    #[test]
    fn back_to_back_reads_keep_their_own_bodies() {
        let mut table = ReassemblyTable::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        table.expect(a);
        table.expect(b);

        table.append(b"AAAA", live);
        assert_eq!(table.take(&a, live).unwrap().as_deref(), Some(&b"AAAA"[..]));
        table.append(b"BB", live);
        table.append(b"BB", live);
        assert_eq!(table.take(&b, live).unwrap().as_deref(), Some(&b"BBBB"[..]));
    }

    #[test]
    fn timed_out_command_swallows_its_late_frames() {
        let mut table = ReassemblyTable::new();
        let (stale, next) = (Uuid::new_v4(), Uuid::new_v4());
        table.expect(stale);
        table.expect(next);
        let only_next = |id: &Uuid| *id == next;

        assert_eq!(table.append(b"late", only_next), Appended::Discarded);
        assert_eq!(table.take(&stale, only_next).unwrap(), None);
        assert_eq!(table.append(b"mine", only_next), Appended::Stored);
        assert_eq!(table.take(&next, only_next).unwrap().as_deref(), Some(&b"mine"[..]));
    }

    #[test]
    fn reply_skips_unanswered_timed_out_commands() {
        let mut table = ReassemblyTable::new();
        let (lost, next) = (Uuid::new_v4(), Uuid::new_v4());
        table.expect(lost);
        table.expect(next);
        let only_next = |id: &Uuid| *id == next;

        assert_eq!(table.take(&next, only_next).unwrap(), None);
        assert_eq!(table.discard_all(), 0);
    }

    #[test]
    fn oversized_body_is_an_error() {
        let mut table = ReassemblyTable::with_limit(8);
        let id = Uuid::new_v4();
        table.expect(id);
        assert_eq!(table.append(b"12345", live), Appended::Stored);
        assert_eq!(table.append(b"67890", live), Appended::Discarded);
        assert_eq!(table.append(b"x", live), Appended::Discarded);
        assert!(matches!(table.take(&id, live), Err(FrameError::Decode(_))));
    }

    #[test]
    fn frames_without_waiting_command_are_rejected() {
        let mut table = ReassemblyTable::new();
        assert_eq!(table.append(b"stray", live), Appended::NoCommand);
        let id = Uuid::new_v4();
        table.expect(id);
        assert_eq!(table.take(&id, live).unwrap(), None);
        assert_eq!(table.append(b"late", live), Appended::NoCommand);
    }

    #[test]
    fn cancel_and_discard() {
        let mut table = ReassemblyTable::new();
        let (unsent, other) = (Uuid::new_v4(), Uuid::new_v4());
        table.expect(other);
        table.expect(unsent);
        table.cancel(&unsent);
        table.append(b"partial", live);
        assert_eq!(table.discard_all(), 1);
        assert_eq!(table.append(b"x", live), Appended::NoCommand);
    }

    #[test]
    fn gzip_body_is_decoded() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello frame").unwrap();
        let gz = enc.finish().unwrap();

        let reply = merge_body(json!({"compressed": "gzip"}), Some(gz.clone())).unwrap();
        assert_eq!(reply.body.as_deref(), Some(&b"hello frame"[..]));

        let raw = merge_body(json!({}), Some(gz.clone())).unwrap();
        assert_eq!(raw.body, Some(gz));
    }

    #[test]
    fn corrupt_gzip_is_decode_error() {
        let err = merge_body(json!({"gzip": true}), Some(b"not gzip".to_vec()));
        assert!(matches!(err, Err(FrameError::Decode(_))));
    }
}
