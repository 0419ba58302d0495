//! Signed message envelope for the steady-state device channel.
//!
//! Wire format: `{"nonce": <unix secs>, "payload": {...}, "mac": "<hex>"}` with
//! `mac = HMAC-SHA256(secret, api_key || nonce || canonical_json(payload))`.
//! Both ends must produce byte-identical canonical JSON, so the encoder here
//! does not rely on serde_json's map ordering or string escaping.

use std::fmt::Write as _;

use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FrameError, FrameResult};

/// Hex length of an HMAC-SHA256 tag.
const MAC_HEX_LEN: usize = 64;

/// Maximum clock distance accepted under [`NoncePolicy::Strict`].
pub const MAX_NONCE_SKEW_SECS: i64 = 300;

/// A signed steady-state message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: i64,
    pub payload: Value,
    pub mac: String,
}

impl Envelope {
    /// Serialize for the wire.
    pub fn to_text(&self) -> FrameResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Deterministic JSON: sorted keys, no whitespace, non-ASCII escaped as `\uXXXX`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7f => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn signing_input(api_key: &str, nonce: i64, payload: &Value) -> String {
    format!("{api_key}{nonce}{}", canonical_json(payload))
}

/// Lowercase hex HMAC-SHA256 of `data` under `secret`.
pub fn hmac_hex(secret: &str, data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, data).as_ref())
}

/// Constant-time check of a hex MAC. Only lowercase hex of the exact length is accepted.
fn verify_hex(secret: &str, data: &[u8], mac: &str) -> FrameResult<()> {
    if mac.len() != MAC_HEX_LEN || !mac.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(FrameError::Auth("malformed mac".into()));
    }
    let tag = hex::decode(mac).map_err(|_| FrameError::Auth("malformed mac".into()))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, data, &tag).map_err(|_| FrameError::Auth("mac mismatch".into()))
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sign `payload` with the current time as nonce.
pub fn sign(payload: Value, api_key: &str, secret: &str) -> Envelope {
    sign_with_nonce(payload, unix_now(), api_key, secret)
}

/// Sign `payload` with an explicit nonce.
pub fn sign_with_nonce(payload: Value, nonce: i64, api_key: &str, secret: &str) -> Envelope {
    let mac = hmac_hex(secret, signing_input(api_key, nonce, &payload).as_bytes());
    Envelope {
        nonce,
        payload,
        mac,
    }
}

/// Verify an envelope and return its payload.
///
/// Fails closed: a non-object payload or any MAC problem is an auth error.
pub fn verify(envelope: Envelope, api_key: &str, secret: &str) -> FrameResult<Value> {
    if !envelope.payload.is_object() {
        return Err(FrameError::Auth("envelope payload is not an object".into()));
    }
    let data = signing_input(api_key, envelope.nonce, &envelope.payload);
    verify_hex(secret, data.as_bytes(), &envelope.mac)?;
    Ok(envelope.payload)
}

/// Parse a raw text frame as an envelope and verify it.
///
/// Returns the nonce alongside the payload so callers can apply a [`NonceTracker`].
pub fn verify_text(raw: &str, api_key: &str, secret: &str) -> FrameResult<(i64, Value)> {
    let envelope: Envelope = serde_json::from_str(raw)
        .map_err(|e| FrameError::Auth(format!("bad envelope: {e}")))?;
    let nonce = envelope.nonce;
    let payload = verify(envelope, api_key, secret)?;
    Ok((nonce, payload))
}

/// Proof for the handshake challenge: `HMAC(secret, api_key || challenge)`.
pub fn challenge_mac(api_key: &str, challenge: &str, secret: &str) -> String {
    hmac_hex(secret, format!("{api_key}{challenge}").as_bytes())
}

/// Verify the device's proof for `challenge`.
pub fn verify_challenge(api_key: &str, challenge: &str, secret: &str, mac: &str) -> FrameResult<()> {
    verify_hex(secret, format!("{api_key}{challenge}").as_bytes(), mac)
}

/// How strictly envelope nonces are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoncePolicy {
    /// Nonce is a freshness hint only.
    #[default]
    Advisory,
    /// Reject a nonce unless it is above the last one seen and close to the local clock.
    Strict,
}

/// Per-connection nonce bookkeeping.
#[derive(Debug)]
pub struct NonceTracker {
    policy: NoncePolicy,
    last: Option<i64>,
}

impl NonceTracker {
    pub fn new(policy: NoncePolicy) -> Self {
        Self { policy, last: None }
    }

    /// Check `nonce` against the policy, recording it when accepted.
    pub fn check(&mut self, nonce: i64, now: i64) -> FrameResult<()> {
        if self.policy == NoncePolicy::Strict {
            if (nonce - now).abs() > MAX_NONCE_SKEW_SECS {
                return Err(FrameError::Auth(format!("stale nonce {nonce}")));
            }
            if let Some(last) = self.last {
                if nonce <= last {
                    return Err(FrameError::Auth(format!(
                        "nonce not increasing: {nonce} after {last}"
                    )));
                }
            }
        }
        self.last = Some(self.last.map_or(nonce, |last| last.max(nonce)));
        Ok(())
    }
}
