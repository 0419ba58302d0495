//! Device authentication handshake.
//!
//! 1. Device sends `{action:"hello", deviceApiKey}`
//! 2. Server sends `{action:"challenge", c}` with 256 random bits
//! 3. Device sends `{action:"handshake", mac}` where `mac = HMAC(secret, apiKey || c)`
//! 4. Server sends `{action:"handshake/ok"}`
//!
//! Every step must arrive within the hello timeout. Any failure closes the
//! socket with a policy-violation code; the shared secret never leaves the
//! server and is never logged.

use std::sync::Arc;
use std::time::Duration;

use frameos_core::envelope::verify_challenge;
use frameos_core::identity::generate_challenge;
use frameos_core::{fingerprint, ControlMessage, FrameError, FrameResult};
use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::devices::{DeviceDirectory, DeviceRecord};
use crate::transport::websocket::{recv_frame, send_text, Inbound};

/// Lifecycle of one device connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connected,
    AwaitingHello,
    AwaitingHandshake {
        device: DeviceRecord,
        challenge: String,
    },
    Authenticated {
        device: DeviceRecord,
    },
    Active,
    Closed,
}

impl HandshakeState {
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::Connected => "connected",
            HandshakeState::AwaitingHello => "awaiting_hello",
            HandshakeState::AwaitingHandshake { .. } => "awaiting_handshake",
            HandshakeState::Authenticated { .. } => "authenticated",
            HandshakeState::Active => "active",
            HandshakeState::Closed => "closed",
        }
    }
}

/// What to do after feeding one message to the handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Send this reply and wait for the next message.
    Reply(ControlMessage),
    /// Send this reply; the device is authenticated.
    Done {
        device: DeviceRecord,
        reply: ControlMessage,
    },
}

/// Transport-independent handshake state machine.
pub struct Handshake {
    state: HandshakeState,
    directory: Arc<dyn DeviceDirectory>,
}

impl Handshake {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            state: HandshakeState::Connected,
            directory,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Socket accepted; the first message must be `hello`.
    pub fn accept(&mut self) {
        if self.state == HandshakeState::Connected {
            self.state = HandshakeState::AwaitingHello;
        }
    }

    /// Authenticated → Active, once presence and the send loop are up.
    pub fn activate(&mut self) -> FrameResult<DeviceRecord> {
        match std::mem::replace(&mut self.state, HandshakeState::Active) {
            HandshakeState::Authenticated { device } => Ok(device),
            other => {
                self.state = other;
                Err(FrameError::Other(format!(
                    "cannot activate from {}",
                    self.state.name()
                )))
            }
        }
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }

    /// Feed one text message. Any error leaves the machine `Closed`.
    pub async fn on_message(&mut self, raw: &str) -> FrameResult<HandshakeStep> {
        let result = self.step(raw).await;
        if result.is_err() {
            self.state = HandshakeState::Closed;
        }
        result
    }

    async fn step(&mut self, raw: &str) -> FrameResult<HandshakeStep> {
        let msg = ControlMessage::from_text(raw)?;
        match (std::mem::replace(&mut self.state, HandshakeState::Closed), msg) {
            (HandshakeState::AwaitingHello, ControlMessage::Hello { device_api_key }) => {
                if device_api_key.is_empty() {
                    return Err(FrameError::Auth("missing device api key".into()));
                }
                let device = self
                    .directory
                    .by_api_key(&device_api_key)
                    .await?
                    .ok_or_else(|| {
                        FrameError::Auth(format!("unknown api key {}", fingerprint(&device_api_key)))
                    })?;
                let challenge = generate_challenge()?;
                debug!(device_id = %device.device_id, "hello accepted, sending challenge");
                self.state = HandshakeState::AwaitingHandshake {
                    device,
                    challenge: challenge.clone(),
                };
                Ok(HandshakeStep::Reply(ControlMessage::Challenge { c: challenge }))
            }
            (HandshakeState::AwaitingHandshake { device, challenge }, ControlMessage::Handshake { mac }) => {
                // The key may have been rotated between hello and proof.
                let current = self
                    .directory
                    .get(&device.device_id)
                    .await?
                    .ok_or_else(|| FrameError::Auth(format!("device {} vanished", device.device_id)))?;
                if current.key_version != device.key_version || current.api_key != device.api_key {
                    return Err(FrameError::Auth(format!(
                        "device {} key rotated during handshake",
                        device.device_id
                    )));
                }
                if let Err(e) =
                    verify_challenge(&current.api_key, &challenge, &current.shared_secret, &mac)
                {
                    warn!(
                        device_id = %current.device_id,
                        mac = %fingerprint(&mac),
                        "handshake proof rejected"
                    );
                    return Err(e);
                }
                info!(device_id = %current.device_id, "device authenticated");
                self.state = HandshakeState::Authenticated {
                    device: current.clone(),
                };
                Ok(HandshakeStep::Done {
                    device: current,
                    reply: ControlMessage::HandshakeOk,
                })
            }
            (state, msg) => Err(FrameError::InvalidMessage(format!(
                "unexpected {} in state {}",
                msg.action(),
                state.name()
            ))),
        }
    }
}

/// Run the handshake over a socket. Returns the authenticated device.
pub async fn authenticate<S>(
    ws: &mut S,
    handshake: &mut Handshake,
    hello_timeout: Duration,
) -> FrameResult<DeviceRecord>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    handshake.accept();
    loop {
        let frame = match tokio::time::timeout(hello_timeout, recv_frame(ws)).await {
            Ok(frame) => frame?,
            Err(_) => {
                let expected = handshake_expectation(handshake);
                handshake.close();
                return Err(FrameError::Auth(format!("no {expected} within {hello_timeout:?}")));
            }
        };
        let raw = match frame {
            Inbound::Text(raw) => raw,
            Inbound::Binary(_) => {
                handshake.close();
                return Err(FrameError::InvalidMessage("binary frame during handshake".into()));
            }
            Inbound::Closed => {
                handshake.close();
                return Err(FrameError::Transport("socket closed during handshake".into()));
            }
        };
        match handshake.on_message(&raw).await? {
            HandshakeStep::Reply(reply) => send_text(ws, reply.to_text()?).await?,
            HandshakeStep::Done { device, reply } => {
                send_text(ws, reply.to_text()?).await?;
                return Ok(device);
            }
        }
    }
}

fn handshake_expectation(handshake: &Handshake) -> &'static str {
    match handshake.state() {
        HandshakeState::AwaitingHandshake { .. } => "handshake",
        _ => "hello",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{test_record, StaticDirectory};
    use frameos_core::envelope::challenge_mac;

    fn machine() -> (Handshake, Arc<StaticDirectory>) {
        let dir = Arc::new(StaticDirectory::new(vec![test_record("frame-1", "k1", "s1")]).unwrap());
        (Handshake::new(dir.clone()), dir)
    }

    async fn hello(h: &mut Handshake, key: &str) -> FrameResult<String> {
        h.accept();
        let raw = format!(r#"{{"action":"hello","deviceApiKey":"{key}"}}"#);
        match h.on_message(&raw).await? {
            HandshakeStep::Reply(ControlMessage::Challenge { c }) => Ok(c),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    fn proof(mac: &str) -> String {
        format!(r#"{{"action":"handshake","mac":"{mac}"}}"#)
    }

    #[tokio::test]
    async fn k1_s1_handshake_succeeds() {
        let (mut h, _) = machine();
        let c = hello(&mut h, "k1").await.unwrap();
        assert_eq!(c.len(), 64);
        let mac = challenge_mac("k1", &c, "s1");
        match h.on_message(&proof(&mac)).await.unwrap() {
            HandshakeStep::Done { device, reply } => {
                assert_eq!(device.device_id, "frame-1");
                assert_eq!(reply, ControlMessage::HandshakeOk);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.activate().unwrap().device_id, "frame-1");
        assert_eq!(h.state(), &HandshakeState::Active);
    }

    #[tokio::test]
    async fn unknown_or_empty_key_is_auth_error() {
        let (mut h, _) = machine();
        assert!(matches!(hello(&mut h, "nope").await, Err(FrameError::Auth(_))));
        assert_eq!(h.state(), &HandshakeState::Closed);

        let (mut h, _) = machine();
        assert!(matches!(hello(&mut h, "").await, Err(FrameError::Auth(_))));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (mut h, _) = machine();
        let c = hello(&mut h, "k1").await.unwrap();
        let mac = challenge_mac("k1", &c, "not-s1");
        assert!(matches!(h.on_message(&proof(&mac)).await, Err(FrameError::Auth(_))));
        assert_eq!(h.state(), &HandshakeState::Closed);
    }

    #[tokio::test]
    async fn rotation_between_hello_and_proof_fails() {
        let (mut h, dir) = machine();
        let c = hello(&mut h, "k1").await.unwrap();
        dir.rotate_key("frame-1").await.unwrap();
        let mac = challenge_mac("k1", &c, "s1");
        assert!(matches!(h.on_message(&proof(&mac)).await, Err(FrameError::Auth(_))));
    }

    #[tokio::test]
    async fn out_of_order_messages_are_invalid() {
        let (mut h, _) = machine();
        h.accept();
        assert!(matches!(
            h.on_message(&proof("00")).await,
            Err(FrameError::InvalidMessage(_))
        ));
        let (mut h, _) = machine();
        h.accept();
        assert!(matches!(
            h.on_message("not json").await,
            Err(FrameError::InvalidMessage(_))
        ));
    }
}
