//! frameos-core: shared protocol library for the FrameOS device channel.
//!
//! Provides the signed envelope codec, handshake and command message types,
//! credential helpers, and the error taxonomy used by the controller.

pub mod envelope;
pub mod error;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use envelope::{canonical_json, sign, verify, verify_text, Envelope, NoncePolicy, NonceTracker};
pub use error::{FrameError, FrameResult};
pub use identity::fingerprint;
pub use messages::{Command, CommandReply, ControlMessage, DeviceMessage, StreamKind};
