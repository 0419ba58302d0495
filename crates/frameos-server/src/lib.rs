//! frameos-server: FrameOS controller.
//!
//! Devices dial in over a WebSocket, prove knowledge of their shared secret,
//! and then receive signed commands. Any controller process can issue a
//! command to any device; when the socket lives in another process the
//! request travels over the shared store.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connections;
pub mod devices;
pub mod dispatch;
pub mod handshake;
pub mod logsink;
pub mod presence;
pub mod remote_exec;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;

pub use config::ServerConfig;
pub use server::FrameServer;
