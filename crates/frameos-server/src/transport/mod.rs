//! Device-facing network transports.

pub mod websocket;
