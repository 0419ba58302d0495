//! Abuse protection for the device handshake.

pub mod rate_limit;

pub use rate_limit::HelloRateLimiter;
