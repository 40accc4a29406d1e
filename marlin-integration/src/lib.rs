//! Low-level protocol building blocks shared by the Marlin trading agent.
//!
//! Provides the transport-oriented toolkit the higher layers are assembled
//! from: a fully configurable signed REST client, `WebSocket` connection
//! helpers, a token-bucket rate limiter, and the [`SocketError`] taxonomy
//! they all speak.

/// All socket IO related errors generated in `marlin-integration`.
pub mod error;

/// Http request [`Metric`](metric::Metric) emitted by the REST client.
pub mod metric;

/// Contains HTTP client capable of executing signed & unsigned requests, as
/// well as `WebSocket` type aliases and connection utilities.
pub mod protocol;

/// Token bucket [`RateLimiter`](rate_limit::RateLimiter) used to keep
/// request rates inside exchange quotas.
pub mod rate_limit;

pub use error::SocketError;
