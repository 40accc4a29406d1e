/// Contains HTTP client capable of executing signed & unsigned requests, as
/// well as an associated execution oriented HTTP request.
pub mod http;

/// Contains useful `WebSocket` type aliases and connection utilities.
pub mod websocket;
