use marlin_integration::SocketError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the [`ExchangeClient`](crate::client::ExchangeClient).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ClientError {
    /// Transport-level failure (connection, timeout, TLS). Retry-safe for reads; writes must
    /// go through the client-order-id discipline.
    #[error("transport: {0}")]
    Transport(String),

    /// The exchange answered 5xx. The request may or may not have been applied.
    #[error("internal server error: {0}")]
    InternalServerError(String),

    /// The exchange answered with a well-formed API error.
    #[error("API: {0}")]
    Api(#[from] ApiError),

    /// The response body could not be interpreted.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Client-side configuration problem (eg/ malformed API secret).
    #[error("invalid credentials: {0}")]
    Credentials(String),
}

impl ClientError {
    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::InternalServerError(_)
        )
    }

    /// The rejection message carried by an [`ApiError::Rejected`], if any.
    pub fn rejection_message(&self) -> Option<&str> {
        match self {
            ClientError::Api(ApiError::Rejected(message)) => Some(message),
            _ => None,
        }
    }
}

impl From<SocketError> for ClientError {
    fn from(error: SocketError) -> Self {
        match error {
            SocketError::Deserialise { .. }
            | SocketError::DeserialiseBinary { .. }
            | SocketError::Serialise(_) => ClientError::UnexpectedResponse(error.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Well-formed error responses from the exchange API.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum ApiError {
    #[error("rate limit exceeded")]
    RateLimit,

    #[error("resource not found")]
    NotFound,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rejected: {0}")]
    Rejected(String),
}
