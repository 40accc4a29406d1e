use crate::error::{ApiError, ClientError};
use marlin_integration::protocol::http::HttpParser;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Parses exchange REST responses; error bodies carry a single `message` field.
#[derive(Debug, Copy, Clone)]
pub struct ExchangeParser;

impl HttpParser for ExchangeParser {
    type ApiError = ExchangeApiMessage;
    type OutputError = ClientError;

    fn parse_api_error(&self, status: StatusCode, error: Self::ApiError) -> Self::OutputError {
        if status.is_server_error() {
            return ClientError::InternalServerError(error.message);
        }

        let api_error = match status {
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit,
            StatusCode::NOT_FOUND => ApiError::NotFound,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ApiError::Unauthorized(error.message)
            }
            _ => ApiError::Rejected(error.message),
        };

        ClientError::Api(api_error)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ExchangeApiMessage {
    pub message: String,
}
