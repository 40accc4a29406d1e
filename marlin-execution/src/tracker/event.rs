use crate::{
    ApiCredentials,
    client::signer::decode_secret,
    error::ClientError,
    market::MarketId,
    order::{DoneReason, OrderId},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Message consumed from the authenticated `user` channel of the exchange event stream.
///
/// Decimal fields arrive as strings; unknown message types deserialize to [`UserMessage::Unknown`]
/// so new feed variants never kill the consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserMessage {
    Received {
        time: DateTime<Utc>,
        order_id: OrderId,
        #[serde(default)]
        size: Option<Decimal>,
        #[serde(default)]
        price: Option<Decimal>,
        #[serde(default)]
        funds: Option<Decimal>,
    },
    Open {
        time: DateTime<Utc>,
        order_id: OrderId,
    },
    Match {
        time: DateTime<Utc>,
        size: Decimal,
        price: Decimal,
        maker_order_id: OrderId,
        taker_order_id: OrderId,
        #[serde(default)]
        maker_fee_rate: Option<Decimal>,
        #[serde(default)]
        taker_fee_rate: Option<Decimal>,
    },
    Change {
        time: DateTime<Utc>,
        order_id: OrderId,
        new_size: Decimal,
    },
    Done {
        time: DateTime<Utc>,
        order_id: OrderId,
        #[serde(default)]
        reason: Option<DoneReason>,
    },
    Heartbeat,
    Subscriptions,
    #[serde(other)]
    Unknown,
}

/// Authenticated subscription request for the `user` + `heartbeat` channels.
#[derive(Debug, Clone, Serialize)]
pub struct Subscribe {
    #[serde(rename = "type")]
    kind: &'static str,
    product_ids: Vec<MarketId>,
    channels: Vec<&'static str>,
    signature: String,
    key: String,
    passphrase: String,
    timestamp: String,
}

impl Subscribe {
    /// Build the signed subscription payload for the provided products.
    pub fn new(
        credentials: &ApiCredentials,
        product_ids: Vec<MarketId>,
    ) -> Result<Self, ClientError> {
        let timestamp = Utc::now().timestamp().to_string();

        let secret = decode_secret(&credentials.secret)
            .map_err(|error| ClientError::Credentials(error.to_string()))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret)
            .map_err(|error| ClientError::Credentials(error.to_string()))?;

        // Stream auth signs the verification endpoint: "{timestamp}GET/users/self/verify"
        mac.update(timestamp.as_bytes());
        mac.update(b"GET");
        mac.update(b"/users/self/verify");

        use base64::Engine;
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(Self {
            kind: "subscribe",
            product_ids,
            channels: vec!["user", "heartbeat"],
            signature,
            key: credentials.key.clone(),
            passphrase: credentials.passphrase.clone(),
            timestamp,
        })
    }
}
