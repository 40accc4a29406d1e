//! Exchange-facing half of the Marlin trading agent.
//!
//! Defines the exchange domain model (markets, products, accounts, fees,
//! orders), the rate-limited REST [`client::ExchangeClient`] with idempotent
//! order placement, and the [`tracker::AsyncOrderTracker`] that mirrors
//! exchange order state from the authenticated event stream.

use serde::{Deserialize, Serialize};

/// Errors generated when interacting with the exchange.
pub mod error;

/// Market identifiers and order-path enums (side, order type, TIF, STP).
pub mod market;

/// Decimal quantization against exchange increments.
pub mod money;

/// Per-market trading rules ([`product::MarketInfo`]).
pub mod product;

/// Exchange account balances.
pub mod account;

/// Maker/taker fee schedule.
pub mod fees;

/// Order identifiers, placement parameters and the exchange order record.
pub mod order;

/// Rate-limited, retry-safe REST client façade and the [`client::ExchangeApi`] contract.
pub mod client;

/// Eventually-consistent local mirror of exchange order state.
pub mod tracker;

/// API credentials for an authenticated exchange profile.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
    pub passphrase: String,
}
