use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique identifier for a spot market in `BASE-QUOTE` form (eg/ "ETH-USD").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct MarketId(pub SmolStr);

impl MarketId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id))
    }

    /// Construct a [`MarketId`] from its base & quote currencies (eg/ "ETH" + "USD").
    pub fn from_parts(base: &str, quote: &str) -> Self {
        Self(SmolStr::new(format!("{base}-{quote}")))
    }

    /// Base currency of the market (eg/ "ETH" of "ETH-USD").
    pub fn base(&self) -> &str {
        self.0.split_once('-').map(|(base, _)| base).unwrap_or("")
    }

    /// Quote currency of the market (eg/ "USD" of "ETH-USD").
    pub fn quote(&self) -> &str {
        self.0.split_once('-').map(|(_, quote)| quote).unwrap_or("")
    }
}

impl AsRef<str> for MarketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Side of an order or trade.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[display("buy")]
    Buy,
    #[display("sell")]
    Sell,
}

/// Order execution type.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[display("limit")]
    Limit,
    #[display("market")]
    Market,
}

/// Time in force policy for limit orders.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub enum TimeInForce {
    /// Good until cancelled.
    #[serde(rename = "GTC")]
    #[display("GTC")]
    GoodTillCancelled,
    /// Immediate or cancel.
    #[serde(rename = "IOC")]
    #[display("IOC")]
    ImmediateOrCancel,
    /// Fill or kill.
    #[serde(rename = "FOK")]
    #[display("FOK")]
    FillOrKill,
}

/// Self-trade-prevention mode attached to an order.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "lowercase")]
pub enum SelfTradePrevention {
    /// Cancel newest.
    #[serde(rename = "cn")]
    #[display("cn")]
    CancelNewest,
    /// Cancel oldest.
    #[serde(rename = "co")]
    #[display("co")]
    CancelOldest,
    /// Decrement and cancel.
    #[serde(rename = "dc")]
    #[display("dc")]
    DecrementAndCancel,
}
