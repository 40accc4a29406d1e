use crate::market::{MarketId, OrderType, SelfTradePrevention, Side, TimeInForce};
use chrono::{DateTime, Utc};
use derive_more::{Constructor, Display, From};
use rand::seq::IndexedRandom;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use smol_str::SmolStr;

/// Client-supplied opaque order identifier, attached to every placement so a retried write can
/// be resolved against the exchange without duplicating the order.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct ClientOrderId(pub SmolStr);

impl ClientOrderId {
    pub fn new<S: Into<SmolStr>>(id: S) -> Self {
        Self(id.into())
    }

    /// Construct a stack-allocated `ClientOrderId` backed by a 23 byte [`SmolStr`].
    pub fn random() -> Self {
        const LEN_URL_SAFE_SYMBOLS: usize = 64;
        const URL_SAFE_SYMBOLS: [char; LEN_URL_SAFE_SYMBOLS] = [
            '_', '-', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e',
            'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v',
            'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M',
            'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
        ];
        // SmolStr can be up to 23 bytes long without allocating
        const LEN_NON_ALLOCATING_CID: usize = 23;

        let mut rng = rand::rng();

        let random_utf8: [u8; LEN_NON_ALLOCATING_CID] = std::array::from_fn(|_| {
            let symbol = URL_SAFE_SYMBOLS
                .choose(&mut rng)
                .expect("URL_SAFE_SYMBOLS slice is not empty");

            *symbol as u8
        });

        let random_utf8_str =
            std::str::from_utf8(&random_utf8).expect("URL_SAFE_SYMBOLS are valid utf8");

        Self(SmolStr::new_inline(random_utf8_str))
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::random()
    }
}

/// Exchange-assigned order identifier.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct OrderId(pub SmolStr);

impl OrderId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(SmolStr::new(id))
    }
}

/// Lifecycle status reported by the exchange for an order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Active,
    Done,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Whether the order is still working on the exchange.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::Active
        )
    }
}

/// Reason an order reached `done`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    Filled,
    Canceled,
    #[serde(other)]
    Unknown,
}

/// Parameters of a new limit order.
#[derive(Debug, Clone, Eq, PartialEq, Constructor)]
pub struct NewLimitOrder {
    pub market: MarketId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub time_in_force: TimeInForce,
    pub post_only: bool,
    pub stp: SelfTradePrevention,
}

/// Quote-funds or base-size sizing of a market order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MarketOrderAmount {
    Size(Decimal),
    Funds(Decimal),
}

/// Parameters of a new market order.
#[derive(Debug, Clone, Eq, PartialEq, Constructor)]
pub struct NewMarketOrder {
    pub market: MarketId,
    pub side: Side,
    pub amount: MarketOrderAmount,
    pub stp: SelfTradePrevention,
}

/// Exchange order resource, as returned by placement and order lookups.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct OrderRecord {
    pub id: OrderId,
    #[serde(default)]
    pub client_oid: Option<ClientOrderId>,
    pub product_id: MarketId,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub funds: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_reason: Option<DoneReason>,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub executed_value: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub filled_size: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub fill_fees: Decimal,
    #[serde(default)]
    pub settled: bool,
}
