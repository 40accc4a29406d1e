use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// Balance of a single currency in the authenticated exchange profile.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Account {
    pub id: String,
    pub currency: String,
    #[serde_as(as = "DisplayFromStr")]
    pub balance: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub available: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub hold: Decimal,
    #[serde(default = "default_trading_enabled")]
    pub trading_enabled: bool,
}

fn default_trading_enabled() -> bool {
    true
}
