use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// Maker/taker fee rates for the authenticated profile.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct FeeSchedule {
    #[serde_as(as = "DisplayFromStr")]
    pub maker_fee_rate: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub taker_fee_rate: Decimal,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub usd_volume: Option<Decimal>,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker_fee_rate: Decimal::ZERO,
            taker_fee_rate: Decimal::ZERO,
            usd_volume: None,
        }
    }
}
