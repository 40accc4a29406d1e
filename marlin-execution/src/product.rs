use crate::{
    market::MarketId,
    money::{Rounding, quantize},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// Trading status of a market.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Online,
    Offline,
    Internal,
    Delisted,
    #[serde(other)]
    Unknown,
}

/// Per-market trading rules, refreshed from the exchange product catalog every tick.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct MarketInfo {
    pub id: MarketId,
    pub base_currency: String,
    pub quote_currency: String,
    pub status: MarketStatus,
    #[serde(default)]
    pub trading_disabled: bool,
    #[serde(default)]
    pub cancel_only: bool,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub limit_only: bool,
    #[serde_as(as = "DisplayFromStr")]
    pub base_min_size: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub base_max_size: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub base_increment: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub quote_increment: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub min_market_funds: Decimal,
    #[serde_as(as = "DisplayFromStr")]
    pub max_market_funds: Decimal,
}

impl MarketInfo {
    /// Whether the advertised trading rules satisfy the increment invariants.
    ///
    /// Products violating these are dropped from the catalog on ingest.
    pub fn is_well_formed(&self) -> bool {
        self.base_increment > Decimal::ZERO
            && self.quote_increment > Decimal::ZERO
            && self.base_min_size >= self.base_increment
    }

    /// Whether new orders may currently be placed on this market.
    pub fn accepts_orders(&self) -> bool {
        self.status == MarketStatus::Online && !self.trading_disabled && !self.cancel_only
    }

    /// Quantize a price down to the quote increment.
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        quantize(price, self.quote_increment, Rounding::Down)
    }

    /// Quantize a base size down to the base increment.
    pub fn quantize_size(&self, size: Decimal) -> Decimal {
        quantize(size, self.base_increment, Rounding::Down)
    }

    /// Quantize a quote amount down to the quote increment.
    pub fn quantize_funds(&self, funds: Decimal) -> Decimal {
        quantize(funds, self.quote_increment, Rounding::Down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market_info(id: &str) -> MarketInfo {
        MarketInfo {
            id: MarketId::new(id),
            base_currency: "ETH".to_string(),
            quote_currency: "USD".to_string(),
            status: MarketStatus::Online,
            trading_disabled: false,
            cancel_only: false,
            post_only: false,
            limit_only: false,
            base_min_size: dec!(0.01),
            base_max_size: dec!(10000),
            base_increment: dec!(0.00000001),
            quote_increment: dec!(0.01),
            min_market_funds: dec!(5),
            max_market_funds: dec!(1000000),
        }
    }

    #[test]
    fn test_deserialize_product() {
        let raw = r#"{
            "id": "ETH-USD",
            "base_currency": "ETH",
            "quote_currency": "USD",
            "status": "online",
            "trading_disabled": false,
            "cancel_only": false,
            "post_only": false,
            "limit_only": false,
            "base_min_size": "0.01",
            "base_max_size": "10000",
            "base_increment": "0.00000001",
            "quote_increment": "0.01",
            "min_market_funds": "5",
            "max_market_funds": "1000000"
        }"#;

        let actual = serde_json::from_str::<MarketInfo>(raw).unwrap();
        assert_eq!(actual, market_info("ETH-USD"));
        assert!(actual.is_well_formed());
        assert!(actual.accepts_orders());
    }

    #[test]
    fn test_unknown_status_is_tolerated() {
        let raw = r#"{
            "id": "ETH-USD",
            "base_currency": "ETH",
            "quote_currency": "USD",
            "status": "auction_mode",
            "base_min_size": "0.01",
            "base_max_size": "10000",
            "base_increment": "0.00000001",
            "quote_increment": "0.01",
            "min_market_funds": "5",
            "max_market_funds": "1000000"
        }"#;

        let actual = serde_json::from_str::<MarketInfo>(raw).unwrap();
        assert_eq!(actual.status, MarketStatus::Unknown);
        assert!(!actual.accepts_orders());
    }

    #[test]
    fn test_malformed_increments_detected() {
        let mut info = market_info("ETH-USD");
        info.base_increment = Decimal::ZERO;
        assert!(!info.is_well_formed());

        let mut info = market_info("ETH-USD");
        info.base_min_size = dec!(0.000000001);
        assert!(!info.is_well_formed());
    }

    #[test]
    fn test_quantize_helpers() {
        let info = market_info("ETH-USD");
        assert_eq!(info.quantize_price(dec!(1234.5678)), dec!(1234.56));
        assert_eq!(info.quantize_size(dec!(0.123456789123)), dec!(0.12345678));
        assert_eq!(info.quantize_funds(dec!(99.999)), dec!(99.99));
    }
}
