use chrono::TimeDelta;
use marlin_execution::market::{MarketId, OrderType, SelfTradePrevention, TimeInForce};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Portfolio-level risk knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortfolioConfig {
    /// Currency every market is quoted in and every balance is held in.
    pub quote_currency: String,
    /// Exit a position once `price / entry_price` falls to this ratio.
    pub stop_loss_ratio: Decimal,
    /// Optionally exit once `price / entry_price` rises to this ratio.
    pub take_profit_ratio: Option<Decimal>,
    /// Fraction of AUM a single market's exposure may reach.
    pub concentration_limit: f64,
    /// Fraction of a market's recent volume our orders may reach.
    pub pov_limit: f64,
    /// Suppression window after a buy in a market, seconds.
    pub buy_cool_down_secs: u64,
    /// Suppression window after a (stop) sale in a market, seconds.
    pub sell_cool_down_secs: u64,
    /// Wall-clock lower bound of one tick, seconds.
    pub min_tick_secs: u64,
    /// Smallest quote amount worth opening a position for.
    pub min_position_size: Decimal,
    /// Hard cap on simultaneously open positions.
    pub max_positions: u64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            quote_currency: "USD".to_string(),
            stop_loss_ratio: Decimal::new(99, 2),
            take_profit_ratio: None,
            concentration_limit: 0.25,
            pov_limit: 0.1,
            buy_cool_down_secs: 0,
            sell_cool_down_secs: 300,
            min_tick_secs: 15,
            min_position_size: Decimal::TEN,
            max_positions: 100,
        }
    }
}

impl PortfolioConfig {
    pub fn buy_cool_down(&self) -> TimeDelta {
        TimeDelta::seconds(self.buy_cool_down_secs as i64)
    }

    pub fn sell_cool_down(&self) -> TimeDelta {
        TimeDelta::seconds(self.sell_cool_down_secs as i64)
    }

    pub fn min_tick(&self) -> Duration {
        Duration::from_secs(self.min_tick_secs)
    }
}

/// Manager behaviour knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Horizon over which the buy weights target spending, seconds. Absent means spend the
    /// whole weight every tick.
    pub buy_horizon_secs: Option<u64>,
    /// Horizon over which the sell weights target liquidation, seconds.
    pub sell_horizon_secs: Option<u64>,
    /// Cancel resting buy orders older than this, seconds.
    pub buy_age_limit_secs: u64,
    /// Cancel resting sell orders older than this, seconds.
    pub sell_age_limit_secs: u64,
    /// Order type used for buys.
    pub buy_order_type: OrderType,
    /// Order type used for sells.
    pub sell_order_type: OrderType,
    /// Time-in-force for limit orders when the market is not post-only.
    pub time_in_force: TimeInForce,
    /// Place maker-only limit orders.
    pub post_only: bool,
    /// Self-trade-prevention mode for sells (buys always cancel-newest).
    pub sell_stp: SelfTradePrevention,
    /// Market-sell every balance on shutdown.
    pub liquidate_on_shutdown: bool,
    /// Settle time before startup reconciliation, seconds.
    pub settle_secs: u64,
    /// Markets never traded.
    pub blacklist: HashSet<MarketId>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            buy_horizon_secs: None,
            sell_horizon_secs: None,
            buy_age_limit_secs: 60,
            sell_age_limit_secs: 60,
            buy_order_type: OrderType::Limit,
            sell_order_type: OrderType::Limit,
            time_in_force: TimeInForce::GoodTillCancelled,
            post_only: false,
            sell_stp: SelfTradePrevention::CancelOldest,
            liquidate_on_shutdown: false,
            settle_secs: 15,
            blacklist: HashSet::new(),
        }
    }
}

impl ManagerConfig {
    pub fn buy_age_limit(&self) -> TimeDelta {
        TimeDelta::seconds(self.buy_age_limit_secs as i64)
    }

    pub fn sell_age_limit(&self) -> TimeDelta {
        TimeDelta::seconds(self.sell_age_limit_secs as i64)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_deserialize_from_empty_object() {
        let portfolio: PortfolioConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(portfolio.quote_currency, "USD");
        assert_eq!(portfolio.max_positions, 100);

        let manager: ManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(manager.buy_order_type, OrderType::Limit);
        assert_eq!(manager.time_in_force, TimeInForce::GoodTillCancelled);
        assert!(!manager.liquidate_on_shutdown);
    }

    #[test]
    fn test_partial_override() {
        let manager: ManagerConfig = serde_json::from_str(
            r#"{
                "buy_order_type": "market",
                "time_in_force": "FOK",
                "blacklist": ["USDT-USD", "DAI-USD"],
                "buy_horizon_secs": 300
            }"#,
        )
        .unwrap();
        assert_eq!(manager.buy_order_type, OrderType::Market);
        assert_eq!(manager.time_in_force, TimeInForce::FillOrKill);
        assert!(manager.blacklist.contains(&MarketId::new("USDT-USD")));
        assert_eq!(manager.buy_horizon_secs, Some(300));
        // untouched knobs keep their defaults
        assert_eq!(manager.sell_age_limit_secs, 60);
    }
}
