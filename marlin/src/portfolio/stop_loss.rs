use rust_decimal::Decimal;

/// Stateless price-trigger exit rule.
///
/// Triggers a stop when the current price has fallen to `stop_loss_ratio` of the entry price,
/// and optionally a take-profit when it has risen to `take_profit_ratio`.
#[derive(Debug, Clone, Copy)]
pub struct StopLoss {
    pub stop_loss_ratio: Decimal,
    pub take_profit_ratio: Option<Decimal>,
}

impl Default for StopLoss {
    fn default() -> Self {
        Self {
            stop_loss_ratio: Decimal::new(99, 2),
            take_profit_ratio: None,
        }
    }
}

impl StopLoss {
    pub fn new(stop_loss_ratio: Decimal, take_profit_ratio: Option<Decimal>) -> Self {
        Self {
            stop_loss_ratio,
            take_profit_ratio,
        }
    }

    pub fn trigger_stop_loss(&self, current_price: Decimal, entry_price: Decimal) -> bool {
        entry_price > Decimal::ZERO && current_price / entry_price <= self.stop_loss_ratio
    }

    pub fn trigger_take_profit(&self, current_price: Decimal, entry_price: Decimal) -> bool {
        match self.take_profit_ratio {
            Some(ratio) => entry_price > Decimal::ZERO && current_price / entry_price >= ratio,
            None => false,
        }
    }
}
