use chrono::{DateTime, TimeDelta, Utc};
use fnv::FnvHashMap;
use marlin_execution::market::MarketId;
use tracing::debug;

/// Per-market trade suppression windows.
///
/// A market cools down for `buy_period` after a buy and `sell_period` after a (stop) sale;
/// markets never traded are treated as having traded in the infinite past.
#[derive(Debug, Clone)]
pub struct CoolDown {
    buy_period: TimeDelta,
    sell_period: TimeDelta,
    last_bought: FnvHashMap<MarketId, DateTime<Utc>>,
    last_sold: FnvHashMap<MarketId, DateTime<Utc>>,
    tick: Option<DateTime<Utc>>,
}

impl CoolDown {
    pub fn new(buy_period: TimeDelta, sell_period: TimeDelta) -> Self {
        Self {
            buy_period,
            sell_period,
            last_bought: FnvHashMap::default(),
            last_sold: FnvHashMap::default(),
            tick: None,
        }
    }

    /// Latch the current tick time; all window arithmetic is relative to it.
    pub fn set_tick(&mut self, tick: DateTime<Utc>) {
        self.tick = Some(tick);
        let cooling = self
            .last_bought
            .keys()
            .chain(self.last_sold.keys())
            .filter(|market| self.cooling_down(market))
            .count();
        if cooling > 0 {
            debug!(markets = cooling, "markets cooling down");
        }
    }

    pub fn cooling_down(&self, market: &MarketId) -> bool {
        let Some(tick) = self.tick else {
            return false;
        };
        if let Some(bought) = self.last_bought.get(market) {
            if tick - *bought < self.buy_period {
                return true;
            }
        }
        if let Some(sold) = self.last_sold.get(market) {
            if tick - *sold < self.sell_period {
                return true;
            }
        }
        false
    }

    pub fn bought(&mut self, market: MarketId) {
        if let Some(tick) = self.tick {
            self.last_bought.insert(market, tick);
        }
    }

    pub fn sold(&mut self, market: MarketId) {
        if let Some(tick) = self.tick {
            self.last_sold.insert(market, tick);
        }
    }
}
