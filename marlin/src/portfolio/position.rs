use crate::portfolio::lineage::StateId;
use chrono::{DateTime, Utc};
use marlin_execution::{market::MarketId, order::OrderId};
use rust_decimal::Decimal;

/// Counts positions entering and leaving the manager's custody.
///
/// `added` and `dropped` are both monotonic; their difference is the number of currently open
/// positions. A decrement below zero is an internal invariant violation and aborts.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PositionCounter {
    added: u64,
    dropped: u64,
}

impl PositionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added(&self) -> u64 {
        self.added
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of currently open positions.
    pub fn count(&self) -> u64 {
        self.added - self.dropped
    }

    /// Total positions ever opened.
    pub fn monotonic_count(&self) -> u64 {
        self.added
    }

    pub fn increment(&mut self) -> u64 {
        self.added += 1;
        self.added
    }

    pub fn decrement(&mut self) -> u64 {
        self.dropped += 1;
        if self.dropped > self.added {
            panic!("position counter underflow: dropped more positions than were ever added");
        }
        self.count()
    }
}

/// Entry economics of a held position, carried through the sell states so a rejected or
/// cancelled exit can be downgraded back to an [`ActivePosition`] without losing provenance.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PositionEntry {
    pub price: Decimal,
    pub fees: Decimal,
    pub start: DateTime<Utc>,
}

/// We want to buy at most `size` of base in `market` for at most `price`.
#[derive(Debug, Clone)]
pub struct DesiredLimitBuy {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    /// Quote spend reserved for this buy until the exchange answers.
    pub allocation: Decimal,
    pub id: StateId,
}

/// We want to spend `funds` of quote at the market.
#[derive(Debug, Clone)]
pub struct DesiredMarketBuy {
    pub market: MarketId,
    pub funds: Decimal,
    pub allocation: Decimal,
    pub id: StateId,
}

/// The exchange accepted our limit buy.
#[derive(Debug, Clone)]
pub struct PendingLimitBuy {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    pub order_id: OrderId,
    pub created_at: DateTime<Utc>,
    pub id: StateId,
}

/// The exchange accepted our market buy.
#[derive(Debug, Clone)]
pub struct PendingMarketBuy {
    pub market: MarketId,
    pub funds: Decimal,
    pub order_id: OrderId,
    pub created_at: DateTime<Utc>,
    pub id: StateId,
}

/// We own `size` of base in `market`, paid for at the volume-weighted `price` plus `fees`.
#[derive(Debug, Clone)]
pub struct ActivePosition {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    pub fees: Decimal,
    pub start: DateTime<Utc>,
    pub id: StateId,
}

impl ActivePosition {
    pub fn entry(&self) -> PositionEntry {
        PositionEntry {
            price: self.price,
            fees: self.fees,
            start: self.start,
        }
    }

    /// Combine two positions in the same market: size-weighted VWAP price, summed fees,
    /// earliest start.
    pub fn merge(&self, other: &ActivePosition, id: StateId) -> ActivePosition {
        debug_assert_eq!(self.market, other.market);
        let size = self.size + other.size;
        let price = (self.price * self.size + other.price * other.size) / size;
        ActivePosition {
            market: self.market.clone(),
            price,
            size,
            fees: self.fees + other.fees,
            start: self.start.min(other.start),
            id,
        }
    }

    /// The unsold remainder after a partial sell emission.
    pub fn drawdown_clone(&self, remainder: Decimal, id: StateId) -> ActivePosition {
        ActivePosition {
            market: self.market.clone(),
            price: self.price,
            size: remainder,
            fees: self.fees,
            start: self.start,
            id,
        }
    }
}

/// Sell at most `size` of base for at least `price` of quote.
#[derive(Debug, Clone)]
pub struct DesiredLimitSell {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    pub stop_sale: bool,
    pub entry: PositionEntry,
    pub id: StateId,
}

/// Sell `size` of base at the market.
#[derive(Debug, Clone)]
pub struct DesiredMarketSell {
    pub market: MarketId,
    pub size: Decimal,
    pub stop_sale: bool,
    pub entry: PositionEntry,
    pub id: StateId,
}

/// The exchange accepted our limit sell.
#[derive(Debug, Clone)]
pub struct PendingLimitSell {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    pub stop_sale: bool,
    pub order_id: OrderId,
    pub created_at: DateTime<Utc>,
    pub entry: PositionEntry,
    pub id: StateId,
}

/// The exchange accepted our market sell.
#[derive(Debug, Clone)]
pub struct PendingMarketSell {
    pub market: MarketId,
    pub size: Decimal,
    pub stop_sale: bool,
    pub order_id: OrderId,
    pub created_at: DateTime<Utc>,
    pub entry: PositionEntry,
    pub id: StateId,
}

/// Terminal: we sold `size` of base at `price`, paying `fees` of quote.
#[derive(Debug, Clone)]
pub struct Sold {
    pub market: MarketId,
    pub price: Decimal,
    pub size: Decimal,
    pub fees: Decimal,
    pub entry: PositionEntry,
    pub id: StateId,
}
