use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use marlin_execution::market::MarketId;
use rust_decimal::{Decimal, prelude::FromPrimitive};
use thiserror::Error;

/// Float-valued series over markets, as produced by indicators.
pub type Series = FnvHashMap<MarketId, f64>;

/// Decimal-valued series over markets, as consumed by the order path.
pub type DecimalSeries = FnvHashMap<MarketId, Decimal>;

/// One candle of market data.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

impl Default for Candle {
    fn default() -> Self {
        Self {
            time: DateTime::<Utc>::MIN_UTC,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            quote_volume: 0.0,
        }
    }
}

/// Frame of candles keyed by market, time-ascending within each market.
#[derive(Debug, Clone, Default)]
pub struct CandleFrame {
    candles: FnvHashMap<MarketId, Vec<Candle>>,
}

impl CandleFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, market: MarketId, candles: Vec<Candle>) {
        self.candles.insert(market, candles);
    }

    pub fn get(&self, market: &MarketId) -> Option<&[Candle]> {
        self.candles.get(market).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Best bid & ask of a market.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BidAsk {
    pub bid: f64,
    pub ask: f64,
}

/// Best bid/ask frame keyed by market.
pub type BidAskFrame = FnvHashMap<MarketId, BidAsk>;

/// Indicator data is too old to act on.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{0}")]
pub struct StaleData(pub String);

/// Source of the per-tick candle frame (eg/ a time-series database query).
pub trait CandleSource {
    fn compute(&mut self) -> Result<CandleFrame, StaleData>;
}

/// Computes a float series over markets from the tick's candle frame.
pub trait InstantIndicator {
    fn compute(&mut self, candles: &CandleFrame) -> Series;
}

/// Computes the best bid/ask per market.
pub trait BidAskIndicator {
    fn compute(&mut self) -> Result<BidAskFrame, StaleData>;
}

/// Convert an indicator series to decimals for the order path.
///
/// This is the single float→decimal boundary: it runs exactly once per tick per series, and
/// non-finite values are absent from the result rather than poisoning downstream arithmetic.
pub fn to_decimal_series(series: &Series) -> DecimalSeries {
    series
        .iter()
        .filter(|(_, value)| value.is_finite())
        .filter_map(|(market, value)| {
            Decimal::from_f64(*value).map(|decimal| (market.clone(), decimal))
        })
        .collect()
}
