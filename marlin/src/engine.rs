use crate::indicator::StaleData;
use marlin_execution::{error::ClientError, tracker::TrackerError};
use thiserror::Error;

/// Remote command consumed by the manager at tick boundaries.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    /// Stop trading after the current tick; the runner then performs shutdown.
    Terminate(String),
}

/// Errors surfaced out of the tick loop.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicator data too old to act on; the tick is skipped.
    #[error("stale market data: {0}")]
    Stale(#[from] StaleData),

    /// The order tracker's event stream died; the outer loop rebuilds the tracker.
    #[error("order tracker: {0}")]
    TrackerStopped(#[from] TrackerError),

    /// Exchange interaction failed after the client exhausted its own retries.
    #[error("exchange client: {0}")]
    Client(#[from] ClientError),

    /// The authenticated profile has no account for the configured quote currency.
    #[error("no {0} account in exchange profile")]
    MissingQuoteAccount(String),
}
