//! # Marlin
//! Marlin is a tick-driven trading agent that drives a portfolio of spot positions on a
//! centralized exchange. Once per tick it refreshes market metadata and fees, takes an atomic
//! snapshot of its order mirror, evaluates per-market buy/sell signals, and advances every
//! outstanding position through one edge of its lifecycle graph
//! (desired → pending → active → desired-sell → pending-sell → sold), reconciling each
//! transition against the exchange's authoritative order state.
//!
//! At a high level it provides several de-coupled components that interact via a set of traits:
//!
//! * **Indicators**: [`CandleSource`](indicator::CandleSource),
//!   [`InstantIndicator`](indicator::InstantIndicator) &
//!   [`BidAskIndicator`](indicator::BidAskIndicator) supply candles, prices, volumes and
//!   buy/sell weights. Indicator output is float; the order path is decimal, and the conversion
//!   happens exactly once per tick per series.
//! * **Execution**: the [`ExchangeApi`](marlin_execution::client::ExchangeApi) façade places
//!   rate-limited, idempotently-retried orders, and the
//!   [`OrderTracker`](marlin_execution::tracker::OrderTracker) mirrors exchange order state
//!   from the authenticated event stream.
//! * **Portfolio**: the [`PortfolioManager`](portfolio::manager::PortfolioManager) owns every
//!   position, the sizing pipeline, the stop-loss & cool-down policies, and the tick loop that
//!   binds them together.
//! * **System**: [`system::run`] drives the manager until external shutdown, rebuilding the
//!   order tracker when its stream dies, and maps the outcome to a process exit code.

/// Tick-level [`Command`](engine::Command)s and the [`EngineError`](engine::EngineError)
/// taxonomy of the tick loop.
pub mod engine;

/// Serde-deserialisable configuration for the portfolio, the manager and the runner.
pub mod config;

/// Contracts for the external indicator collaborators, plus the float→decimal series boundary.
pub mod indicator;

/// Tracing subscriber initialisation.
pub mod logging;

/// Position lifecycle states, provenance, sizing, risk policies and the tick-driven
/// [`PortfolioManager`](portfolio::manager::PortfolioManager).
pub mod portfolio;

/// Top-level runner: signal handling, tracker rebuilds and exit codes.
pub mod system;
