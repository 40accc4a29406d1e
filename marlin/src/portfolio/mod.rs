/// Append-only provenance arena linking every position state back to its origin.
pub mod lineage;

/// Typed position lifecycle states and the open-position counter.
pub mod position;

/// Per-market time-based trade suppression.
pub mod cool_down;

/// Price-trigger exit rule.
pub mod stop_loss;

/// Weight filtering, exposure limits and exchange-legal order sizing.
pub mod sizing;

/// The tick-driven state machine advancing every position through its lifecycle.
pub mod manager;
