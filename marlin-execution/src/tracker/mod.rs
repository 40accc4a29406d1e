use crate::{
    ApiCredentials,
    error::ClientError,
    market::MarketId,
    order::{DoneReason, OrderId, OrderStatus},
};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use futures::{SinkExt, StreamExt};
use marlin_integration::protocol::websocket::{
    WsMessage, connect, is_websocket_disconnected, process_text,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use self::event::{Subscribe, UserMessage};

/// User-channel message schema and the signed subscription payload.
pub mod event;

/// Errors surfaced by an [`OrderTracker`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum TrackerError {
    /// The event stream consumer terminated; the mirror is frozen and must be rebuilt.
    #[error("order event stream stopped")]
    Stopped,
}

/// Local mirror entry for a single exchange order.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct OrderView {
    pub id: OrderId,
    pub status: OrderStatus,
    pub size: Decimal,
    pub price: Decimal,
    pub executed_value: Decimal,
    pub filled_size: Decimal,
    pub fill_fees: Decimal,
    pub done_reason: Option<DoneReason>,
}

/// Atomic snapshot of tracked orders, keyed by exchange order id.
pub type OrderSnapshot = FnvHashMap<OrderId, OrderView>;

/// Eventually-consistent view of exchange order state.
///
/// `remember` is called immediately after a successful placement; `forget` on terminal
/// handling. Snapshots are owned deep copies taken under the mirror lock.
pub trait OrderTracker {
    fn remember(&mut self, order_id: OrderId);
    fn forget(&mut self, order_id: &OrderId);
    fn snapshot(&mut self) -> Result<OrderSnapshot, TrackerError>;
    fn barrier_snapshot(&mut self) -> Result<(DateTime<Utc>, OrderSnapshot), TrackerError>;
    fn stop(&self);
}

#[derive(Debug, Default)]
pub(crate) struct Mirror {
    orders: OrderSnapshot,
    last_event_time: Option<DateTime<Utc>>,
}

impl Mirror {
    fn touch(&mut self, time: DateTime<Utc>) {
        self.last_event_time = Some(match self.last_event_time {
            Some(last) => last.max(time),
            None => time,
        });
    }

    pub(crate) fn apply(&mut self, message: UserMessage) {
        match message {
            UserMessage::Received {
                time,
                order_id,
                size,
                price,
                funds: _,
            } => {
                self.orders.insert(
                    order_id.clone(),
                    OrderView {
                        id: order_id,
                        status: OrderStatus::Pending,
                        size: size.unwrap_or(Decimal::ZERO),
                        price: price.unwrap_or(Decimal::ZERO),
                        executed_value: Decimal::ZERO,
                        filled_size: Decimal::ZERO,
                        fill_fees: Decimal::ZERO,
                        done_reason: None,
                    },
                );
                self.touch(time);
            }
            UserMessage::Open { time, order_id } => {
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.status = OrderStatus::Open;
                    self.touch(time);
                }
            }
            UserMessage::Match {
                time,
                size,
                price,
                maker_order_id,
                taker_order_id,
                maker_fee_rate,
                taker_fee_rate,
            } => {
                // Our order may be on either side of the trade; the maker id wins when both match
                let order_id = if self.orders.contains_key(&maker_order_id) {
                    maker_order_id
                } else {
                    taker_order_id
                };
                let Some(order) = self.orders.get_mut(&order_id) else {
                    return;
                };
                let executed_value_delta = size * price;
                let fee_rate = maker_fee_rate
                    .or(taker_fee_rate)
                    .unwrap_or(Decimal::ZERO);
                order.executed_value += executed_value_delta;
                order.filled_size += size;
                order.fill_fees += executed_value_delta * fee_rate;
                self.touch(time);
            }
            UserMessage::Change {
                time,
                order_id,
                new_size,
            } => {
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.size = new_size;
                    self.touch(time);
                }
            }
            UserMessage::Done {
                time,
                order_id,
                reason,
            } => {
                if let Some(order) = self.orders.get_mut(&order_id) {
                    order.status = OrderStatus::Done;
                    order.done_reason = reason;
                    self.touch(time);
                }
            }
            UserMessage::Heartbeat | UserMessage::Subscriptions | UserMessage::Unknown => {}
        }
    }
}

/// Configuration for an [`AsyncOrderTracker`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// WebSocket endpoint of the exchange event stream.
    pub ws_url: Url,
    /// Evict mirror entries that were never `remember`ed (defensive against cross-session
    /// orders).
    #[serde(default = "default_ignore_untracked")]
    pub ignore_untracked: bool,
}

fn default_ignore_untracked() -> bool {
    true
}

/// Mirrors exchange order state by consuming the authenticated `user` event stream on a
/// background task.
///
/// The mirror and its last-event timestamp are the only cross-task state; both live behind a
/// single mutex. A stream disconnect is fatal: the consumer flags `stopped` and every
/// subsequent snapshot fails with [`TrackerError::Stopped`] until the tracker is rebuilt.
#[derive(Debug)]
pub struct AsyncOrderTracker {
    mirror: Arc<Mutex<Mirror>>,
    stopped: Arc<AtomicBool>,
    watchlist: FnvHashSet<OrderId>,
    ignore_untracked: bool,
    consumer: Option<tokio::task::JoinHandle<()>>,
}

impl AsyncOrderTracker {
    /// Spawn the stream consumer and return the tracker handle.
    pub fn spawn(
        config: TrackerConfig,
        credentials: &ApiCredentials,
        products: Vec<MarketId>,
    ) -> Result<Self, ClientError> {
        let subscribe = Subscribe::new(credentials, products)?;
        let mirror = Arc::new(Mutex::new(Mirror::default()));
        let stopped = Arc::new(AtomicBool::new(false));

        let consumer = tokio::spawn(run_consumer(
            config.ws_url.clone(),
            subscribe,
            Arc::clone(&mirror),
            Arc::clone(&stopped),
        ));

        Ok(Self {
            mirror,
            stopped,
            watchlist: FnvHashSet::default(),
            ignore_untracked: config.ignore_untracked,
            consumer: Some(consumer),
        })
    }
}

impl OrderTracker for AsyncOrderTracker {
    fn remember(&mut self, order_id: OrderId) {
        self.watchlist.insert(order_id);
    }

    fn forget(&mut self, order_id: &OrderId) {
        self.watchlist.remove(order_id);
        self.mirror.lock().orders.remove(order_id);
    }

    fn snapshot(&mut self) -> Result<OrderSnapshot, TrackerError> {
        self.barrier_snapshot().map(|(_, snapshot)| snapshot)
    }

    fn barrier_snapshot(&mut self) -> Result<(DateTime<Utc>, OrderSnapshot), TrackerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TrackerError::Stopped);
        }

        let mut mirror = self.mirror.lock();
        if self.ignore_untracked {
            let watchlist = &self.watchlist;
            mirror
                .orders
                .retain(|order_id, _| watchlist.contains(order_id));
        }
        let timestamp = mirror.last_event_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok((timestamp, mirror.orders.clone()))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(consumer) = &self.consumer {
            consumer.abort();
        }
    }
}

impl Drop for AsyncOrderTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_consumer(
    ws_url: Url,
    subscribe: Subscribe,
    mirror: Arc<Mutex<Mirror>>,
    stopped: Arc<AtomicBool>,
) {
    match connect(ws_url.as_str()).await {
        Ok(mut websocket) => {
            let payload = match serde_json::to_string(&subscribe) {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "failed to serialise subscribe payload");
                    stopped.store(true, Ordering::SeqCst);
                    return;
                }
            };
            if let Err(error) = websocket.send(WsMessage::text(payload)).await {
                warn!(%error, "failed to subscribe to user channel");
                stopped.store(true, Ordering::SeqCst);
                return;
            }
            info!("order tracker subscribed to user channel");

            while let Some(message) = websocket.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        match process_text::<UserMessage>(text) {
                            Ok(message) => mirror.lock().apply(message),
                            // Unparseable frames are logged by process_text and skipped
                            Err(_) => continue,
                        }
                    }
                    Ok(WsMessage::Close(frame)) => {
                        warn!(?frame, "user channel closed by exchange");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) if is_websocket_disconnected(&error) => {
                        warn!(%error, "user channel disconnected");
                        break;
                    }
                    Err(error) => {
                        // per-message errors (eg/ oversized or malformed frames) leave the
                        // stream usable
                        warn!(%error, "user channel read failed");
                    }
                }
            }
        }
        Err(error) => {
            warn!(%error, "failed to connect order tracker stream");
        }
    }

    // A dead stream freezes the mirror; the next barrier_snapshot raises and the outer loop
    // rebuilds the tracker
    debug!("order tracker consumer terminating");
    stopped.store(true, Ordering::SeqCst);
}
