use crate::{
    config::{ManagerConfig, PortfolioConfig},
    engine::{Command, EngineError},
    indicator::{
        BidAskIndicator, CandleSource, DecimalSeries, InstantIndicator, Series, to_decimal_series,
    },
    portfolio::{
        cool_down::CoolDown,
        lineage::{Lineage, StateId},
        position::{
            ActivePosition, DesiredLimitBuy, DesiredLimitSell, DesiredMarketBuy,
            DesiredMarketSell, PendingLimitBuy, PendingLimitSell, PendingMarketBuy,
            PendingMarketSell, PositionCounter, PositionEntry, Sold,
        },
        sizing::{
            adjust_spending_target, apply_exposure_caps, compute_sell_size, exposure_headroom,
            prune_limit_weights, prune_market_weights,
        },
        stop_loss::StopLoss,
    },
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use marlin_execution::{
    client::ExchangeApi,
    fees::FeeSchedule,
    market::{MarketId, OrderType, SelfTradePrevention, Side, TimeInForce},
    order::{MarketOrderAmount, NewLimitOrder, NewMarketOrder, OrderStatus},
    product::MarketInfo,
    tracker::{OrderSnapshot, OrderTracker},
};
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Grace period before a pending order is reconciled against the order snapshot; within it the
/// mirror may simply not have seen the placement yet.
const ORDER_WAIT_MILLIS: i64 = 1_000;

/// Rejection messages that warrant keeping the state for a next-tick retry rather than
/// dropping it.
fn is_well_known_rejection(message: &str) -> bool {
    message.contains("Post only mode")
        || message.contains("Limit only mode")
        || message.contains("Too many open orders")
}

/// Lego components for constructing a [`PortfolioManager`] via the new() constructor method.
pub struct ManagerLego<Client, Tracker>
where
    Client: ExchangeApi,
    Tracker: OrderTracker,
{
    /// Rate-limited, retry-safe exchange REST façade.
    pub client: Client,
    /// Mirror of exchange order state fed by the authenticated event stream.
    pub tracker: Tracker,
    /// Source of the per-tick candle frame.
    pub candle_source: Box<dyn CandleSource>,
    /// Per-market buy weights in `[0, 1]`.
    pub buy_indicator: Box<dyn InstantIndicator>,
    /// Per-market sell fractions in `[0, 1]`.
    pub sell_indicator: Box<dyn InstantIndicator>,
    /// Latest trade price per market.
    pub price_indicator: Box<dyn InstantIndicator>,
    /// Recent traded volume per market (base units).
    pub volume_indicator: Box<dyn InstantIndicator>,
    /// Best bid/ask per market.
    pub bid_ask_indicator: Box<dyn BidAskIndicator>,
    pub stop_loss: StopLoss,
    pub cool_down: CoolDown,
    /// mpsc::Receiver for receiving [`Command`]s from a remote source.
    pub command_rx: mpsc::Receiver<Command>,
    pub portfolio: PortfolioConfig,
    pub manager: ManagerConfig,
}

/// Single-threaded, tick-driven state machine advancing every outstanding position through its
/// lifecycle, reconciling each transition against an atomic snapshot of exchange orders.
///
/// All positions are owned exclusively by this manager and mutated only inside the tick loop;
/// the lists below are disjoint by state type.
pub struct PortfolioManager<Client, Tracker>
where
    Client: ExchangeApi,
    Tracker: OrderTracker,
{
    client: Client,
    tracker: Tracker,
    candle_source: Box<dyn CandleSource>,
    buy_indicator: Box<dyn InstantIndicator>,
    sell_indicator: Box<dyn InstantIndicator>,
    price_indicator: Box<dyn InstantIndicator>,
    volume_indicator: Box<dyn InstantIndicator>,
    bid_ask_indicator: Box<dyn BidAskIndicator>,
    stop_loss: StopLoss,
    cool_down: CoolDown,
    command_rx: mpsc::Receiver<Command>,
    portfolio_config: PortfolioConfig,
    manager_config: ManagerConfig,

    quote_account_id: Option<String>,
    lineage: Lineage,
    counter: PositionCounter,
    next_position_number: u64,

    // TICK VARIABLES, established atomically at tick start
    tick_time: DateTime<Utc>,
    last_tick_time: DateTime<Utc>,
    last_tick_duration: Option<Duration>,
    market_info: FnvHashMap<MarketId, MarketInfo>,
    fees: FeeSchedule,
    orders: OrderSnapshot,
    order_snapshot_time: DateTime<Utc>,
    prices: DecimalSeries,
    bids: DecimalSeries,
    asks: DecimalSeries,
    float_prices: Series,
    float_volumes: Series,
    buy_weights: Series,
    sell_weights: Series,
    available_funds: Decimal,
    /// Quote reserved by desired buys until the exchange answers their placement.
    allocations: Decimal,

    // STATES, disjoint by type
    desired_limit_buys: VecDeque<DesiredLimitBuy>,
    desired_market_buys: Vec<DesiredMarketBuy>,
    pending_limit_buys: Vec<PendingLimitBuy>,
    pending_market_buys: Vec<PendingMarketBuy>,
    active_positions: Vec<ActivePosition>,
    desired_limit_sells: Vec<DesiredLimitSell>,
    desired_market_sells: Vec<DesiredMarketSell>,
    pending_limit_sells: Vec<PendingLimitSell>,
    pending_market_sells: Vec<PendingMarketSell>,
    sells: Vec<Sold>,

    stopped: bool,
    shutdown_complete: bool,
}

impl<Client, Tracker> PortfolioManager<Client, Tracker>
where
    Client: ExchangeApi,
    Tracker: OrderTracker,
{
    /// Constructs a new [`PortfolioManager`] instance using the provided [`ManagerLego`].
    pub fn new(lego: ManagerLego<Client, Tracker>) -> Self {
        info!(
            quote = %lego.portfolio.quote_currency,
            buy_order_type = %lego.manager.buy_order_type,
            sell_order_type = %lego.manager.sell_order_type,
            "constructed new PortfolioManager instance"
        );

        Self {
            client: lego.client,
            tracker: lego.tracker,
            candle_source: lego.candle_source,
            buy_indicator: lego.buy_indicator,
            sell_indicator: lego.sell_indicator,
            price_indicator: lego.price_indicator,
            volume_indicator: lego.volume_indicator,
            bid_ask_indicator: lego.bid_ask_indicator,
            stop_loss: lego.stop_loss,
            cool_down: lego.cool_down,
            command_rx: lego.command_rx,
            portfolio_config: lego.portfolio,
            manager_config: lego.manager,
            quote_account_id: None,
            lineage: Lineage::new(),
            counter: PositionCounter::new(),
            next_position_number: 0,
            tick_time: DateTime::<Utc>::MIN_UTC,
            last_tick_time: DateTime::<Utc>::MIN_UTC,
            last_tick_duration: None,
            market_info: FnvHashMap::default(),
            fees: FeeSchedule::default(),
            orders: OrderSnapshot::default(),
            order_snapshot_time: DateTime::<Utc>::MIN_UTC,
            prices: DecimalSeries::default(),
            bids: DecimalSeries::default(),
            asks: DecimalSeries::default(),
            float_prices: Series::default(),
            float_volumes: Series::default(),
            buy_weights: Series::default(),
            sell_weights: Series::default(),
            available_funds: Decimal::ZERO,
            allocations: Decimal::ZERO,
            desired_limit_buys: VecDeque::new(),
            desired_market_buys: Vec::new(),
            pending_limit_buys: Vec::new(),
            pending_market_buys: Vec::new(),
            active_positions: Vec::new(),
            desired_limit_sells: Vec::new(),
            desired_market_sells: Vec::new(),
            pending_limit_sells: Vec::new(),
            pending_market_sells: Vec::new(),
            sells: Vec::new(),
            stopped: false,
            shutdown_complete: false,
        }
    }

    /// Replace the order tracker after its event stream died.
    pub fn set_tracker(&mut self, tracker: Tracker) {
        self.tracker = tracker;
        // Pending orders are re-watched so the fresh mirror does not evict them
        for buy in &self.pending_limit_buys {
            self.tracker.remember(buy.order_id.clone());
        }
        for buy in &self.pending_market_buys {
            self.tracker.remember(buy.order_id.clone());
        }
        for sell in &self.pending_limit_sells {
            self.tracker.remember(sell.order_id.clone());
        }
        for sell in &self.pending_market_sells {
            self.tracker.remember(sell.order_id.clone());
        }
    }

    /// Run the trading loop until externally terminated or a tick-fatal error surfaces.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        if self.last_tick_time == DateTime::<Utc>::MIN_UTC {
            self.reconcile_startup().await?;
        }

        loop {
            while let Ok(command) = self.command_rx.try_recv() {
                match command {
                    Command::Terminate(reason) => {
                        info!(%reason, "terminate command received");
                        self.stopped = true;
                    }
                }
            }
            if self.stopped {
                return Ok(());
            }

            let started = Instant::now();
            let progressed = self.tick().await?;
            let elapsed = started.elapsed();
            if progressed {
                self.last_tick_duration = Some(elapsed);
            }

            let min_tick = self.portfolio_config.min_tick();
            if elapsed < min_tick {
                tokio::time::sleep(min_tick - elapsed).await;
            }
        }
    }

    /// One full tick: establish the tick variable set, then advance every position through one
    /// state edge. Returns `false` when the tick was skipped (stale data or a non-advancing
    /// server clock).
    pub async fn tick(&mut self) -> Result<bool, EngineError> {
        if !self.set_tick_variables().await? {
            return Ok(false);
        }

        self.manage_positions().await?;
        self.last_tick_time = self.tick_time;
        Ok(true)
    }

    async fn set_tick_variables(&mut self) -> Result<bool, EngineError> {
        let products = self.client.get_products().await?;
        self.market_info = products
            .into_iter()
            .map(|product| (product.id.clone(), product))
            .collect();
        self.fees = self.client.get_fees().await?;

        let (snapshot_time, orders) = self.tracker.barrier_snapshot()?;
        self.order_snapshot_time = snapshot_time;
        self.orders = orders;

        let tick_time = self.client.get_server_time().await?;
        if tick_time <= self.last_tick_time {
            warn!(%tick_time, last_tick_time = %self.last_tick_time, "server clock not advancing, backing off");
            return Ok(false);
        }
        self.tick_time = tick_time;

        let candles = match self.candle_source.compute() {
            Ok(candles) => candles,
            Err(stale) => {
                warn!(%stale, "candles stale, skipping tick");
                return Ok(false);
            }
        };

        let raw_prices = self.price_indicator.compute(&candles);
        let raw_volumes = self.volume_indicator.compute(&candles);
        self.buy_weights = self.buy_indicator.compute(&candles);
        let mut sell_weights = self.sell_indicator.compute(&candles);

        let bid_ask = match self.bid_ask_indicator.compute() {
            Ok(bid_ask) => bid_ask,
            Err(stale) => {
                warn!(%stale, "bid/ask stale, skipping tick");
                return Ok(false);
            }
        };

        // The single float -> decimal boundary: once per tick per series, NaN -> absent
        self.prices = to_decimal_series(&raw_prices);
        let (bids, asks): (Series, Series) = bid_ask.iter().fold(
            (Series::default(), Series::default()),
            |(mut bids, mut asks), (market, quote)| {
                bids.insert(market.clone(), quote.bid);
                asks.insert(market.clone(), quote.ask);
                (bids, asks)
            },
        );
        self.bids = to_decimal_series(&bids);
        self.asks = to_decimal_series(&asks);
        self.float_prices = raw_prices;
        self.float_volumes = raw_volumes;

        if let (Some(horizon), Some(duration)) = (
            self.manager_config.sell_horizon_secs,
            self.last_tick_duration,
        ) {
            let over = horizon as f64 / duration.as_secs_f64().max(f64::EPSILON);
            sell_weights = adjust_spending_target(&sell_weights, over);
        }
        self.sell_weights = sell_weights;

        self.set_portfolio_available_funds().await?;
        self.cool_down.set_tick(tick_time);
        Ok(true)
    }

    /// Advance every position list through one state edge, in a fixed phase order.
    async fn manage_positions(&mut self) -> Result<(), EngineError> {
        self.check_sold();
        self.check_pending_market_sells();
        self.check_pending_limit_sells().await;
        self.check_pending_limit_buys().await;
        self.check_pending_market_buys().await;
        self.queue_buys();
        self.check_desired_limit_buys().await;
        self.check_desired_market_buys().await;
        self.compress_active_positions();
        self.check_active_positions();
        self.check_desired_market_sells().await;
        self.check_desired_limit_sells().await;
        self.set_portfolio_available_funds().await
    }

    // ------------------------------------------------------------------
    // Phase 1: reap terminal positions
    // ------------------------------------------------------------------

    fn check_sold(&mut self) {
        while let Some(sold) = self.sells.pop() {
            let gain = (sold.price - sold.entry.price) * sold.size;
            info!(
                market = %sold.market,
                %gain,
                fees = %sold.fees,
                chain = %self.lineage.describe(sold.id),
                "position closed"
            );
            self.counter.decrement();
        }
    }

    // ------------------------------------------------------------------
    // Phase 2: advance pending sells
    // ------------------------------------------------------------------

    fn check_pending_market_sells(&mut self) {
        let pending = std::mem::take(&mut self.pending_market_sells);
        let mut next_generation = Vec::with_capacity(pending.len());
        for sell in pending {
            if (self.order_snapshot_time - sell.created_at).num_milliseconds() < ORDER_WAIT_MILLIS
            {
                next_generation.push(sell);
                continue;
            }
            let Some(order) = self.orders.get(&sell.order_id).cloned() else {
                // externally cancelled; the manager is determined to exit
                self.tracker.forget(&sell.order_id);
                let id = self
                    .lineage
                    .advance(sell.id, "desired_market_sell", "ext. cancelled");
                self.desired_market_sells.push(DesiredMarketSell {
                    market: sell.market,
                    size: sell.size,
                    stop_sale: sell.stop_sale,
                    entry: sell.entry,
                    id,
                });
                continue;
            };
            match order.status {
                status if status.is_live() => next_generation.push(sell),
                OrderStatus::Done => {
                    self.tracker.forget(&sell.order_id);
                    self.settle_done_sell(
                        sell.id,
                        &sell.market,
                        sell.size,
                        sell.stop_sale,
                        sell.entry,
                        order.size,
                        order.filled_size,
                        order.executed_value,
                        order.fill_fees,
                    );
                }
                _ => {
                    warn!(order_id = %sell.order_id, status = ?order.status, "unknown order status");
                    next_generation.push(sell);
                }
            }
        }
        self.pending_market_sells = next_generation;
    }

    async fn check_pending_limit_sells(&mut self) {
        let pending = std::mem::take(&mut self.pending_limit_sells);
        let mut next_generation = Vec::with_capacity(pending.len());
        for sell in pending {
            if (self.order_snapshot_time - sell.created_at).num_milliseconds() < ORDER_WAIT_MILLIS
            {
                next_generation.push(sell);
                continue;
            }
            let Some(order) = self.orders.get(&sell.order_id).cloned() else {
                self.tracker.forget(&sell.order_id);
                let id = self
                    .lineage
                    .advance(sell.id, "desired_market_sell", "ext. cancelled");
                self.desired_market_sells.push(DesiredMarketSell {
                    market: sell.market,
                    size: sell.size,
                    stop_sale: sell.stop_sale,
                    entry: sell.entry,
                    id,
                });
                continue;
            };
            let trading_disabled = self
                .market_info
                .get(&sell.market)
                .map(|info| info.trading_disabled)
                .unwrap_or(true);
            match order.status {
                status if status.is_live() => {
                    let age = self.tick_time - sell.created_at;
                    if age > self.manager_config.sell_age_limit() && !trading_disabled {
                        // best-effort; failure retries next tick
                        if let Err(error) = self.client.cancel_order(&sell.order_id).await {
                            warn!(order_id = %sell.order_id, %error, "sell cancel failed");
                        } else {
                            debug!(
                                order_id = %sell.order_id,
                                age_limit = ?self.manager_config.sell_age_limit(),
                                "age limit expired, cancel requested"
                            );
                        }
                    }
                    next_generation.push(sell);
                }
                OrderStatus::Done => {
                    self.tracker.forget(&sell.order_id);
                    self.settle_done_sell(
                        sell.id,
                        &sell.market,
                        sell.size,
                        sell.stop_sale,
                        sell.entry,
                        order.size,
                        order.filled_size,
                        order.executed_value,
                        order.fill_fees,
                    );
                }
                _ => {
                    warn!(order_id = %sell.order_id, status = ?order.status, "unknown order status");
                    next_generation.push(sell);
                }
            }
        }
        self.pending_limit_sells = next_generation;
    }

    /// Resolve a done sell order into a [`Sold`] for the filled portion and a new
    /// [`DesiredMarketSell`] for any remainder, preserving the position count across the fork.
    #[allow(clippy::too_many_arguments)]
    fn settle_done_sell(
        &mut self,
        state: StateId,
        market: &MarketId,
        placed_size: Decimal,
        stop_sale: bool,
        entry: PositionEntry,
        order_size: Decimal,
        filled_size: Decimal,
        executed_value: Decimal,
        fill_fees: Decimal,
    ) {
        let size = if order_size > Decimal::ZERO {
            order_size
        } else {
            placed_size
        };
        let remainder = (size - filled_size).max(Decimal::ZERO);

        if filled_size > Decimal::ZERO {
            let price = executed_value / filled_size;
            let change = if remainder > Decimal::ZERO {
                "partial fill"
            } else {
                "filled"
            };
            let id = self.lineage.advance(state, "sold", change);
            debug!(position = %self.lineage.describe(id));
            self.sells.push(Sold {
                market: market.clone(),
                price,
                size: filled_size,
                fees: fill_fees,
                entry,
                id,
            });
        }
        if remainder > Decimal::ZERO {
            let id = self
                .lineage
                .advance(state, "desired_market_sell", "ext. cancelled");
            debug!(position = %self.lineage.describe(id));
            self.desired_market_sells.push(DesiredMarketSell {
                market: market.clone(),
                size: remainder,
                stop_sale,
                entry,
                id,
            });
        }
        if filled_size > Decimal::ZERO && remainder > Decimal::ZERO {
            // one position forked into a Sold and a remainder
            self.counter.increment();
        }
    }

    // ------------------------------------------------------------------
    // Phase 3: advance pending buys
    // ------------------------------------------------------------------

    async fn check_pending_limit_buys(&mut self) {
        let pending = std::mem::take(&mut self.pending_limit_buys);
        let mut next_generation = Vec::with_capacity(pending.len());
        for buy in pending {
            if (self.order_snapshot_time - buy.created_at).num_milliseconds() < ORDER_WAIT_MILLIS {
                next_generation.push(buy);
                continue;
            }
            let Some(order) = self.orders.get(&buy.order_id).cloned() else {
                // cancelled externally with no fill; self-trade prevention is the usual culprit
                debug!(order_id = %buy.order_id, market = %buy.market, "pending buy disappeared");
                self.tracker.forget(&buy.order_id);
                self.counter.decrement();
                continue;
            };
            match order.status {
                status if status.is_live() => {
                    let trading_disabled = self
                        .market_info
                        .get(&buy.market)
                        .map(|info| info.trading_disabled)
                        .unwrap_or(true);
                    let age = self.tick_time - buy.created_at;
                    if age > self.manager_config.buy_age_limit() && !trading_disabled {
                        if let Err(error) = self.client.cancel_order(&buy.order_id).await {
                            warn!(order_id = %buy.order_id, %error, "buy cancel failed");
                        } else {
                            debug!(
                                order_id = %buy.order_id,
                                age_limit = ?self.manager_config.buy_age_limit(),
                                "age limit expired, cancel requested"
                            );
                        }
                    }
                    next_generation.push(buy);
                }
                OrderStatus::Done => {
                    self.tracker.forget(&buy.order_id);
                    if order.filled_size > Decimal::ZERO {
                        let price = order.executed_value / order.filled_size;
                        let id = self.lineage.advance(buy.id, "active", "order filled");
                        debug!(position = %self.lineage.describe(id));
                        self.active_positions.push(ActivePosition {
                            market: buy.market,
                            price,
                            size: order.filled_size,
                            fees: order.fill_fees,
                            start: self.tick_time,
                            id,
                        });
                    } else {
                        self.counter.decrement();
                    }
                }
                _ => {
                    warn!(order_id = %buy.order_id, status = ?order.status, "unknown order status");
                    next_generation.push(buy);
                }
            }
        }
        self.pending_limit_buys = next_generation;
    }

    async fn check_pending_market_buys(&mut self) {
        let pending = std::mem::take(&mut self.pending_market_buys);
        let mut next_generation = Vec::with_capacity(pending.len());
        for buy in pending {
            if (self.order_snapshot_time - buy.created_at).num_milliseconds() < ORDER_WAIT_MILLIS {
                next_generation.push(buy);
                continue;
            }
            let Some(order) = self.orders.get(&buy.order_id).cloned() else {
                debug!(order_id = %buy.order_id, market = %buy.market, "pending buy disappeared");
                self.tracker.forget(&buy.order_id);
                self.counter.decrement();
                continue;
            };
            match order.status {
                status if status.is_live() => {
                    let age = self.tick_time - buy.created_at;
                    if age > self.manager_config.buy_age_limit() {
                        if let Err(error) = self.client.cancel_order(&buy.order_id).await {
                            warn!(order_id = %buy.order_id, %error, "buy cancel failed");
                        }
                    }
                    next_generation.push(buy);
                }
                OrderStatus::Done => {
                    self.tracker.forget(&buy.order_id);
                    if order.filled_size > Decimal::ZERO {
                        let price = order.executed_value / order.filled_size;
                        let id = self.lineage.advance(buy.id, "active", "order filled");
                        debug!(position = %self.lineage.describe(id));
                        self.active_positions.push(ActivePosition {
                            market: buy.market,
                            price,
                            size: order.filled_size,
                            fees: order.fill_fees,
                            start: self.tick_time,
                            id,
                        });
                    } else {
                        self.counter.decrement();
                    }
                }
                _ => {
                    warn!(order_id = %buy.order_id, status = ?order.status, "unknown order status");
                    next_generation.push(buy);
                }
            }
        }
        self.pending_market_buys = next_generation;
    }

    // ------------------------------------------------------------------
    // Phase 4: derive desired buys from the buy weights
    // ------------------------------------------------------------------

    fn queue_buys(&mut self) {
        let budget = self.available_funds - self.allocations;
        let fee_multiplier = Decimal::ONE + self.fees.taker_fee_rate;
        let spending_limit_quote = budget / fee_multiplier;
        if spending_limit_quote < self.portfolio_config.min_position_size {
            return;
        }
        let open_positions = self.counter.count();
        if open_positions >= self.portfolio_config.max_positions {
            return;
        }
        let slots = (self.portfolio_config.max_positions - open_positions) as usize;
        let Some(spending_limit) = spending_limit_quote.to_f64().filter(|limit| *limit > 0.0)
        else {
            return;
        };

        // 1. filter: cool-downs, blacklist, unknown metadata, non-positive scores
        let weights: Series = self
            .buy_weights
            .iter()
            .filter(|(_, weight)| weight.is_finite() && **weight > 0.0)
            .filter(|(market, _)| !self.manager_config.blacklist.contains(market))
            .filter(|(market, _)| !self.cool_down.cooling_down(market))
            .filter(|(market, _)| self.market_info.contains_key(market))
            .map(|(market, weight)| (market.clone(), *weight))
            .collect();
        if weights.is_empty() {
            return;
        }

        // 2. per-market exposure ceilings (concentration & percentage-of-volume)
        let aum = self.assets_under_management();
        let exposures = self.market_exposures();
        let headroom: Series = weights
            .keys()
            .map(|market| {
                let price = self.float_prices.get(market).copied().unwrap_or(0.0);
                let volume = self.float_volumes.get(market).copied().unwrap_or(0.0);
                let exposure = exposures.get(market).copied().unwrap_or(0.0);
                (
                    market.clone(),
                    exposure_headroom(
                        aum,
                        self.portfolio_config.concentration_limit,
                        self.portfolio_config.pov_limit,
                        volume,
                        price,
                        exposure,
                    ),
                )
            })
            .collect();
        let weights = apply_exposure_caps(weights, spending_limit, &headroom);
        if weights.is_empty() {
            return;
        }

        // 3. rank & prune against exchange minimums
        let weights = match self.manager_config.buy_order_type {
            OrderType::Limit => {
                let min_sizes: Series = weights
                    .keys()
                    .filter_map(|market| {
                        let info = self.market_info.get(market)?;
                        Some((market.clone(), info.base_min_size.to_f64()?))
                    })
                    .collect();
                prune_limit_weights(spending_limit, &weights, &self.float_prices, &min_sizes)
            }
            OrderType::Market => {
                let min_funds: Series = weights
                    .keys()
                    .filter_map(|market| {
                        let info = self.market_info.get(market)?;
                        Some((market.clone(), info.min_market_funds.to_f64()?))
                    })
                    .collect();
                prune_market_weights(spending_limit, &weights, &min_funds)
            }
        };

        // 4. adjust to the tick horizon
        let weights = match (
            self.manager_config.buy_horizon_secs,
            self.last_tick_duration,
        ) {
            (Some(horizon), Some(duration)) => {
                let over = horizon as f64 / duration.as_secs_f64().max(f64::EPSILON);
                adjust_spending_target(&weights, over)
            }
            _ => weights,
        };

        let mut ranked: Vec<(MarketId, f64)> = weights.into_iter().collect();
        ranked.sort_by(|(market_a, weight_a), (market_b, weight_b)| {
            weight_b
                .partial_cmp(weight_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| market_a.cmp(market_b))
        });
        ranked.truncate(slots);

        for (market, weight) in ranked {
            let amount = weight * spending_limit;
            let Some(amount_quote) = Decimal::from_f64(amount).filter(|a| *a > Decimal::ZERO)
            else {
                continue;
            };
            let allocation = amount_quote * fee_multiplier;
            match self.manager_config.buy_order_type {
                OrderType::Limit => {
                    let Some(price) = self
                        .bids
                        .get(&market)
                        .or_else(|| self.prices.get(&market))
                        .copied()
                        .filter(|price| *price > Decimal::ZERO)
                    else {
                        continue;
                    };
                    let size = amount_quote / price;
                    self.next_position_number += 1;
                    let root = self.lineage.root(self.next_position_number, &market);
                    let id = self.lineage.advance(
                        root,
                        "desired_limit_buy",
                        format!("buy target {weight:.2}"),
                    );
                    debug!(position = %self.lineage.describe(id));
                    self.desired_limit_buys.push_front(DesiredLimitBuy {
                        market,
                        price,
                        size,
                        allocation,
                        id,
                    });
                }
                OrderType::Market => {
                    self.next_position_number += 1;
                    let root = self.lineage.root(self.next_position_number, &market);
                    let id = self.lineage.advance(
                        root,
                        "desired_market_buy",
                        format!("buy target {weight:.2}"),
                    );
                    debug!(position = %self.lineage.describe(id));
                    self.desired_market_buys.push(DesiredMarketBuy {
                        market,
                        funds: amount_quote,
                        allocation,
                        id,
                    });
                }
            }
            self.allocations += allocation;
            self.counter.increment();
        }
    }

    // ------------------------------------------------------------------
    // Phase 5: place desired buys
    // ------------------------------------------------------------------

    async fn check_desired_limit_buys(&mut self) {
        let desired = std::mem::take(&mut self.desired_limit_buys);
        let mut next_generation = VecDeque::new();
        for buy in desired {
            let Some(info) = self.market_info.get(&buy.market).cloned() else {
                self.drop_desired_buy(buy.allocation, "market metadata disappeared");
                continue;
            };
            if !info.accepts_orders() {
                self.drop_desired_buy(buy.allocation, "market not accepting orders");
                continue;
            }
            let price = info.quantize_price(buy.price);
            let mut size = info.quantize_size(buy.size);
            if size < info.base_min_size || price <= Decimal::ZERO {
                self.drop_desired_buy(buy.allocation, "below exchange minimum");
                continue;
            }
            size = size.min(info.base_max_size);

            let post_only = self.manager_config.post_only || info.post_only;
            let time_in_force = if post_only {
                TimeInForce::GoodTillCancelled
            } else {
                self.manager_config.time_in_force
            };

            self.allocations -= buy.allocation;
            let placement = self
                .client
                .place_limit_order(NewLimitOrder {
                    market: buy.market.clone(),
                    side: Side::Buy,
                    price,
                    size,
                    time_in_force,
                    post_only,
                    stp: SelfTradePrevention::CancelNewest,
                })
                .await;
            match placement {
                Ok(order) => {
                    self.tracker.remember(order.id.clone());
                    self.cool_down.bought(buy.market.clone());
                    let id = self
                        .lineage
                        .advance(buy.id, "pending_limit_buy", "order placed");
                    debug!(position = %self.lineage.describe(id));
                    self.pending_limit_buys.push(PendingLimitBuy {
                        market: buy.market,
                        price,
                        size,
                        order_id: order.id,
                        created_at: order.created_at,
                        id,
                    });
                }
                Err(error) => {
                    let keep = match error.rejection_message() {
                        Some(message) => is_well_known_rejection(message),
                        None => error.is_retryable(),
                    };
                    if keep {
                        warn!(market = %buy.market, %error, "buy placement failed, retrying next tick");
                        self.allocations += buy.allocation;
                        next_generation.push_back(buy);
                    } else {
                        warn!(market = %buy.market, %error, "buy placement rejected");
                        self.counter.decrement();
                    }
                }
            }
        }
        self.desired_limit_buys = next_generation;
    }

    async fn check_desired_market_buys(&mut self) {
        let desired = std::mem::take(&mut self.desired_market_buys);
        let mut next_generation = Vec::new();
        for buy in desired {
            let Some(info) = self.market_info.get(&buy.market).cloned() else {
                self.drop_desired_buy(buy.allocation, "market metadata disappeared");
                continue;
            };
            if !info.accepts_orders() || info.post_only || info.limit_only {
                self.drop_desired_buy(buy.allocation, "market not accepting market orders");
                continue;
            }
            let mut funds = info.quantize_funds(buy.funds);
            if funds < info.min_market_funds {
                self.drop_desired_buy(buy.allocation, "below exchange minimum");
                continue;
            }
            funds = funds.min(info.max_market_funds);

            self.allocations -= buy.allocation;
            let placement = self
                .client
                .place_market_order(NewMarketOrder {
                    market: buy.market.clone(),
                    side: Side::Buy,
                    amount: MarketOrderAmount::Funds(funds),
                    stp: SelfTradePrevention::CancelNewest,
                })
                .await;
            match placement {
                Ok(order) => {
                    self.tracker.remember(order.id.clone());
                    self.cool_down.bought(buy.market.clone());
                    let id = self
                        .lineage
                        .advance(buy.id, "pending_market_buy", "order placed");
                    debug!(position = %self.lineage.describe(id));
                    self.pending_market_buys.push(PendingMarketBuy {
                        market: buy.market,
                        funds,
                        order_id: order.id,
                        created_at: order.created_at,
                        id,
                    });
                }
                Err(error) => {
                    let keep = match error.rejection_message() {
                        Some(message) => is_well_known_rejection(message),
                        None => error.is_retryable(),
                    };
                    if keep {
                        warn!(market = %buy.market, %error, "buy placement failed, retrying next tick");
                        self.allocations += buy.allocation;
                        next_generation.push(buy);
                    } else {
                        warn!(market = %buy.market, %error, "buy placement rejected");
                        self.counter.decrement();
                    }
                }
            }
        }
        self.desired_market_buys = next_generation;
    }

    fn drop_desired_buy(&mut self, allocation: Decimal, reason: &str) {
        debug!(reason, "dropping desired buy");
        self.allocations -= allocation;
        self.counter.decrement();
    }

    // ------------------------------------------------------------------
    // Phase 6: merge same-market actives
    // ------------------------------------------------------------------

    fn compress_active_positions(&mut self) {
        let actives = std::mem::take(&mut self.active_positions);
        let mut by_market: FnvHashMap<MarketId, ActivePosition> = FnvHashMap::default();
        for position in actives {
            match by_market.remove(&position.market) {
                Some(existing) => {
                    let id = self.lineage.advance(existing.id, "active", "merge");
                    let merged = existing.merge(&position, id);
                    debug!(position = %self.lineage.describe(id), size = %merged.size);
                    by_market.insert(merged.market.clone(), merged);
                    self.counter.decrement();
                }
                None => {
                    by_market.insert(position.market.clone(), position);
                }
            }
        }
        self.active_positions = by_market.into_values().collect();
    }

    // ------------------------------------------------------------------
    // Phase 7: stop-loss & sell weights over actives
    // ------------------------------------------------------------------

    fn check_active_positions(&mut self) {
        let actives = std::mem::take(&mut self.active_positions);
        let mut next_generation = Vec::with_capacity(actives.len());
        for position in actives {
            let Some(info) = self.market_info.get(&position.market).cloned() else {
                next_generation.push(position);
                continue;
            };
            let Some(ask) = self.asks.get(&position.market).copied() else {
                next_generation.push(position);
                continue;
            };
            if position.size < info.base_min_size {
                // un-sellable dust is retired in place, never sold
                next_generation.push(position);
                continue;
            }

            let stop = self.stop_loss.trigger_stop_loss(ask, position.price);
            let take = self.stop_loss.trigger_take_profit(ask, position.price);
            let (fraction, stop_sale, reason) = if stop {
                (Decimal::ONE, true, "stop loss")
            } else if take {
                (Decimal::ONE, true, "take profit")
            } else {
                let weight = self
                    .sell_weights
                    .get(&position.market)
                    .copied()
                    .filter(|weight| weight.is_finite())
                    .unwrap_or(0.0);
                let fraction = Decimal::from_f64(weight.clamp(0.0, 1.0))
                    .unwrap_or(Decimal::ZERO);
                (fraction, false, "sell target")
            };
            if fraction <= Decimal::ZERO {
                next_generation.push(position);
                continue;
            }

            let sell_size = compute_sell_size(
                position.size,
                fraction,
                info.base_min_size,
                info.base_increment,
            );
            if sell_size <= Decimal::ZERO {
                next_generation.push(position);
                continue;
            }
            if stop_sale {
                self.cool_down.sold(position.market.clone());
            }

            let remainder = position.size - sell_size;
            let entry = position.entry();
            match self.manager_config.sell_order_type {
                OrderType::Limit => {
                    let id = self
                        .lineage
                        .advance(position.id, "desired_limit_sell", reason);
                    debug!(position = %self.lineage.describe(id));
                    self.desired_limit_sells.push(DesiredLimitSell {
                        market: position.market.clone(),
                        price: ask,
                        size: sell_size,
                        stop_sale,
                        entry,
                        id,
                    });
                }
                OrderType::Market => {
                    let id = self
                        .lineage
                        .advance(position.id, "desired_market_sell", reason);
                    debug!(position = %self.lineage.describe(id));
                    self.desired_market_sells.push(DesiredMarketSell {
                        market: position.market.clone(),
                        size: sell_size,
                        stop_sale,
                        entry,
                        id,
                    });
                }
            }
            if remainder > Decimal::ZERO {
                let fraction_sold = sell_size / position.size;
                let id = self.lineage.advance(
                    position.id,
                    "active",
                    format!("drawdown {fraction_sold:.3}"),
                );
                next_generation.push(position.drawdown_clone(remainder, id));
                // the position forked into a sell and a remainder
                self.counter.increment();
            }
        }
        self.active_positions = next_generation;
    }

    // ------------------------------------------------------------------
    // Phase 8: place desired sells
    // ------------------------------------------------------------------

    async fn check_desired_market_sells(&mut self) {
        let desired = std::mem::take(&mut self.desired_market_sells);
        let mut next_generation = Vec::new();
        for sell in desired {
            let Some(info) = self.market_info.get(&sell.market).cloned() else {
                next_generation.push(sell);
                continue;
            };
            if !info.accepts_orders() {
                next_generation.push(sell);
                continue;
            }
            if info.post_only || info.limit_only {
                // the market will not take liquidity right now; fall back to a limit sell
                let change = if info.post_only {
                    "post only"
                } else {
                    "limit only"
                };
                let Some(price) = self
                    .asks
                    .get(&sell.market)
                    .or_else(|| self.prices.get(&sell.market))
                    .copied()
                    .filter(|price| *price > Decimal::ZERO)
                else {
                    next_generation.push(sell);
                    continue;
                };
                let id = self.lineage.advance(sell.id, "desired_limit_sell", change);
                debug!(position = %self.lineage.describe(id));
                self.desired_limit_sells.push(DesiredLimitSell {
                    market: sell.market,
                    price,
                    size: sell.size,
                    stop_sale: sell.stop_sale,
                    entry: sell.entry,
                    id,
                });
                continue;
            }

            let mut size = info.quantize_size(sell.size);
            if size < info.base_min_size {
                self.downgrade_sell_to_active(
                    sell.id,
                    sell.market,
                    sell.size,
                    sell.entry,
                    "below exchange minimum",
                );
                continue;
            }
            size = size.min(info.base_max_size);

            let placement = self
                .client
                .place_market_order(NewMarketOrder {
                    market: sell.market.clone(),
                    side: Side::Sell,
                    amount: MarketOrderAmount::Size(size),
                    stp: self.manager_config.sell_stp,
                })
                .await;
            match placement {
                Ok(order) => {
                    self.tracker.remember(order.id.clone());
                    let id = self
                        .lineage
                        .advance(sell.id, "pending_market_sell", "order placed");
                    debug!(position = %self.lineage.describe(id));
                    self.pending_market_sells.push(PendingMarketSell {
                        market: sell.market,
                        size,
                        stop_sale: sell.stop_sale,
                        order_id: order.id,
                        created_at: order.created_at,
                        entry: sell.entry,
                        id,
                    });
                }
                Err(error) => match error.rejection_message() {
                    Some(message) => {
                        warn!(market = %sell.market, message, "sell rejected, downgrading");
                        self.downgrade_sell_to_active(
                            sell.id,
                            sell.market,
                            sell.size,
                            sell.entry,
                            "placement rejected",
                        );
                    }
                    None => {
                        warn!(market = %sell.market, %error, "sell placement failed, retrying next tick");
                        next_generation.push(sell);
                    }
                },
            }
        }
        self.desired_market_sells = next_generation;
    }

    async fn check_desired_limit_sells(&mut self) {
        let desired = std::mem::take(&mut self.desired_limit_sells);
        let mut next_generation = Vec::new();
        for sell in desired {
            let Some(info) = self.market_info.get(&sell.market).cloned() else {
                next_generation.push(sell);
                continue;
            };
            if info.trading_disabled {
                next_generation.push(sell);
                continue;
            }
            let price = info.quantize_price(sell.price);
            let mut size = info.quantize_size(sell.size);
            if size < info.base_min_size || price <= Decimal::ZERO {
                self.downgrade_sell_to_active(
                    sell.id,
                    sell.market,
                    sell.size,
                    sell.entry,
                    "below exchange minimum",
                );
                continue;
            }
            size = size.min(info.base_max_size);

            let post_only = info.post_only || (self.manager_config.post_only && !sell.stop_sale);
            let time_in_force = if post_only {
                TimeInForce::GoodTillCancelled
            } else {
                self.manager_config.time_in_force
            };

            let placement = self
                .client
                .place_limit_order(NewLimitOrder {
                    market: sell.market.clone(),
                    side: Side::Sell,
                    price,
                    size,
                    time_in_force,
                    post_only,
                    stp: self.manager_config.sell_stp,
                })
                .await;
            match placement {
                Ok(order) => {
                    self.tracker.remember(order.id.clone());
                    let id = self
                        .lineage
                        .advance(sell.id, "pending_limit_sell", "order placed");
                    debug!(position = %self.lineage.describe(id));
                    self.pending_limit_sells.push(PendingLimitSell {
                        market: sell.market,
                        price,
                        size,
                        stop_sale: sell.stop_sale,
                        order_id: order.id,
                        created_at: order.created_at,
                        entry: sell.entry,
                        id,
                    });
                }
                Err(error) => match error.rejection_message() {
                    Some(message) => {
                        warn!(market = %sell.market, message, "sell rejected, downgrading");
                        self.downgrade_sell_to_active(
                            sell.id,
                            sell.market,
                            sell.size,
                            sell.entry,
                            "placement rejected",
                        );
                    }
                    None => {
                        warn!(market = %sell.market, %error, "sell placement failed, retrying next tick");
                        next_generation.push(sell);
                    }
                },
            }
        }
        self.desired_limit_sells = next_generation;
    }

    /// A sell that cannot be placed goes back to being an [`ActivePosition`] so its provenance
    /// and entry economics survive for the next evaluation.
    fn downgrade_sell_to_active(
        &mut self,
        state: StateId,
        market: MarketId,
        size: Decimal,
        entry: PositionEntry,
        reason: &str,
    ) {
        let id = self.lineage.advance(state, "active", reason);
        debug!(position = %self.lineage.describe(id));
        self.active_positions.push(ActivePosition {
            market,
            price: entry.price,
            size,
            fees: entry.fees,
            start: entry.start,
            id,
        });
    }

    // ------------------------------------------------------------------
    // Phase 9: refresh quote balance
    // ------------------------------------------------------------------

    async fn set_portfolio_available_funds(&mut self) -> Result<(), EngineError> {
        let account_id = match &self.quote_account_id {
            Some(id) => id.clone(),
            None => {
                let id = self.resolve_quote_account().await?;
                self.quote_account_id = Some(id.clone());
                id
            }
        };
        let account = self.client.get_account(&account_id).await?;
        self.available_funds = account.available;
        Ok(())
    }

    async fn resolve_quote_account(&mut self) -> Result<String, EngineError> {
        let accounts = self.client.get_accounts().await?;
        accounts
            .into_iter()
            .find(|account| account.currency == self.portfolio_config.quote_currency)
            .map(|account| account.id)
            .ok_or_else(|| {
                EngineError::MissingQuoteAccount(self.portfolio_config.quote_currency.clone())
            })
    }

    // ------------------------------------------------------------------
    // Startup & shutdown
    // ------------------------------------------------------------------

    /// Settle, clear every resting order, then materialize one [`ActivePosition`] per held
    /// balance whose market is tradeable and price is known.
    pub async fn reconcile_startup(&mut self) -> Result<(), EngineError> {
        let settle = self.manager_config.settle();
        info!(?settle, "settling before startup reconciliation");
        tokio::time::sleep(settle).await;

        let cancelled = self.client.cancel_all().await?;
        if !cancelled.is_empty() {
            info!(orders = cancelled.len(), "cancelled resting orders from a previous session");
        }

        let products = self.client.get_products().await?;
        self.market_info = products
            .into_iter()
            .map(|product| (product.id.clone(), product))
            .collect();

        let candles = self.candle_source.compute()?;
        let prices = to_decimal_series(&self.price_indicator.compute(&candles));
        let now = self.client.get_server_time().await?;

        for account in self.client.get_accounts().await? {
            if account.currency == self.portfolio_config.quote_currency {
                self.quote_account_id = Some(account.id.clone());
                self.available_funds = account.available;
                continue;
            }
            if account.balance <= Decimal::ZERO {
                continue;
            }
            let market = MarketId::from_parts(
                &account.currency,
                &self.portfolio_config.quote_currency,
            );
            if self.manager_config.blacklist.contains(&market) {
                continue;
            }
            let Some(info) = self.market_info.get(&market) else {
                continue;
            };
            if account.balance < info.base_min_size {
                continue;
            }
            let Some(price) = prices.get(&market).copied() else {
                warn!(%market, "balance held but price unknown, not tracking");
                continue;
            };

            self.next_position_number += 1;
            let id = self
                .lineage
                .downloaded(self.next_position_number, &market);
            self.counter.increment();
            info!(%market, size = %account.balance, "downloaded position from account balance");
            self.active_positions.push(ActivePosition {
                market,
                price,
                size: account.balance,
                // fees unknown for downloaded balances
                fees: Decimal::ZERO,
                start: now,
                id,
            });
        }

        self.last_tick_time = now;
        Ok(())
    }

    /// Cancel everything, optionally liquidate, and stop the tracker. Re-entry is a no-op.
    pub async fn shutdown(&mut self) {
        if self.shutdown_complete {
            return;
        }
        self.shutdown_complete = true;
        info!("shutting down");

        if let Err(error) = self.client.cancel_all().await {
            warn!(%error, "cancel_all failed during shutdown");
        }
        if self.manager_config.liquidate_on_shutdown {
            self.liquidate().await;
        }
        self.tracker.stop();
    }

    /// Market-sell every nonzero non-quote balance.
    pub async fn liquidate(&mut self) {
        let accounts = match self.client.get_accounts().await {
            Ok(accounts) => accounts,
            Err(error) => {
                warn!(%error, "liquidation aborted, accounts unavailable");
                return;
            }
        };
        for account in accounts {
            if account.currency == self.portfolio_config.quote_currency
                || account.available <= Decimal::ZERO
            {
                continue;
            }
            let market = MarketId::from_parts(
                &account.currency,
                &self.portfolio_config.quote_currency,
            );
            let size = match self.market_info.get(&market) {
                Some(info) => info.quantize_size(account.available),
                None => account.available,
            };
            if size <= Decimal::ZERO {
                continue;
            }
            match self
                .client
                .place_market_order(NewMarketOrder {
                    market: market.clone(),
                    side: Side::Sell,
                    amount: MarketOrderAmount::Size(size),
                    stp: self.manager_config.sell_stp,
                })
                .await
            {
                Ok(_) => info!(%market, %size, "placed liquidation market sell"),
                Err(error) => warn!(%market, %error, "liquidation sell failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Exposure accounting
    // ------------------------------------------------------------------

    /// Quote value currently committed to each market across every lifecycle state: buys at
    /// their funds or `size · price`, held positions at `size · current price`.
    fn market_exposures(&self) -> Series {
        let mut exposures: DecimalSeries = DecimalSeries::default();
        let mut add = |market: &MarketId, amount: Decimal| {
            *exposures.entry(market.clone()).or_insert(Decimal::ZERO) += amount;
        };

        for buy in &self.desired_limit_buys {
            add(&buy.market, buy.price * buy.size);
        }
        for buy in &self.desired_market_buys {
            add(&buy.market, buy.funds);
        }
        for buy in &self.pending_limit_buys {
            add(&buy.market, buy.price * buy.size);
        }
        for buy in &self.pending_market_buys {
            add(&buy.market, buy.funds);
        }
        for position in &self.active_positions {
            let price = self
                .prices
                .get(&position.market)
                .copied()
                .unwrap_or(position.price);
            add(&position.market, position.size * price);
        }
        for sell in &self.desired_limit_sells {
            add(&sell.market, sell.size * sell.price);
        }
        for sell in &self.desired_market_sells {
            let price = self
                .prices
                .get(&sell.market)
                .copied()
                .unwrap_or(sell.entry.price);
            add(&sell.market, sell.size * price);
        }
        for sell in &self.pending_limit_sells {
            add(&sell.market, sell.size * sell.price);
        }
        for sell in &self.pending_market_sells {
            let price = self
                .prices
                .get(&sell.market)
                .copied()
                .unwrap_or(sell.entry.price);
            add(&sell.market, sell.size * price);
        }

        exposures
            .into_iter()
            .filter_map(|(market, amount)| amount.to_f64().map(|amount| (market, amount)))
            .collect()
    }

    /// Quote balance plus the market value of every position state.
    fn assets_under_management(&self) -> f64 {
        let exposure_total: f64 = self.market_exposures().values().sum();
        self.available_funds.to_f64().unwrap_or(0.0) + exposure_total
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn counter(&self) -> &PositionCounter {
        &self.counter
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub fn desired_limit_buys(&self) -> &VecDeque<DesiredLimitBuy> {
        &self.desired_limit_buys
    }

    pub fn desired_market_buys(&self) -> &[DesiredMarketBuy] {
        &self.desired_market_buys
    }

    pub fn pending_limit_buys(&self) -> &[PendingLimitBuy] {
        &self.pending_limit_buys
    }

    pub fn pending_market_buys(&self) -> &[PendingMarketBuy] {
        &self.pending_market_buys
    }

    pub fn active_positions(&self) -> &[ActivePosition] {
        &self.active_positions
    }

    pub fn desired_limit_sells(&self) -> &[DesiredLimitSell] {
        &self.desired_limit_sells
    }

    pub fn desired_market_sells(&self) -> &[DesiredMarketSell] {
        &self.desired_market_sells
    }

    pub fn pending_limit_sells(&self) -> &[PendingLimitSell] {
        &self.pending_limit_sells
    }

    pub fn pending_market_sells(&self) -> &[PendingMarketSell] {
        &self.pending_market_sells
    }

    pub fn sells(&self) -> &[Sold] {
        &self.sells
    }
}
