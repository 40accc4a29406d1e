//! End-to-end tick scenarios against a mocked exchange and a scripted order tracker.

use chrono::{DateTime, TimeDelta, Utc};
use marlin::{
    config::{ManagerConfig, PortfolioConfig},
    engine::Command,
    indicator::{BidAsk, BidAskFrame, BidAskIndicator, CandleFrame, CandleSource, InstantIndicator, Series, StaleData},
    portfolio::{
        cool_down::CoolDown,
        manager::{ManagerLego, PortfolioManager},
        stop_loss::StopLoss,
    },
};
use marlin_execution::{
    account::Account,
    client::ExchangeApi,
    error::ClientError,
    fees::FeeSchedule,
    market::{MarketId, OrderType, Side},
    money::is_multiple_of,
    order::{
        ClientOrderId, DoneReason, MarketOrderAmount, NewLimitOrder, NewMarketOrder, OrderId,
        OrderRecord, OrderStatus,
    },
    product::{MarketInfo, MarketStatus},
    tracker::{OrderSnapshot, OrderTracker, OrderView, TrackerError},
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_str("2021-06-12T10:00:00Z").unwrap() + TimeDelta::seconds(seconds)
}

fn eth() -> MarketId {
    MarketId::new("ETH-USD")
}

fn eth_product() -> MarketInfo {
    MarketInfo {
        id: eth(),
        base_currency: "ETH".to_string(),
        quote_currency: "USD".to_string(),
        status: MarketStatus::Online,
        trading_disabled: false,
        cancel_only: false,
        post_only: false,
        limit_only: false,
        base_min_size: dec!(0.01),
        base_max_size: dec!(10000),
        base_increment: dec!(0.00000001),
        quote_increment: dec!(0.01),
        min_market_funds: dec!(5),
        max_market_funds: dec!(1000000),
    }
}

fn usd_account(available: Decimal) -> Account {
    Account {
        id: "usd-account".to_string(),
        currency: "USD".to_string(),
        balance: available,
        available,
        hold: Decimal::ZERO,
        trading_enabled: true,
    }
}

// ----------------------------------------------------------------------
// Mock exchange
// ----------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Placed {
    Limit(NewLimitOrder),
    Market(NewMarketOrder),
}

impl Placed {
    fn market(&self) -> &MarketId {
        match self {
            Placed::Limit(order) => &order.market,
            Placed::Market(order) => &order.market,
        }
    }

    fn side(&self) -> Side {
        match self {
            Placed::Limit(order) => order.side,
            Placed::Market(order) => order.side,
        }
    }
}

#[derive(Default)]
struct MockState {
    products: Vec<MarketInfo>,
    accounts: Vec<Account>,
    fees: FeeSchedule,
    server_time: DateTime<Utc>,
    placed: Vec<Placed>,
    place_errors: VecDeque<ClientError>,
    cancels: Vec<OrderId>,
    next_order_number: u64,
}

#[derive(Clone)]
struct MockExchange {
    state: Arc<Mutex<MockState>>,
}

impl MockExchange {
    fn record_placement(&self, placed: Placed) -> Result<OrderRecord, ClientError> {
        let mut state = self.state.lock();
        state.placed.push(placed.clone());
        if let Some(error) = state.place_errors.pop_front() {
            return Err(error);
        }
        state.next_order_number += 1;
        let id = OrderId::new(format!("order-{}", state.next_order_number));
        let (order_type, price, size, funds) = match &placed {
            Placed::Limit(order) => (
                OrderType::Limit,
                Some(order.price),
                Some(order.size),
                None,
            ),
            Placed::Market(order) => match order.amount {
                MarketOrderAmount::Size(size) => (OrderType::Market, None, Some(size), None),
                MarketOrderAmount::Funds(funds) => (OrderType::Market, None, None, Some(funds)),
            },
        };
        Ok(OrderRecord {
            id,
            client_oid: Some(ClientOrderId::random()),
            product_id: placed.market().clone(),
            side: placed.side(),
            order_type,
            price,
            size,
            funds,
            status: OrderStatus::Pending,
            created_at: state.server_time,
            done_at: None,
            done_reason: None,
            executed_value: Decimal::ZERO,
            filled_size: Decimal::ZERO,
            fill_fees: Decimal::ZERO,
            settled: false,
        })
    }
}

impl ExchangeApi for MockExchange {
    async fn get_products(&self) -> Result<Vec<MarketInfo>, ClientError> {
        Ok(self.state.lock().products.clone())
    }

    async fn get_accounts(&self) -> Result<Vec<Account>, ClientError> {
        Ok(self.state.lock().accounts.clone())
    }

    async fn get_account(&self, account_id: &str) -> Result<Account, ClientError> {
        self.state
            .lock()
            .accounts
            .iter()
            .find(|account| account.id == account_id)
            .cloned()
            .ok_or(ClientError::Api(marlin_execution::error::ApiError::NotFound))
    }

    async fn get_fees(&self) -> Result<FeeSchedule, ClientError> {
        Ok(self.state.lock().fees.clone())
    }

    async fn place_limit_order(&self, order: NewLimitOrder) -> Result<OrderRecord, ClientError> {
        self.record_placement(Placed::Limit(order))
    }

    async fn place_market_order(&self, order: NewMarketOrder) -> Result<OrderRecord, ClientError> {
        self.record_placement(Placed::Market(order))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<OrderId, ClientError> {
        self.state.lock().cancels.push(order_id.clone());
        Ok(order_id.clone())
    }

    async fn cancel_all(&self) -> Result<Vec<OrderId>, ClientError> {
        Ok(Vec::new())
    }

    async fn get_order(&self, _order_id: &OrderId) -> Result<OrderRecord, ClientError> {
        Err(ClientError::Api(marlin_execution::error::ApiError::NotFound))
    }

    async fn get_order_by_client_oid(
        &self,
        _client_oid: &ClientOrderId,
    ) -> Result<OrderRecord, ClientError> {
        Err(ClientError::Api(marlin_execution::error::ApiError::NotFound))
    }

    async fn get_server_time(&self) -> Result<DateTime<Utc>, ClientError> {
        Ok(self.state.lock().server_time)
    }
}

// ----------------------------------------------------------------------
// Scripted tracker
// ----------------------------------------------------------------------

#[derive(Default)]
struct ScriptState {
    queued: VecDeque<(DateTime<Utc>, OrderSnapshot)>,
    current: (DateTime<Utc>, OrderSnapshot),
    remembered: Vec<OrderId>,
    forgotten: Vec<OrderId>,
}

#[derive(Clone)]
struct ScriptTracker {
    state: Arc<Mutex<ScriptState>>,
}

impl OrderTracker for ScriptTracker {
    fn remember(&mut self, order_id: OrderId) {
        self.state.lock().remembered.push(order_id);
    }

    fn forget(&mut self, order_id: &OrderId) {
        self.state.lock().forgotten.push(order_id.clone());
    }

    fn snapshot(&mut self) -> Result<OrderSnapshot, TrackerError> {
        self.barrier_snapshot().map(|(_, snapshot)| snapshot)
    }

    fn barrier_snapshot(&mut self) -> Result<(DateTime<Utc>, OrderSnapshot), TrackerError> {
        let mut state = self.state.lock();
        if let Some(next) = state.queued.pop_front() {
            state.current = next;
        }
        Ok(state.current.clone())
    }

    fn stop(&self) {}
}

fn order_view(
    id: &str,
    status: OrderStatus,
    size: Decimal,
    price: Decimal,
    filled_size: Decimal,
    executed_value: Decimal,
    fill_fees: Decimal,
) -> OrderView {
    OrderView {
        id: OrderId::new(id),
        status,
        size,
        price,
        executed_value,
        filled_size,
        fill_fees,
        done_reason: if status == OrderStatus::Done {
            Some(DoneReason::Filled)
        } else {
            None
        },
    }
}

// ----------------------------------------------------------------------
// Stub indicators
// ----------------------------------------------------------------------

struct EmptyCandles;

impl CandleSource for EmptyCandles {
    fn compute(&mut self) -> Result<CandleFrame, StaleData> {
        Ok(CandleFrame::new())
    }
}

#[derive(Clone)]
struct SharedSeries(Arc<Mutex<Series>>);

impl InstantIndicator for SharedSeries {
    fn compute(&mut self, _candles: &CandleFrame) -> Series {
        self.0.lock().clone()
    }
}

#[derive(Clone)]
struct SharedBidAsk(Arc<Mutex<BidAskFrame>>);

impl BidAskIndicator for SharedBidAsk {
    fn compute(&mut self) -> Result<BidAskFrame, StaleData> {
        Ok(self.0.lock().clone())
    }
}

fn series(entries: &[(&str, f64)]) -> Series {
    entries
        .iter()
        .map(|(market, value)| (MarketId::new(*market), *value))
        .collect()
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    manager: PortfolioManager<MockExchange, ScriptTracker>,
    exchange: Arc<Mutex<MockState>>,
    tracker: Arc<Mutex<ScriptState>>,
    buy_weights: Arc<Mutex<Series>>,
    sell_weights: Arc<Mutex<Series>>,
    prices: Arc<Mutex<Series>>,
    bid_ask: Arc<Mutex<BidAskFrame>>,
    _command_tx: mpsc::Sender<Command>,
}

impl Harness {
    fn new(
        portfolio: PortfolioConfig,
        manager: ManagerConfig,
        available: Decimal,
        price: f64,
    ) -> Self {
        let exchange = Arc::new(Mutex::new(MockState {
            products: vec![eth_product()],
            accounts: vec![usd_account(available)],
            fees: FeeSchedule::default(),
            server_time: at(0),
            ..MockState::default()
        }));
        let tracker = Arc::new(Mutex::new(ScriptState {
            current: (at(0), OrderSnapshot::default()),
            ..ScriptState::default()
        }));
        let buy_weights = Arc::new(Mutex::new(Series::default()));
        let sell_weights = Arc::new(Mutex::new(Series::default()));
        let prices = Arc::new(Mutex::new(series(&[("ETH-USD", price)])));
        let volumes = Arc::new(Mutex::new(series(&[("ETH-USD", 1_000_000.0)])));
        let bid_ask = Arc::new(Mutex::new(
            [(eth(), BidAsk { bid: price, ask: price })]
                .into_iter()
                .collect::<BidAskFrame>(),
        ));

        let (command_tx, command_rx) = mpsc::channel(4);
        let cool_down = CoolDown::new(portfolio.buy_cool_down(), portfolio.sell_cool_down());
        let stop_loss = StopLoss::new(portfolio.stop_loss_ratio, portfolio.take_profit_ratio);

        let lego = ManagerLego {
            client: MockExchange {
                state: Arc::clone(&exchange),
            },
            tracker: ScriptTracker {
                state: Arc::clone(&tracker),
            },
            candle_source: Box::new(EmptyCandles),
            buy_indicator: Box::new(SharedSeries(Arc::clone(&buy_weights))),
            sell_indicator: Box::new(SharedSeries(Arc::clone(&sell_weights))),
            price_indicator: Box::new(SharedSeries(Arc::clone(&prices))),
            volume_indicator: Box::new(SharedSeries(Arc::clone(&volumes))),
            bid_ask_indicator: Box::new(SharedBidAsk(Arc::clone(&bid_ask))),
            stop_loss,
            cool_down,
            command_rx,
            portfolio,
            manager,
        };

        Self {
            manager: PortfolioManager::new(lego),
            exchange,
            tracker,
            buy_weights,
            sell_weights,
            prices,
            bid_ask,
            _command_tx: command_tx,
        }
    }

    fn set_server_time(&self, time: DateTime<Utc>) {
        self.exchange.lock().server_time = time;
    }

    fn push_snapshot(&self, time: DateTime<Utc>, orders: &[OrderView]) {
        let snapshot: OrderSnapshot = orders
            .iter()
            .map(|order| (order.id.clone(), order.clone()))
            .collect();
        self.tracker.lock().queued.push_back((time, snapshot));
    }

    fn set_buy_weight(&self, weight: f64) {
        *self.buy_weights.lock() = if weight > 0.0 {
            series(&[("ETH-USD", weight)])
        } else {
            Series::default()
        };
    }

    fn set_sell_weight(&self, weight: f64) {
        *self.sell_weights.lock() = if weight > 0.0 {
            series(&[("ETH-USD", weight)])
        } else {
            Series::default()
        };
    }

    fn set_quote(&self, price: f64) {
        *self.prices.lock() = series(&[("ETH-USD", price)]);
        *self.bid_ask.lock() = [(eth(), BidAsk { bid: price, ask: price })]
            .into_iter()
            .collect();
    }

    fn queue_place_error(&self, error: ClientError) {
        self.exchange.lock().place_errors.push_back(error);
    }

    fn placements(&self) -> Vec<Placed> {
        self.exchange.lock().placed.clone()
    }

    fn cancels(&self) -> Vec<OrderId> {
        self.exchange.lock().cancels.clone()
    }

    fn assert_placements_quantized(&self) {
        let info = eth_product();
        for placed in self.placements() {
            match placed {
                Placed::Limit(order) => {
                    assert!(
                        is_multiple_of(order.price, info.quote_increment),
                        "price {} not a multiple of {}",
                        order.price,
                        info.quote_increment
                    );
                    assert!(
                        is_multiple_of(order.size, info.base_increment),
                        "size {} not a multiple of {}",
                        order.size,
                        info.base_increment
                    );
                }
                Placed::Market(order) => match order.amount {
                    MarketOrderAmount::Size(size) => {
                        assert!(is_multiple_of(size, info.base_increment));
                    }
                    MarketOrderAmount::Funds(funds) => {
                        assert!(is_multiple_of(funds, info.quote_increment));
                    }
                },
            }
        }
    }

    fn assert_all_states_rooted(&self) {
        let lineage = self.manager.lineage();
        for buy in self.manager.desired_limit_buys() {
            assert!(lineage.is_rooted(buy.id));
        }
        for buy in self.manager.pending_limit_buys() {
            assert!(lineage.is_rooted(buy.id));
        }
        for buy in self.manager.pending_market_buys() {
            assert!(lineage.is_rooted(buy.id));
        }
        for position in self.manager.active_positions() {
            assert!(lineage.is_rooted(position.id));
        }
        for sell in self.manager.desired_limit_sells() {
            assert!(lineage.is_rooted(sell.id));
        }
        for sell in self.manager.desired_market_sells() {
            assert!(lineage.is_rooted(sell.id));
        }
        for sell in self.manager.pending_limit_sells() {
            assert!(lineage.is_rooted(sell.id));
        }
        for sell in self.manager.pending_market_sells() {
            assert!(lineage.is_rooted(sell.id));
        }
        for sold in self.manager.sells() {
            assert!(lineage.is_rooted(sold.id));
        }
    }
}

fn wide_open_portfolio() -> PortfolioConfig {
    PortfolioConfig {
        concentration_limit: 1.0,
        pov_limit: 1.0,
        min_position_size: dec!(1),
        ..PortfolioConfig::default()
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// S1: a full happy-path buy. One desired limit buy is derived from the weights, placed, and
/// becomes an active position once the order mirror reports the fill.
#[tokio::test]
async fn test_happy_buy_path() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        1000.0,
    );
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));

    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.pending_limit_buys().len(), 1);
    let pending = &harness.manager.pending_limit_buys()[0];
    assert_eq!(pending.price, dec!(1000));
    assert_eq!(pending.size, dec!(0.1));
    assert_eq!(harness.manager.counter().count(), 1);

    let placements = harness.placements();
    assert_eq!(placements.len(), 1);
    match &placements[0] {
        Placed::Limit(order) => {
            assert_eq!(order.side, Side::Buy);
            assert_eq!(order.price, dec!(1000));
            assert_eq!(order.size, dec!(0.1));
        }
        other => panic!("expected a limit buy, got {other:?}"),
    }
    assert_eq!(
        harness.tracker.lock().remembered,
        vec![OrderId::new("order-1")]
    );

    // the mirror reports received -> open -> match -> done; next tick reconciles the fill
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    harness.push_snapshot(
        at(20),
        &[order_view(
            "order-1",
            OrderStatus::Done,
            dec!(0.1),
            dec!(1000),
            dec!(0.1),
            dec!(100),
            dec!(0.25),
        )],
    );

    assert!(harness.manager.tick().await.unwrap());

    assert!(harness.manager.pending_limit_buys().is_empty());
    assert_eq!(harness.manager.active_positions().len(), 1);
    let active = &harness.manager.active_positions()[0];
    assert_eq!(active.price, dec!(1000));
    assert_eq!(active.size, dec!(0.1));
    assert_eq!(active.fees, dec!(0.25));
    assert_eq!(harness.manager.counter().count(), 1);
    assert!(
        harness
            .tracker
            .lock()
            .forgotten
            .contains(&OrderId::new("order-1"))
    );

    harness.assert_placements_quantized();
    harness.assert_all_states_rooted();
}

/// S2: a resting buy older than the age limit is cancelled; once the mirror confirms `done`
/// with no fill the position is dropped and the counter nets to zero.
#[tokio::test]
async fn test_age_limit_cancel() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        1000.0,
    );
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.pending_limit_buys().len(), 1);

    // 90 seconds later the order is still open: past the 60 second age limit
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(100));
    harness.push_snapshot(
        at(95),
        &[order_view(
            "order-1",
            OrderStatus::Open,
            dec!(0.1),
            dec!(1000),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        )],
    );
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.cancels(), vec![OrderId::new("order-1")]);
    assert_eq!(
        harness.manager.pending_limit_buys().len(),
        1,
        "cancel is best-effort; the pending entry stays until done is observed"
    );

    // the mirror confirms the cancel with no fill
    harness.set_server_time(at(130));
    harness.push_snapshot(
        at(125),
        &[order_view(
            "order-1",
            OrderStatus::Done,
            dec!(0.1),
            dec!(1000),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        )],
    );
    assert!(harness.manager.tick().await.unwrap());

    assert!(harness.manager.pending_limit_buys().is_empty());
    assert!(harness.manager.active_positions().is_empty());
    assert_eq!(harness.manager.counter().count(), 0);
    assert_eq!(harness.manager.counter().added(), 1);
    assert_eq!(harness.manager.counter().dropped(), 1);
}

/// S3: a pending limit sell that comes back `done` with a partial fill forks into a Sold for
/// the filled portion and a DesiredMarketSell for the remainder.
#[tokio::test]
async fn test_partial_fill_on_cancelled_sell() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(1000),
        1000.0,
    );

    // establish an active position of size 1.0
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    harness.push_snapshot(
        at(20),
        &[order_view(
            "order-1",
            OrderStatus::Done,
            dec!(1),
            dec!(1000),
            dec!(1),
            dec!(1000),
            Decimal::ZERO,
        )],
    );
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.active_positions().len(), 1);
    let open_before = harness.manager.counter().count();

    // full-liquidation sell weight turns it into a pending limit sell
    harness.set_sell_weight(1.0);
    harness.set_server_time(at(70));
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.pending_limit_sells().len(), 1);
    assert_eq!(harness.manager.pending_limit_sells()[0].size, dec!(1));

    // the sell is cancelled externally after filling 0.4 of 1.0; the market-sell retry for
    // the remainder fails transport so the desired state stays observable
    harness.set_sell_weight(0.0);
    harness.set_server_time(at(100));
    harness.push_snapshot(
        at(90),
        &[order_view(
            "order-2",
            OrderStatus::Done,
            dec!(1),
            dec!(1000),
            dec!(0.4),
            dec!(400),
            dec!(0.4),
        )],
    );
    harness.queue_place_error(ClientError::Transport("connection reset".to_string()));
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.sells().len(), 1);
    assert_eq!(harness.manager.sells()[0].size, dec!(0.4));
    assert_eq!(harness.manager.sells()[0].price, dec!(1000));
    assert_eq!(harness.manager.desired_market_sells().len(), 1);
    assert_eq!(harness.manager.desired_market_sells()[0].size, dec!(0.6));
    harness.assert_all_states_rooted();

    // next tick reaps the Sold and places the remainder: open count is unchanged
    harness.set_server_time(at(130));
    assert!(harness.manager.tick().await.unwrap());
    assert!(harness.manager.sells().is_empty());
    assert_eq!(harness.manager.pending_market_sells().len(), 1);
    assert_eq!(harness.manager.pending_market_sells()[0].size, dec!(0.6));
    assert_eq!(harness.manager.counter().count(), open_before);
}

/// S4: a falling ask triggers the stop-loss: the full position becomes a stop-sale desired
/// sell, the market registers a sell cool-down, and no buy is placed while it cools.
#[tokio::test]
async fn test_stop_loss_trigger() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        100.0,
    );

    // establish an active position at entry price 100
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    harness.push_snapshot(
        at(20),
        &[order_view(
            "order-1",
            OrderStatus::Done,
            dec!(1),
            dec!(100),
            dec!(1),
            dec!(100),
            Decimal::ZERO,
        )],
    );
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.active_positions().len(), 1);

    // ask drops to 98: 98/100 <= 0.99 triggers; placement fails so the desired sell stays
    harness.set_quote(98.0);
    harness.set_server_time(at(70));
    harness.queue_place_error(ClientError::Transport("connection reset".to_string()));
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.desired_limit_sells().len(), 1);
    let sell = &harness.manager.desired_limit_sells()[0];
    assert!(sell.stop_sale);
    assert_eq!(sell.size, dec!(1), "stop sale liquidates the full position");
    assert!(harness.manager.active_positions().is_empty());

    // the market is cooling down: a full buy weight must not produce any buy order
    let placements_before = harness.placements().len();
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(100));
    assert!(harness.manager.tick().await.unwrap());

    let new_buys = harness
        .placements()
        .iter()
        .skip(placements_before)
        .filter(|placed| placed.side() == Side::Buy)
        .count();
    assert_eq!(new_buys, 0, "cooling-down market must not be bought");
    assert_eq!(harness.manager.pending_limit_sells().len(), 1);
}

/// S5: startup reconciliation downloads held balances as active positions, and the
/// concentration limit then caps any additional exposure in that market.
#[tokio::test]
async fn test_startup_download_and_concentration_cap() {
    let portfolio = PortfolioConfig {
        concentration_limit: 0.4,
        pov_limit: 1.0,
        min_position_size: dec!(1),
        ..PortfolioConfig::default()
    };
    let manager_config = ManagerConfig {
        settle_secs: 0,
        ..ManagerConfig::default()
    };
    let mut harness = Harness::new(portfolio, manager_config, dec!(310), 1000.0);
    // keep the exchange minimum well below the expected order size so float jitter in the
    // cap arithmetic cannot push the order under it
    harness.exchange.lock().products[0].base_min_size = dec!(0.001);
    harness.exchange.lock().accounts.push(Account {
        id: "eth-account".to_string(),
        currency: "ETH".to_string(),
        balance: dec!(0.19),
        available: dec!(0.19),
        hold: Decimal::ZERO,
        trading_enabled: true,
    });

    harness.set_server_time(at(0));
    harness.manager.reconcile_startup().await.unwrap();

    assert_eq!(harness.manager.active_positions().len(), 1);
    let downloaded = &harness.manager.active_positions()[0];
    assert_eq!(downloaded.size, dec!(0.19));
    assert_eq!(downloaded.price, dec!(1000));
    assert_eq!(downloaded.fees, Decimal::ZERO);
    assert_eq!(harness.manager.counter().count(), 1);

    // AUM = 310 + 190 = 500; cap = 0.4 * 500 = 200; existing exposure 190 leaves 10
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(30));
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.pending_limit_buys().len(), 1);
    let buy = &harness.manager.pending_limit_buys()[0];
    let additional = buy.size * buy.price;
    assert!(
        additional <= dec!(10.01),
        "additional exposure {additional} must respect the concentration cap"
    );
    assert!(additional >= dec!(9.9));
    harness.assert_placements_quantized();
}

/// A buy placement rejected with a well-known message is retried next tick rather than
/// dropped, and the counter stays balanced throughout.
#[tokio::test]
async fn test_well_known_rejection_retries_next_tick() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        1000.0,
    );
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    harness.queue_place_error(ClientError::Api(
        marlin_execution::error::ApiError::Rejected("Post only mode".to_string()),
    ));
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.desired_limit_buys().len(), 1);
    assert!(harness.manager.pending_limit_buys().is_empty());
    assert_eq!(harness.manager.counter().count(), 1);

    // next tick the market accepts the order
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.pending_limit_buys().len(), 1);
    assert_eq!(harness.manager.counter().count(), 1);
}

/// A pending buy that disappears from the mirror was cancelled externally with no fill: the
/// position is dropped without touching the exchange again.
#[tokio::test]
async fn test_externally_cancelled_buy_is_dropped() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        1000.0,
    );
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());
    assert_eq!(harness.manager.counter().count(), 1);

    // a snapshot well past the wait window with no trace of the order
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    harness.push_snapshot(at(30), &[]);
    assert!(harness.manager.tick().await.unwrap());

    assert!(harness.manager.pending_limit_buys().is_empty());
    assert_eq!(harness.manager.counter().count(), 0);
    assert!(
        harness
            .tracker
            .lock()
            .forgotten
            .contains(&OrderId::new("order-1"))
    );
}

/// A non-advancing server clock backs the tick off without touching any state.
#[tokio::test]
async fn test_non_advancing_clock_backs_off() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(100),
        1000.0,
    );
    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());

    // same server time again: the tick must refuse to run
    assert!(!harness.manager.tick().await.unwrap());
    assert_eq!(harness.placements().len(), 1, "no new orders on a skipped tick");
}

/// Partial sells leave a drawdown clone behind and the books stay balanced across many mixed
/// ticks (counter monotonicity).
#[tokio::test]
async fn test_partial_sell_leaves_drawdown_clone() {
    let mut harness = Harness::new(
        wide_open_portfolio(),
        ManagerConfig::default(),
        dec!(1000),
        1000.0,
    );

    harness.set_buy_weight(1.0);
    harness.set_server_time(at(10));
    assert!(harness.manager.tick().await.unwrap());
    harness.set_buy_weight(0.0);
    harness.set_server_time(at(40));
    harness.push_snapshot(
        at(20),
        &[order_view(
            "order-1",
            OrderStatus::Done,
            dec!(1),
            dec!(1000),
            dec!(1),
            dec!(1000),
            Decimal::ZERO,
        )],
    );
    assert!(harness.manager.tick().await.unwrap());

    // sell half: the remainder stays active as a drawdown clone
    harness.set_sell_weight(0.5);
    harness.set_server_time(at(70));
    assert!(harness.manager.tick().await.unwrap());

    assert_eq!(harness.manager.pending_limit_sells().len(), 1);
    assert_eq!(harness.manager.pending_limit_sells()[0].size, dec!(0.5));
    assert_eq!(harness.manager.active_positions().len(), 1);
    assert_eq!(harness.manager.active_positions()[0].size, dec!(0.5));
    assert_eq!(
        harness.manager.active_positions()[0].price,
        dec!(1000),
        "drawdown clone keeps the entry price"
    );

    let counter = harness.manager.counter();
    assert!(counter.added() >= counter.dropped());
    assert_eq!(
        counter.count() as usize,
        harness.manager.active_positions().len() + harness.manager.pending_limit_sells().len()
    );
    harness.assert_all_states_rooted();
    harness.assert_placements_quantized();
}
