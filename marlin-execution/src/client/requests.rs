use crate::{
    account::Account,
    fees::FeeSchedule,
    market::{MarketId, OrderType, SelfTradePrevention, Side, TimeInForce},
    order::{ClientOrderId, OrderId, OrderRecord},
    product::MarketInfo,
};
use chrono::{DateTime, Utc};
use derive_more::Constructor;
use marlin_integration::protocol::http::rest::RestRequest;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as, skip_serializing_none};
use std::borrow::Cow;

/// `GET /products` — the exchange product catalog.
#[derive(Debug, Copy, Clone)]
pub struct GetProducts;

impl RestRequest for GetProducts {
    type Response = Vec<MarketInfo>;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        "/products".into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `GET /accounts` — all balances of the authenticated profile.
#[derive(Debug, Copy, Clone)]
pub struct GetAccounts;

impl RestRequest for GetAccounts {
    type Response = Vec<Account>;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        "/accounts".into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `GET /accounts/{id}` — a single account balance.
#[derive(Debug, Clone, Constructor)]
pub struct GetAccount {
    pub account_id: String,
}

impl RestRequest for GetAccount {
    type Response = Account;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        format!("/accounts/{}", self.account_id).into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `GET /fees` — maker/taker rates of the authenticated profile.
#[derive(Debug, Copy, Clone)]
pub struct GetFees;

impl RestRequest for GetFees {
    type Response = FeeSchedule;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        "/fees".into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `POST /orders` — place a limit or market order.
#[derive(Debug, Clone, Constructor)]
pub struct PlaceOrder(pub PlaceOrderBody);

impl RestRequest for PlaceOrder {
    type Response = OrderRecord;
    type QueryParams = ();
    type Body = PlaceOrderBody;

    fn path(&self) -> Cow<'static, str> {
        "/orders".into()
    }

    fn method() -> Method {
        Method::POST
    }

    fn body(&self) -> Option<&Self::Body> {
        Some(&self.0)
    }
}

#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderBody {
    pub product_id: MarketId,

    pub side: Side,

    #[serde(rename = "type")]
    pub order_type: OrderType,

    pub client_oid: ClientOrderId,

    #[serde_as(as = "Option<DisplayFromStr>")]
    pub price: Option<Decimal>,

    #[serde_as(as = "Option<DisplayFromStr>")]
    pub size: Option<Decimal>,

    #[serde_as(as = "Option<DisplayFromStr>")]
    pub funds: Option<Decimal>,

    pub time_in_force: Option<TimeInForce>,

    pub post_only: Option<bool>,

    pub stp: Option<SelfTradePrevention>,
}

/// `DELETE /orders/{id}` — cancel a single order.
#[derive(Debug, Clone, Constructor)]
pub struct CancelOrder {
    pub order_id: OrderId,
}

impl RestRequest for CancelOrder {
    type Response = OrderId;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        format!("/orders/{}", self.order_id).into()
    }

    fn method() -> Method {
        Method::DELETE
    }
}

/// `DELETE /orders` — cancel every open order of the profile.
#[derive(Debug, Copy, Clone)]
pub struct CancelAllOrders;

impl RestRequest for CancelAllOrders {
    type Response = Vec<OrderId>;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        "/orders".into()
    }

    fn method() -> Method {
        Method::DELETE
    }
}

/// `GET /orders/{id}` — a single order by exchange id.
#[derive(Debug, Clone, Constructor)]
pub struct GetOrder {
    pub order_id: OrderId,
}

impl RestRequest for GetOrder {
    type Response = OrderRecord;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        format!("/orders/{}", self.order_id).into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `GET /orders/client:{client_oid}` — a single order by client-supplied id.
///
/// This lookup is the idempotency primitive for retried placements.
#[derive(Debug, Clone, Constructor)]
pub struct GetOrderByClientOid {
    pub client_oid: ClientOrderId,
}

impl RestRequest for GetOrderByClientOid {
    type Response = OrderRecord;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        format!("/orders/client:{}", self.client_oid).into()
    }

    fn method() -> Method {
        Method::GET
    }
}

/// `GET /time` — the exchange server time anchoring each tick.
#[derive(Debug, Copy, Clone)]
pub struct GetServerTime;

impl RestRequest for GetServerTime {
    type Response = ServerTime;
    type QueryParams = ();
    type Body = ();

    fn path(&self) -> Cow<'static, str> {
        "/time".into()
    }

    fn method() -> Method {
        Method::GET
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
pub struct ServerTime {
    pub iso: DateTime<Utc>,
}
