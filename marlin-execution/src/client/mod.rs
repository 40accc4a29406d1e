use crate::{
    ApiCredentials,
    account::Account,
    error::{ApiError, ClientError},
    fees::FeeSchedule,
    market::OrderType,
    order::{
        ClientOrderId, MarketOrderAmount, NewLimitOrder, NewMarketOrder, OrderId, OrderRecord,
    },
    product::MarketInfo,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use marlin_integration::{
    protocol::http::rest::client::RestClient,
    rate_limit::RateLimiter,
};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use self::{
    parser::ExchangeParser,
    requests::{
        CancelAllOrders, CancelOrder, GetAccount, GetAccounts, GetFees, GetOrder,
        GetOrderByClientOid, GetProducts, GetServerTime, PlaceOrder, PlaceOrderBody,
    },
    signer::{ExchangeRequestSigner, ExchangeSigner, decode_secret},
};

/// Typed [`RestRequest`](marlin_integration::protocol::http::rest::RestRequest)s for every
/// consumed endpoint.
pub mod requests;

/// `CB-ACCESS-*` HMAC request signing.
pub mod signer;

/// Response parsing and API error classification.
pub mod parser;

/// Public (unauthenticated) endpoint quota.
const PUBLIC_REQUESTS_PER_SECOND: usize = 10;

/// Authenticated endpoint quota.
const PRIVATE_REQUESTS_PER_SECOND: usize = 15;

/// Attempts for order placements, resolved between attempts via client-oid lookup.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Attempts for reads and cancellations, which are idempotent and retried unconditionally.
const MAX_READ_ATTEMPTS: usize = 5;

/// Backoff between read retries.
const READ_RETRY_BACKOFF: Duration = Duration::from_secs(15);

/// Backoff before resolving an ambiguous placement via client-oid lookup.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Full method set of the exchange REST façade.
///
/// The portfolio manager is generic over this contract so scenario tests can substitute a mock
/// venue.
#[allow(async_fn_in_trait)]
pub trait ExchangeApi {
    async fn get_products(&self) -> Result<Vec<MarketInfo>, ClientError>;
    async fn get_accounts(&self) -> Result<Vec<Account>, ClientError>;
    async fn get_account(&self, account_id: &str) -> Result<Account, ClientError>;
    async fn get_fees(&self) -> Result<FeeSchedule, ClientError>;
    async fn place_limit_order(&self, order: NewLimitOrder) -> Result<OrderRecord, ClientError>;
    async fn place_market_order(&self, order: NewMarketOrder) -> Result<OrderRecord, ClientError>;
    async fn cancel_order(&self, order_id: &OrderId) -> Result<OrderId, ClientError>;
    async fn cancel_all(&self) -> Result<Vec<OrderId>, ClientError>;
    async fn get_order(&self, order_id: &OrderId) -> Result<OrderRecord, ClientError>;
    async fn get_order_by_client_oid(
        &self,
        client_oid: &ClientOrderId,
    ) -> Result<OrderRecord, ClientError>;
    async fn get_server_time(&self) -> Result<DateTime<Utc>, ClientError>;
}

/// Rate-limited, retry-safe REST client for the exchange.
///
/// Writes attach a fresh [`ClientOrderId`] and recover ambiguous outcomes by looking the order
/// up by that id, so a retried placement can never double-place.
pub struct ExchangeClient {
    rest_client: RestClient<'static, ExchangeRequestSigner, ExchangeParser>,
    public_bucket: RateLimiter,
    private_bucket: RateLimiter,
}

impl ExchangeClient {
    /// Construct a new [`ExchangeClient`] for the provided API base url & credentials.
    pub fn new(base_url: String, credentials: &ApiCredentials) -> Result<Self, ClientError> {
        let secret = decode_secret(&credentials.secret)
            .map_err(|error| ClientError::Credentials(error.to_string()))?;
        let hmac = Hmac::<Sha256>::new_from_slice(&secret)
            .map_err(|error| ClientError::Credentials(error.to_string()))?;

        Ok(Self {
            rest_client: RestClient::new(
                base_url,
                ExchangeRequestSigner::new(
                    ExchangeSigner::new(credentials.key.clone(), credentials.passphrase.clone()),
                    hmac,
                    marlin_integration::protocol::http::private::encoder::Base64Encoder,
                ),
                ExchangeParser,
            ),
            public_bucket: RateLimiter::new(PUBLIC_REQUESTS_PER_SECOND, Duration::from_secs(1)),
            private_bucket: RateLimiter::new(PRIVATE_REQUESTS_PER_SECOND, Duration::from_secs(1)),
        })
    }

    async fn place_order(&self, body: PlaceOrderBody) -> Result<OrderRecord, ClientError> {
        let attempt = RestPlaceAttempt { client: self, body };
        place_idempotently(&attempt, MAX_WRITE_ATTEMPTS, WRITE_RETRY_BACKOFF).await
    }

    /// Execute an idempotent (read or cancel) request on the private bucket, retrying transport
    /// and 5xx failures with backoff.
    async fn execute_idempotent<Request>(
        &self,
        request: Request,
        bucket: &RateLimiter,
    ) -> Result<Request::Response, ClientError>
    where
        Request: marlin_integration::protocol::http::rest::RestRequest + Clone,
    {
        let mut last_error = None;
        for attempt in 0..MAX_READ_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(READ_RETRY_BACKOFF).await;
            }
            bucket.acquire().await;
            match self.rest_client.execute(request.clone()).await {
                Ok((response, _)) => {
                    bucket.reset_backoff().await;
                    return Ok(response);
                }
                Err(ClientError::Api(ApiError::RateLimit)) => {
                    bucket.report_violation().await;
                    last_error = Some(ClientError::Api(ApiError::RateLimit));
                }
                Err(error) if error.is_retryable() => {
                    warn!(%error, attempt, "retrying idempotent request");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::Transport("retries exhausted".to_string())))
    }
}

impl ExchangeApi for ExchangeClient {
    async fn get_products(&self) -> Result<Vec<MarketInfo>, ClientError> {
        let products = self
            .execute_idempotent(GetProducts, &self.public_bucket)
            .await?;

        // Malformed trading rules never reach the order path
        Ok(products
            .into_iter()
            .filter(|product| {
                if product.is_well_formed() {
                    true
                } else {
                    warn!(market = %product.id, "dropping product with malformed trading rules");
                    false
                }
            })
            .collect())
    }

    async fn get_accounts(&self) -> Result<Vec<Account>, ClientError> {
        self.execute_idempotent(GetAccounts, &self.private_bucket)
            .await
    }

    async fn get_account(&self, account_id: &str) -> Result<Account, ClientError> {
        self.execute_idempotent(GetAccount::new(account_id.to_string()), &self.private_bucket)
            .await
    }

    async fn get_fees(&self) -> Result<FeeSchedule, ClientError> {
        self.execute_idempotent(GetFees, &self.private_bucket).await
    }

    async fn place_limit_order(&self, order: NewLimitOrder) -> Result<OrderRecord, ClientError> {
        self.place_order(PlaceOrderBody {
            product_id: order.market,
            side: order.side,
            order_type: OrderType::Limit,
            client_oid: ClientOrderId::random(),
            price: Some(order.price),
            size: Some(order.size),
            funds: None,
            time_in_force: Some(order.time_in_force),
            post_only: Some(order.post_only),
            stp: Some(order.stp),
        })
        .await
    }

    async fn place_market_order(&self, order: NewMarketOrder) -> Result<OrderRecord, ClientError> {
        let (size, funds) = match order.amount {
            MarketOrderAmount::Size(size) => (Some(size), None),
            MarketOrderAmount::Funds(funds) => (None, Some(funds)),
        };
        self.place_order(PlaceOrderBody {
            product_id: order.market,
            side: order.side,
            order_type: OrderType::Market,
            client_oid: ClientOrderId::random(),
            price: None,
            size,
            funds,
            time_in_force: None,
            post_only: None,
            stp: Some(order.stp),
        })
        .await
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<OrderId, ClientError> {
        self.execute_idempotent(CancelOrder::new(order_id.clone()), &self.private_bucket)
            .await
    }

    async fn cancel_all(&self) -> Result<Vec<OrderId>, ClientError> {
        self.execute_idempotent(CancelAllOrders, &self.private_bucket)
            .await
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<OrderRecord, ClientError> {
        self.execute_idempotent(GetOrder::new(order_id.clone()), &self.private_bucket)
            .await
    }

    async fn get_order_by_client_oid(
        &self,
        client_oid: &ClientOrderId,
    ) -> Result<OrderRecord, ClientError> {
        self.execute_idempotent(
            GetOrderByClientOid::new(client_oid.clone()),
            &self.private_bucket,
        )
        .await
    }

    async fn get_server_time(&self) -> Result<DateTime<Utc>, ClientError> {
        self.execute_idempotent(GetServerTime, &self.public_bucket)
            .await
            .map(|time| time.iso)
    }
}

/// One placement attempt: how to send the order, and how to resolve it by client-oid if the
/// outcome of a send is unknown.
#[allow(async_fn_in_trait)]
pub(crate) trait PlaceAttempt {
    async fn send(&self) -> Result<OrderRecord, ClientError>;
    async fn lookup(&self) -> Result<OrderRecord, ClientError>;
}

struct RestPlaceAttempt<'a> {
    client: &'a ExchangeClient,
    body: PlaceOrderBody,
}

impl PlaceAttempt for RestPlaceAttempt<'_> {
    async fn send(&self) -> Result<OrderRecord, ClientError> {
        self.client.private_bucket.acquire().await;
        self.client
            .rest_client
            .execute(PlaceOrder::new(self.body.clone()))
            .await
            .map(|(order, _)| order)
    }

    async fn lookup(&self) -> Result<OrderRecord, ClientError> {
        self.client.private_bucket.acquire().await;
        self.client
            .rest_client
            .execute(GetOrderByClientOid::new(self.body.client_oid.clone()))
            .await
            .map(|(order, _)| order)
    }
}

/// Drive a placement to a definite outcome without ever double-placing.
///
/// After a send fails ambiguously (transport or 5xx) the next attempt first asks the exchange
/// whether the previous send actually landed, keyed by the client order id; only a confirmed
/// miss re-sends the identical body.
pub(crate) async fn place_idempotently<A>(
    attempt: &A,
    max_attempts: usize,
    backoff: Duration,
) -> Result<OrderRecord, ClientError>
where
    A: PlaceAttempt,
{
    let mut last_error = None;
    for round in 0..max_attempts {
        if round > 0 {
            tokio::time::sleep(backoff).await;
            match attempt.lookup().await {
                Ok(order) => {
                    debug!(order_id = %order.id, "placement resolved via client-oid lookup");
                    return Ok(order);
                }
                Err(ClientError::Api(ApiError::NotFound)) => {
                    debug!("previous attempt did not land, re-sending");
                }
                Err(error) => {
                    warn!(%error, "client-oid lookup inconclusive, re-sending");
                }
            }
        }
        match attempt.send().await {
            Ok(order) => return Ok(order),
            Err(error) if error.is_retryable() => {
                warn!(%error, round, "order placement outcome unknown");
                last_error = Some(error);
            }
            Err(error) => return Err(error),
        }
    }

    // Last chance: the final send may have landed
    tokio::time::sleep(backoff).await;
    if let Ok(order) = attempt.lookup().await {
        return Ok(order);
    }

    Err(last_error.unwrap_or_else(|| ClientError::Transport("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketId, OrderType, Side};
    use crate::order::OrderStatus;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct MockPlaceAttempt {
        send_results: Mutex<Vec<Result<OrderRecord, ClientError>>>,
        lookup_results: Mutex<Vec<Result<OrderRecord, ClientError>>>,
        sends: Mutex<usize>,
        lookups: Mutex<usize>,
    }

    impl MockPlaceAttempt {
        fn new(
            send_results: Vec<Result<OrderRecord, ClientError>>,
            lookup_results: Vec<Result<OrderRecord, ClientError>>,
        ) -> Self {
            Self {
                send_results: Mutex::new(send_results),
                lookup_results: Mutex::new(lookup_results),
                sends: Mutex::new(0),
                lookups: Mutex::new(0),
            }
        }
    }

    impl PlaceAttempt for MockPlaceAttempt {
        async fn send(&self) -> Result<OrderRecord, ClientError> {
            *self.sends.lock() += 1;
            self.send_results.lock().remove(0)
        }

        async fn lookup(&self) -> Result<OrderRecord, ClientError> {
            *self.lookups.lock() += 1;
            self.lookup_results.lock().remove(0)
        }
    }

    fn order_record(id: &str) -> OrderRecord {
        OrderRecord {
            id: OrderId::new(id),
            client_oid: None,
            product_id: MarketId::new("ETH-USD"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(1000)),
            size: Some(dec!(0.1)),
            funds: None,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            done_at: None,
            done_reason: None,
            executed_value: Decimal::ZERO,
            filled_size: Decimal::ZERO,
            fill_fees: Decimal::ZERO,
            settled: false,
        }
    }

    #[tokio::test]
    async fn test_first_send_success_needs_no_lookup() {
        let attempt = MockPlaceAttempt::new(vec![Ok(order_record("a"))], vec![]);
        let order = place_idempotently(&attempt, 3, Duration::ZERO).await.unwrap();
        assert_eq!(order.id, OrderId::new("a"));
        assert_eq!(*attempt.sends.lock(), 1);
        assert_eq!(*attempt.lookups.lock(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_resolves_via_lookup_without_resend() {
        // The first send fails ambiguously but actually landed on the exchange
        let attempt = MockPlaceAttempt::new(
            vec![Err(ClientError::Transport("connection reset".to_string()))],
            vec![Ok(order_record("landed"))],
        );
        let order = place_idempotently(&attempt, 3, Duration::ZERO).await.unwrap();
        assert_eq!(order.id, OrderId::new("landed"));
        assert_eq!(*attempt.sends.lock(), 1, "a landed order must not be re-sent");
        assert_eq!(*attempt.lookups.lock(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_miss_resends() {
        let attempt = MockPlaceAttempt::new(
            vec![
                Err(ClientError::InternalServerError("oops".to_string())),
                Ok(order_record("second")),
            ],
            vec![Err(ClientError::Api(ApiError::NotFound))],
        );
        let order = place_idempotently(&attempt, 3, Duration::ZERO).await.unwrap();
        assert_eq!(order.id, OrderId::new("second"));
        assert_eq!(*attempt.sends.lock(), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let attempt = MockPlaceAttempt::new(
            vec![Err(ClientError::Api(ApiError::Rejected(
                "Post only mode".to_string(),
            )))],
            vec![],
        );
        let error = place_idempotently(&attempt, 3, Duration::ZERO).await.unwrap_err();
        assert_eq!(error.rejection_message(), Some("Post only mode"));
        assert_eq!(*attempt.sends.lock(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_transport_error() {
        let attempt = MockPlaceAttempt::new(
            vec![
                Err(ClientError::Transport("a".to_string())),
                Err(ClientError::Transport("b".to_string())),
            ],
            vec![
                Err(ClientError::Api(ApiError::NotFound)),
                Err(ClientError::Api(ApiError::NotFound)),
            ],
        );
        let error = place_idempotently(&attempt, 2, Duration::ZERO).await.unwrap_err();
        assert!(matches!(error, ClientError::Transport(_)));
        assert_eq!(*attempt.sends.lock(), 2);
    }
}
