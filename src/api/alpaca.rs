use super::broker::{with_timeout, BrokerApi, BrokerError, BrokerResult};
use crate::models::{
    Account, Bar, Order, OrderRequest, OrderSide, OrderStatus, Position, Quote,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";
const DEFAULT_RATE_LIMIT_RPM: u32 = 200;
/// Calendar days of history requested so `limit` intraday bars are available
const HISTORY_LOOKBACK_DAYS: i64 = 7;

type AlpacaRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Alpaca REST client settings
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    pub api_key: String,
    pub secret_key: String,
    pub trading_url: String,
    pub data_url: String,
    pub feed: String,
    pub request_timeout: Duration,
    pub rate_limit_rpm: u32,
}

impl AlpacaConfig {
    pub fn paper(api_key: String, secret_key: String) -> Self {
        Self {
            api_key,
            secret_key,
            trading_url: PAPER_TRADING_URL.to_string(),
            data_url: DATA_URL.to_string(),
            feed: "iex".to_string(),
            request_timeout: Duration::from_secs(10),
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
        }
    }
}

/// Alpaca trading and market data API client
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct AlpacaClient {
    client: Client,
    config: AlpacaConfig,
    rate_limiter: Arc<AlpacaRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: Option<String>,
    symbol: String,
    side: String,
    qty: Option<String>,
    #[serde(default)]
    filled_qty: Option<String>,
    limit_price: Option<String>,
    filled_avg_price: Option<String>,
    status: String,
    submitted_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
    current_price: Option<String>,
    unrealized_pl: Option<String>,
    unrealized_plpc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    cash: String,
    buying_power: String,
    equity: String,
    #[serde(default)]
    trading_blocked: bool,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuote {
    t: DateTime<Utc>,
    bp: f64,
    bs: f64,
    ap: f64,
    #[serde(rename = "as")]
    ask_size: f64,
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    symbol: String,
    quote: AlpacaQuote,
}

#[derive(Debug, Serialize)]
struct NewOrderBody<'a> {
    symbol: &'a str,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: &'a str,
    time_in_force: &'a str,
    limit_price: String,
    client_order_id: &'a str,
    extended_hours: bool,
}

fn parse_num(field: &str, value: &str) -> BrokerResult<f64> {
    value
        .parse::<f64>()
        .map_err(|e| BrokerError::Decode(format!("{} '{}': {}", field, value, e)))
}

fn parse_opt_num(field: &str, value: Option<&String>) -> BrokerResult<Option<f64>> {
    value.map(|v| parse_num(field, v)).transpose()
}

/// Map an Alpaca order status string onto the engine's order lifecycle
pub fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "canceled" | "expired" | "done_for_day" | "replaced" => OrderStatus::Cancelled,
        "rejected" | "suspended" | "stopped" => OrderStatus::Rejected,
        _ => OrderStatus::Submitted,
    }
}

impl TryFrom<AlpacaOrder> for Order {
    type Error = BrokerError;

    fn try_from(raw: AlpacaOrder) -> BrokerResult<Self> {
        let side = match raw.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => return Err(BrokerError::Decode(format!("order side '{}'", other))),
        };
        let qty = parse_opt_num("qty", raw.qty.as_ref())?.unwrap_or(0.0);
        let filled_qty = parse_opt_num("filled_qty", raw.filled_qty.as_ref())?.unwrap_or(0.0);
        let limit_price = raw
            .limit_price
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .map_err(|e| BrokerError::Decode(format!("limit_price: {}", e)))?;

        Ok(Order {
            id: raw.id,
            client_order_id: raw.client_order_id,
            symbol: raw.symbol,
            side,
            qty: qty.max(0.0) as u64,
            filled_qty: filled_qty.max(0.0) as u64,
            limit_price,
            filled_avg_price: parse_opt_num("filled_avg_price", raw.filled_avg_price.as_ref())?,
            status: map_order_status(&raw.status),
            submitted_at: raw.submitted_at.or(raw.created_at).unwrap_or_else(Utc::now),
        })
    }
}

impl TryFrom<AlpacaPosition> for Position {
    type Error = BrokerError;

    fn try_from(raw: AlpacaPosition) -> BrokerResult<Self> {
        let qty = parse_num("qty", &raw.qty)?;
        let entry_price = parse_num("avg_entry_price", &raw.avg_entry_price)?;
        let current_price =
            parse_opt_num("current_price", raw.current_price.as_ref())?.unwrap_or(entry_price);
        let unrealized_pnl = parse_opt_num("unrealized_pl", raw.unrealized_pl.as_ref())?
            .unwrap_or((current_price - entry_price) * qty);
        // unrealized_plpc is a fraction
        let unrealized_pnl_percent = parse_opt_num("unrealized_plpc", raw.unrealized_plpc.as_ref())?
            .map(|fraction| fraction * 100.0)
            .unwrap_or(0.0);

        Ok(Position {
            symbol: raw.symbol,
            qty,
            entry_price,
            current_price,
            unrealized_pnl,
            unrealized_pnl_percent,
        })
    }
}

impl AlpacaClient {
    /// Create a new Alpaca client
    pub fn new(config: AlpacaConfig) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BrokerError::Network(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(config.rate_limit_rpm).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("APCA-API-KEY-ID", &self.config.api_key)
            .header("APCA-API-SECRET-KEY", &self.config.secret_key)
    }

    /// Rate-limited send with the per-call timeout; maps HTTP failures
    async fn send(&self, builder: RequestBuilder) -> BrokerResult<reqwest::Response> {
        self.rate_limiter.until_ready().await;

        let response = with_timeout(self.config.request_timeout, async {
            builder.send().await.map_err(BrokerError::from)
        })
        .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited,
            StatusCode::NOT_FOUND => BrokerError::NotFound(message),
            s if s.is_server_error() => BrokerError::Server {
                status: s.as_u16(),
                message,
            },
            s => BrokerError::Rejected {
                status: s.as_u16(),
                message,
            },
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> BrokerResult<T> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))
    }

    fn trading(&self, path: &str) -> String {
        format!("{}{}", self.config.trading_url, path)
    }

    fn data(&self, path: &str) -> String {
        format!("{}{}", self.config.data_url, path)
    }
}

#[async_trait]
impl BrokerApi for AlpacaClient {
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<Order> {
        let body = NewOrderBody {
            symbol: &request.symbol,
            qty: request.qty.to_string(),
            side: request.side.to_string(),
            order_type: "limit",
            time_in_force: "day",
            limit_price: request.limit_price.to_string(),
            client_order_id: &request.client_order_id,
            extended_hours: request.extended_hours,
        };

        let builder = self
            .request(Method::POST, self.trading("/v2/orders"))
            .json(&body);
        let raw: AlpacaOrder = self.get_json(builder).await?;
        let order = Order::try_from(raw)?;

        tracing::info!(
            symbol = %order.symbol,
            order_id = %order.id,
            side = %order.side,
            qty = order.qty,
            limit = %request.limit_price,
            "Order submitted"
        );
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let builder = self.request(
            Method::DELETE,
            self.trading(&format!("/v2/orders/{}", order_id)),
        );
        self.send(builder).await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<Order> {
        let builder = self.request(Method::GET, self.trading(&format!("/v2/orders/{}", order_id)));
        let raw: AlpacaOrder = self.get_json(builder).await?;
        Order::try_from(raw)
    }

    async fn get_positions(&self) -> BrokerResult<Vec<Position>> {
        let builder = self.request(Method::GET, self.trading("/v2/positions"));
        let raw: Vec<AlpacaPosition> = self.get_json(builder).await?;
        raw.into_iter().map(Position::try_from).collect()
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<Order>> {
        let builder = self
            .request(Method::GET, self.trading("/v2/orders"))
            .query(&[("status", "open"), ("limit", "500")]);
        let raw: Vec<AlpacaOrder> = self.get_json(builder).await?;
        raw.into_iter().map(Order::try_from).collect()
    }

    async fn get_account(&self) -> BrokerResult<Account> {
        let builder = self.request(Method::GET, self.trading("/v2/account"));
        let raw: AlpacaAccount = self.get_json(builder).await?;
        Ok(Account {
            cash: parse_num("cash", &raw.cash)?,
            buying_power: parse_num("buying_power", &raw.buying_power)?,
            equity: parse_num("equity", &raw.equity)?,
            trading_blocked: raw.trading_blocked,
        })
    }

    async fn get_historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> BrokerResult<Vec<Bar>> {
        let start = (Utc::now() - ChronoDuration::days(HISTORY_LOOKBACK_DAYS)).to_rfc3339();
        let builder = self
            .request(
                Method::GET,
                self.data(&format!("/v2/stocks/{}/bars", symbol)),
            )
            .query(&[
                ("timeframe", timeframe.to_string()),
                ("limit", limit.to_string()),
                ("start", start),
                ("sort", "desc".to_string()),
                ("feed", self.config.feed.clone()),
            ]);

        let response: BarsResponse = self.get_json(builder).await?;
        let mut bars: Vec<Bar> = response
            .bars
            .unwrap_or_default()
            .into_iter()
            .map(|b| Bar {
                symbol: symbol.to_string(),
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
                volume: b.v,
                timestamp: b.t,
            })
            .collect();
        // Requested newest first so `limit` keeps the latest bars
        bars.reverse();
        Ok(bars)
    }

    async fn get_latest_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        let builder = self
            .request(
                Method::GET,
                self.data(&format!("/v2/stocks/{}/quotes/latest", symbol)),
            )
            .query(&[("feed", self.config.feed.as_str())]);
        let response: LatestQuoteResponse = self.get_json(builder).await?;

        Ok(Quote {
            symbol: response.symbol,
            bid: response.quote.bp,
            ask: response.quote.ap,
            bid_size: response.quote.bs,
            ask_size: response.quote.ask_size,
            timestamp: response.quote.t,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn client_for(server: &mockito::Server) -> AlpacaClient {
        let mut config = AlpacaConfig::paper("key".to_string(), "secret".to_string());
        config.trading_url = server.url();
        config.data_url = server.url();
        config.request_timeout = Duration::from_secs(2);
        AlpacaClient::new(config).unwrap()
    }

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(map_order_status("new"), OrderStatus::Submitted);
        assert_eq!(map_order_status("accepted"), OrderStatus::Submitted);
        assert_eq!(map_order_status("pending_cancel"), OrderStatus::Submitted);
        assert_eq!(map_order_status("partially_filled"), OrderStatus::PartiallyFilled);
        assert_eq!(map_order_status("filled"), OrderStatus::Filled);
        assert_eq!(map_order_status("canceled"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("expired"), OrderStatus::Cancelled);
        assert_eq!(map_order_status("rejected"), OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_get_positions_scales_percent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/positions")
            .match_header("APCA-API-KEY-ID", "key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"symbol":"AAPL","qty":"10","avg_entry_price":"100.00",
                     "current_price":"112.00","unrealized_pl":"120.00",
                     "unrealized_plpc":"0.12","side":"long"}]"#,
            )
            .create_async()
            .await;

        let positions = client_for(&server).get_positions().await.unwrap();
        mock.assert_async().await;

        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, 10.0);
        assert_eq!(positions[0].entry_price, 100.0);
        assert!((positions[0].unrealized_pnl_percent - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_submit_order_sends_limit_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/orders")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "AAPL",
                "qty": "5",
                "side": "buy",
                "type": "limit",
                "limit_price": "100.20"
            })))
            .with_status(200)
            .with_body(
                r#"{"id":"ord-1","client_order_id":"cid-1","symbol":"AAPL","side":"buy",
                    "qty":"5","filled_qty":"0","limit_price":"100.2","filled_avg_price":null,
                    "status":"accepted","submitted_at":"2024-03-04T14:30:00Z"}"#,
            )
            .create_async()
            .await;

        let request = OrderRequest {
            client_order_id: "cid-1".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: 5,
            limit_price: dec("100.20"),
            extended_hours: false,
        };
        let order = client_for(&server).submit_order(&request).await.unwrap();
        mock.assert_async().await;

        assert_eq!(order.id, "ord-1");
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.qty, 5);
        assert_eq!(order.limit_price, Some(dec("100.2")));
    }

    #[tokio::test]
    async fn test_rejection_maps_to_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/orders")
            .with_status(403)
            .with_body(r#"{"code":40310000,"message":"insufficient buying power"}"#)
            .create_async()
            .await;

        let request = OrderRequest {
            client_order_id: "cid-2".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: 5,
            limit_price: dec("100.20"),
            extended_hours: false,
        };
        let err = client_for(&server).submit_order(&request).await.unwrap_err();

        match err {
            BrokerError::Rejected { status, message } => {
                assert_eq!(status, 403);
                assert!(message.contains("insufficient buying power"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/account")
            .with_status(503)
            .create_async()
            .await;

        let err = client_for(&server).get_account().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_historical_bars_oldest_first() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/stocks/AAPL/bars")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeframe".into(), "1Min".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
                Matcher::UrlEncoded("sort".into(), "desc".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"bars":[
                    {"t":"2024-03-04T14:31:00Z","o":101,"h":102,"l":100,"c":101.5,"v":900},
                    {"t":"2024-03-04T14:30:00Z","o":100,"h":101,"l":99,"c":100.5,"v":1200}
                ],"symbol":"AAPL","next_page_token":null}"#,
            )
            .create_async()
            .await;

        let bars = client_for(&server)
            .get_historical_bars("AAPL", "1Min", 2)
            .await
            .unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[1].close, 101.5);
        assert!(bars[0].timestamp < bars[1].timestamp);
    }

    #[tokio::test]
    async fn test_latest_quote() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v2/stocks/TSLA/quotes/latest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"symbol":"TSLA","quote":{"t":"2024-03-04T14:30:00Z","ax":"V","ap":200.5,
                    "as":3,"bx":"V","bp":200.1,"bs":1,"c":["R"],"z":"C"}}"#,
            )
            .create_async()
            .await;

        let quote = client_for(&server).get_latest_quote("TSLA").await.unwrap();
        assert_eq!(quote.symbol, "TSLA");
        assert_eq!(quote.bid, 200.1);
        assert_eq!(quote.ask, 200.5);
    }

    #[tokio::test]
    async fn test_cancel_missing_order_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/v2/orders/missing")
            .with_status(404)
            .with_body(r#"{"message":"order not found"}"#)
            .create_async()
            .await;

        let err = client_for(&server).cancel_order("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }
}
