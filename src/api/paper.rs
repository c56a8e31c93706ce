use super::broker::{BrokerApi, BrokerError, BrokerResult};
use crate::models::{Account, Bar, Order, OrderRequest, OrderSide, OrderStatus, Position, Quote};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How the paper broker treats submitted orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill at the limit price on submission
    Immediate,
    /// Leave orders working until cancelled or filled by hand
    Never,
    /// Refuse every order
    Reject,
}

#[derive(Debug)]
struct PaperState {
    fill_mode: FillMode,
    cash: f64,
    positions: BTreeMap<String, Position>,
    orders: HashMap<String, Order>,
    quotes: HashMap<String, Quote>,
    bars: HashMap<String, Vec<Bar>>,
    submitted: Vec<OrderRequest>,
    next_id: u64,
    unavailable: bool,
}

/// Deterministic in-memory broker
///
/// Backs `--paper` runs and the engine's tests. Orders fill locally; bars
/// and quotes come from an optional market data source, otherwise from
/// whatever was set by hand. Positions are revalued from the latest quote.
pub struct PaperBroker {
    state: Mutex<PaperState>,
    market_data: Option<Arc<dyn BrokerApi>>,
}

impl PaperBroker {
    pub fn new(cash: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                fill_mode: FillMode::Immediate,
                cash,
                positions: BTreeMap::new(),
                orders: HashMap::new(),
                quotes: HashMap::new(),
                bars: HashMap::new(),
                submitted: Vec::new(),
                next_id: 1,
                unavailable: false,
            }),
            market_data: None,
        }
    }

    /// Serve bars and quotes from `source` instead of the local tables
    pub fn with_market_data(mut self, source: Arc<dyn BrokerApi>) -> Self {
        self.market_data = Some(source);
        self
    }

    pub fn with_fill_mode(self, mode: FillMode) -> Self {
        self.state.lock().fill_mode = mode;
        self
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state.lock().fill_mode = mode;
    }

    /// Make every call fail with a network error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn set_position(&self, position: Position) {
        self.state
            .lock()
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub fn clear_positions(&self) {
        self.state.lock().positions.clear();
    }

    /// Set the latest quote and revalue any position at the mid price
    pub fn set_quote(&self, quote: Quote) {
        let mut state = self.state.lock();
        if let Some(position) = state.positions.get_mut(&quote.symbol) {
            revalue(position, (quote.bid + quote.ask) / 2.0);
        }
        state.quotes.insert(quote.symbol.clone(), quote);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.state.lock().bars.insert(symbol.to_string(), bars);
    }

    /// Every order request received, in order
    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().cash
    }

    /// Fill a working order at its limit price
    pub fn fill_order(&self, order_id: &str) -> BrokerResult<Order> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(order);
        }
        Ok(apply_fill(&mut state, order))
    }

    fn check_available(&self) -> BrokerResult<()> {
        if self.state.lock().unavailable {
            return Err(BrokerError::Network("paper broker offline".to_string()));
        }
        Ok(())
    }
}

fn revalue(position: &mut Position, price: f64) {
    position.current_price = price;
    position.unrealized_pnl = (price - position.entry_price) * position.qty;
    position.unrealized_pnl_percent = if position.entry_price > 0.0 {
        (price - position.entry_price) / position.entry_price * 100.0
    } else {
        0.0
    };
}

fn apply_fill(state: &mut PaperState, mut order: Order) -> Order {
    let price = order
        .limit_price
        .and_then(|p| p.to_f64())
        .unwrap_or_default();
    let qty = order.qty as f64;

    match order.side {
        OrderSide::Buy => {
            state.cash -= price * qty;
            let position = state
                .positions
                .entry(order.symbol.clone())
                .or_insert_with(|| Position {
                    symbol: order.symbol.clone(),
                    qty: 0.0,
                    entry_price: price,
                    current_price: price,
                    unrealized_pnl: 0.0,
                    unrealized_pnl_percent: 0.0,
                });
            let total = position.qty + qty;
            position.entry_price = (position.entry_price * position.qty + price * qty) / total;
            position.qty = total;
            revalue(position, price);
        }
        OrderSide::Sell => {
            state.cash += price * qty;
            let emptied = match state.positions.get_mut(&order.symbol) {
                Some(position) => {
                    position.qty -= qty;
                    position.qty <= 0.0
                }
                None => false,
            };
            if emptied {
                state.positions.remove(&order.symbol);
            }
        }
    }

    order.status = OrderStatus::Filled;
    order.filled_qty = order.qty;
    order.filled_avg_price = Some(price);
    state.orders.insert(order.id.clone(), order.clone());
    order
}

#[async_trait]
impl BrokerApi for PaperBroker {
    async fn submit_order(&self, request: &OrderRequest) -> BrokerResult<Order> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.submitted.push(request.clone());

        if state.fill_mode == FillMode::Reject {
            return Err(BrokerError::Rejected {
                status: 403,
                message: "order rejected by paper broker".to_string(),
            });
        }

        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        let order = Order {
            id: id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            filled_qty: 0,
            limit_price: Some(request.limit_price),
            filled_avg_price: None,
            status: OrderStatus::Submitted,
            submitted_at: Utc::now(),
        };
        state.orders.insert(id, order.clone());

        if state.fill_mode == FillMode::Immediate {
            return Ok(apply_fill(&mut state, order));
        }
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> BrokerResult<Order> {
        self.check_available()?;
        self.state
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
    }

    async fn get_positions(&self) -> BrokerResult<Vec<Position>> {
        self.check_available()?;

        if let Some(source) = &self.market_data {
            let held: Vec<String> = self.state.lock().positions.keys().cloned().collect();
            for symbol in held {
                match source.get_latest_quote(&symbol).await {
                    Ok(quote) => self.set_quote(quote),
                    Err(e) => tracing::debug!(symbol = %symbol, "Paper revalue skipped: {}", e),
                }
            }
        }

        Ok(self.state.lock().positions.values().cloned().collect())
    }

    async fn get_open_orders(&self) -> BrokerResult<Vec<Order>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_account(&self) -> BrokerResult<Account> {
        self.check_available()?;
        let state = self.state.lock();
        let market_value: f64 = state.positions.values().map(|p| p.market_value()).sum();
        Ok(Account {
            cash: state.cash,
            buying_power: state.cash,
            equity: state.cash + market_value,
            trading_blocked: false,
        })
    }

    async fn get_historical_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> BrokerResult<Vec<Bar>> {
        self.check_available()?;
        if let Some(source) = &self.market_data {
            return source.get_historical_bars(symbol, timeframe, limit).await;
        }
        let state = self.state.lock();
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn get_latest_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        self.check_available()?;
        if let Some(source) = &self.market_data {
            let quote = source.get_latest_quote(symbol).await?;
            self.set_quote(quote.clone());
            return Ok(quote);
        }
        self.state
            .lock()
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("no quote for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn buy(symbol: &str, qty: u64, price: i64) -> OrderRequest {
        OrderRequest {
            client_order_id: format!("cid-{}", symbol),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            qty,
            limit_price: Decimal::from(price),
            extended_hours: false,
        }
    }

    #[tokio::test]
    async fn test_immediate_fill_opens_position() {
        let broker = PaperBroker::new(10_000.0);
        let order = broker.submit_order(&buy("AAPL", 10, 100)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, 10.0);
        assert_eq!(broker.cash(), 9_000.0);
    }

    #[tokio::test]
    async fn test_never_mode_leaves_order_working() {
        let broker = PaperBroker::new(10_000.0).with_fill_mode(FillMode::Never);
        let order = broker.submit_order(&buy("AAPL", 10, 100)).await.unwrap();

        assert_eq!(broker.get_open_orders().await.unwrap().len(), 1);
        broker.cancel_order(&order.id).await.unwrap();
        assert!(broker.get_open_orders().await.unwrap().is_empty());
        assert_eq!(
            broker.get_order(&order.id).await.unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_reject_mode() {
        let broker = PaperBroker::new(10_000.0).with_fill_mode(FillMode::Reject);
        let err = broker.submit_order(&buy("AAPL", 10, 100)).await.unwrap_err();

        assert!(matches!(err, BrokerError::Rejected { .. }));
        assert_eq!(broker.submitted_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_quote_revalues_position() {
        let broker = PaperBroker::new(10_000.0);
        broker.submit_order(&buy("AAPL", 10, 100)).await.unwrap();
        broker.set_quote(Quote {
            symbol: "AAPL".to_string(),
            bid: 111.0,
            ask: 113.0,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp: Utc::now(),
        });

        let position = &broker.get_positions().await.unwrap()[0];
        assert!((position.unrealized_pnl_percent - 12.0).abs() < 1e-9);
        assert!((position.unrealized_pnl - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_market_data_source_revalues() {
        let source = Arc::new(PaperBroker::new(0.0));
        source.set_quote(Quote {
            symbol: "AAPL".to_string(),
            bid: 94.0,
            ask: 96.0,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp: Utc::now(),
        });

        let broker = PaperBroker::new(10_000.0).with_market_data(source);
        broker.submit_order(&buy("AAPL", 10, 100)).await.unwrap();

        let position = &broker.get_positions().await.unwrap()[0];
        assert_eq!(position.current_price, 95.0);
        assert!(position.unrealized_pnl < 0.0);
        assert_eq!(broker.get_latest_quote("AAPL").await.unwrap().ask, 96.0);
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let broker = PaperBroker::new(0.0);
        broker.set_unavailable(true);
        let err = broker.get_positions().await.unwrap_err();
        assert!(err.is_transient());
    }
}
