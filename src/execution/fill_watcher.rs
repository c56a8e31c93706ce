use crate::api::broker::{with_timeout, BrokerApi};
use crate::models::{Order, OrderStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a watched order ended
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled(Order),
    /// Unfilled at the deadline and cancelled; `filled_qty` may be partial
    TimedOut(Order),
    /// Cancelled or rejected by the broker
    Closed(Order),
    /// The broker could not be reached to settle the order
    Unknown { order_id: String, error: String },
}

impl FillOutcome {
    pub fn filled_qty(&self) -> u64 {
        match self {
            FillOutcome::Filled(order) | FillOutcome::TimedOut(order) | FillOutcome::Closed(order) => {
                order.filled_qty
            }
            FillOutcome::Unknown { .. } => 0,
        }
    }
}

/// Polls an order until it fills or the deadline passes, then cancels it
#[derive(Clone)]
pub struct FillWatcher {
    broker: Arc<dyn BrokerApi>,
    timeout: Duration,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl FillWatcher {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        timeout: Duration,
        poll_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            timeout,
            poll_interval,
            call_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn watch(&self, order: Order) -> FillOutcome {
        if order.status == OrderStatus::Filled {
            return FillOutcome::Filled(order);
        }

        let deadline = Instant::now() + self.timeout;
        let mut last_seen = order;

        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;

            match with_timeout(self.call_timeout, self.broker.get_order(&last_seen.id)).await {
                Ok(current) => {
                    match current.status {
                        OrderStatus::Filled => return FillOutcome::Filled(current),
                        OrderStatus::Cancelled | OrderStatus::Rejected => {
                            return FillOutcome::Closed(current)
                        }
                        _ => {}
                    }
                    last_seen = current;
                }
                Err(e) => {
                    tracing::debug!(order_id = %last_seen.id, "Fill poll failed: {}", e);
                }
            }
        }

        tracing::warn!(
            order_id = %last_seen.id,
            symbol = %last_seen.symbol,
            "⏰ Order not filled within {:?}, cancelling",
            self.timeout
        );

        if let Err(e) = with_timeout(self.call_timeout, self.broker.cancel_order(&last_seen.id)).await
        {
            tracing::error!(order_id = %last_seen.id, "Cancel after timeout failed: {}", e);
        }

        // Re-read: the order may have filled while we were cancelling
        match with_timeout(self.call_timeout, self.broker.get_order(&last_seen.id)).await {
            Ok(current) if current.status == OrderStatus::Filled => FillOutcome::Filled(current),
            Ok(mut current) => {
                current.status = OrderStatus::TimedOut;
                FillOutcome::TimedOut(current)
            }
            Err(e) => FillOutcome::Unknown {
                order_id: last_seen.id,
                error: e.to_string(),
            },
        }
    }
}
