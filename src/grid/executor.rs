//! Exchange abstraction for grid trading - enables mocking for tests

use async_trait::async_trait;

use super::errors::GridResult;
use super::types::{OrderRequest, OrderStatusReport, PriceBand};

/// Exchange operations the engine relies on
///
/// Every call may fail transiently (`GridError::Exchange` or
/// `GridError::Timeout`); the engine retries on a later cycle.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Current reference price (mark or mid)
    async fn get_price(&self, symbol: &str) -> GridResult<f64>;

    /// Place an order, returning the exchange order id
    async fn place_order(&self, symbol: &str, order: &OrderRequest) -> GridResult<String>;

    /// Cancel by exchange id. Cancelling an order the exchange no longer
    /// knows or has already closed is not an error.
    async fn cancel_order(&self, symbol: &str, exchange_id: &str) -> GridResult<()>;

    /// Status and cumulative fill of an order
    async fn get_order_status(&self, symbol: &str, exchange_id: &str) -> GridResult<OrderStatusReport>;

    /// Price limits for new orders; defaults to +/-2% around the price
    async fn get_price_band(&self, symbol: &str) -> GridResult<PriceBand> {
        let price = self.get_price(symbol).await?;
        Ok(PriceBand::around(price))
    }
}

/// Scriptable exchange for tests
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;

    use crate::grid::errors::GridError;
    use crate::grid::types::{OrderKind, OrderStatus};

    #[derive(Debug, Clone)]
    struct MockOrder {
        request: OrderRequest,
        status: OrderStatus,
        filled: f64,
        avg_price: Option<f64>,
    }

    /// Mock exchange for testing
    pub struct MockExchange {
        pub placed: Arc<Mutex<Vec<OrderRequest>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub price: Arc<Mutex<f64>>,
        pub band: Arc<Mutex<Option<PriceBand>>>,
        /// Every call fails as if the network were down
        pub unreachable: Arc<Mutex<bool>>,
        /// Every call blocks far past any sane timeout
        pub hanging: Arc<Mutex<bool>>,
        rejected_prices: Arc<Mutex<HashSet<u64>>>,
        orders: Arc<Mutex<HashMap<String, MockOrder>>>,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                price: Arc::new(Mutex::new(price)),
                band: Arc::new(Mutex::new(None)),
                unreachable: Arc::new(Mutex::new(false)),
                hanging: Arc::new(Mutex::new(false)),
                rejected_prices: Arc::new(Mutex::new(HashSet::new())),
                orders: Arc::new(Mutex::new(HashMap::new())),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_price(&self, price: f64) {
            *self.price.lock().await = price;
        }

        pub async fn set_band(&self, band: Option<PriceBand>) {
            *self.band.lock().await = band;
        }

        pub async fn set_unreachable(&self, unreachable: bool) {
            *self.unreachable.lock().await = unreachable;
        }

        pub async fn set_hanging(&self, hanging: bool) {
            *self.hanging.lock().await = hanging;
        }

        /// Refuse placements at exactly `price`
        pub async fn reject_placements_at(&self, price: f64) {
            self.rejected_prices.lock().await.insert(price.to_bits());
        }

        /// Fill `size` more of an open order (everything when `None`)
        pub async fn fill(&self, exchange_id: &str, size: Option<f64>) -> bool {
            let mut orders = self.orders.lock().await;
            let Some(order) = orders.get_mut(exchange_id) else {
                return false;
            };
            if order.status != OrderStatus::Open {
                return false;
            }
            let remaining = order.request.size - order.filled;
            let size = size.unwrap_or(remaining).min(remaining);
            order.filled += size;
            order.avg_price = Some(order.request.price);
            if order.request.size - order.filled <= 1e-12 {
                order.status = OrderStatus::Filled;
            }
            true
        }

        /// Fully fill every open order resting at `price`; returns how many filled
        pub async fn fill_at_price(&self, price: f64) -> usize {
            let ids: Vec<String> = self
                .orders
                .lock()
                .await
                .iter()
                .filter(|(_, o)| o.status == OrderStatus::Open && (o.request.price - price).abs() < 1e-9)
                .map(|(id, _)| id.clone())
                .collect();
            let mut count = 0;
            for id in ids {
                if self.fill(&id, None).await {
                    count += 1;
                }
            }
            count
        }

        /// Close an order on the exchange side without a fill
        pub async fn expire(&self, exchange_id: &str) {
            if let Some(order) = self.orders.lock().await.get_mut(exchange_id) {
                order.status = OrderStatus::Cancelled;
            }
        }

        /// Requests of orders currently resting on the mock book
        pub async fn open_orders(&self) -> Vec<(String, OrderRequest)> {
            let mut open: Vec<_> = self
                .orders
                .lock()
                .await
                .iter()
                .filter(|(_, o)| o.status == OrderStatus::Open)
                .map(|(id, o)| (id.clone(), o.request.clone()))
                .collect();
            open.sort_by(|a, b| a.1.price.total_cmp(&b.1.price));
            open
        }

        async fn check_reachable(&self) -> GridResult<()> {
            if *self.hanging.lock().await {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if *self.unreachable.lock().await {
                return Err(GridError::Exchange("Mock failure: exchange unreachable".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockExchange {
        async fn get_price(&self, _symbol: &str) -> GridResult<f64> {
            self.check_reachable().await?;
            Ok(*self.price.lock().await)
        }

        async fn place_order(&self, _symbol: &str, order: &OrderRequest) -> GridResult<String> {
            self.check_reachable().await?;
            if self.rejected_prices.lock().await.contains(&order.price.to_bits()) {
                return Err(GridError::Exchange(format!("Mock rejection at {}", order.price)));
            }

            self.placed.lock().await.push(order.clone());
            let exchange_id = format!("mock-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));

            let mut record = MockOrder {
                request: order.clone(),
                status: OrderStatus::Open,
                filled: 0.0,
                avg_price: None,
            };
            if order.kind == OrderKind::Market {
                record.status = OrderStatus::Filled;
                record.filled = order.size;
                record.avg_price = Some(*self.price.lock().await);
            }
            self.orders.lock().await.insert(exchange_id.clone(), record);
            Ok(exchange_id)
        }

        async fn cancel_order(&self, _symbol: &str, exchange_id: &str) -> GridResult<()> {
            self.check_reachable().await?;
            self.cancelled.lock().await.push(exchange_id.to_string());
            if let Some(order) = self.orders.lock().await.get_mut(exchange_id) {
                if order.status == OrderStatus::Open {
                    order.status = OrderStatus::Cancelled;
                }
            }
            Ok(())
        }

        async fn get_order_status(&self, _symbol: &str, exchange_id: &str) -> GridResult<OrderStatusReport> {
            self.check_reachable().await?;
            let orders = self.orders.lock().await;
            let order = orders
                .get(exchange_id)
                .ok_or_else(|| GridError::OrderNotFound(exchange_id.to_string()))?;
            Ok(OrderStatusReport {
                status: order.status,
                filled_size: order.filled,
                avg_price: order.avg_price,
            })
        }

        async fn get_price_band(&self, symbol: &str) -> GridResult<PriceBand> {
            let price = self.get_price(symbol).await?;
            Ok(self.band.lock().await.unwrap_or_else(|| PriceBand::around(price)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use crate::grid::errors::GridError;
    use crate::grid::types::{OrderKind, OrderSide, OrderStatus};

    fn limit(price: f64, size: f64) -> OrderRequest {
        OrderRequest {
            client_id: 1,
            level_index: Some(0),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            price,
            size,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_mock_partial_then_full_fill() {
        let exchange = MockExchange::new(100.0);
        let id = exchange.place_order("X", &limit(99.0, 2.0)).await.unwrap();

        assert!(exchange.fill(&id, Some(0.5)).await);
        let report = exchange.get_order_status("X", &id).await.unwrap();
        assert_eq!(report.status, OrderStatus::Open);
        assert_eq!(report.filled_size, 0.5);

        assert!(exchange.fill(&id, None).await);
        let report = exchange.get_order_status("X", &id).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.filled_size, 2.0);
    }

    #[tokio::test]
    async fn test_mock_cancel_is_idempotent() {
        let exchange = MockExchange::new(100.0);
        let id = exchange.place_order("X", &limit(99.0, 1.0)).await.unwrap();
        exchange.cancel_order("X", &id).await.unwrap();
        exchange.cancel_order("X", &id).await.unwrap();
        exchange.cancel_order("X", "unknown").await.unwrap();

        let report = exchange.get_order_status("X", &id).await.unwrap();
        assert_eq!(report.status, OrderStatus::Cancelled);
        assert!(exchange.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_unreachable_and_default_band() {
        let exchange = MockExchange::new(100.0);
        let band = exchange.get_price_band("X").await.unwrap();
        assert_eq!(band, PriceBand::around(100.0));

        exchange.set_unreachable(true).await;
        let err = exchange.get_price("X").await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            exchange.place_order("X", &limit(99.0, 1.0)).await,
            Err(GridError::Exchange(_))
        ));
    }
}
