//! Paper exchange: simulated fills against a random-walk price
//!
//! Limit orders fill in full at their own price once the simulated price
//! trades through them. Market orders fill immediately at the current price.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::{GridError, GridResult};
use super::executor::ExchangeAdapter;
use super::types::{OrderKind, OrderRequest, OrderSide, OrderStatus, OrderStatusReport, PriceBand};

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled: f64,
    avg_price: Option<f64>,
}

struct Book {
    price: f64,
    orders: HashMap<String, PaperOrder>,
}

impl Book {
    /// Fill every resting limit the price has crossed
    fn match_orders(&mut self) {
        let price = self.price;
        for (id, order) in self.orders.iter_mut() {
            if order.status != OrderStatus::Open {
                continue;
            }
            let crossed = match order.request.side {
                OrderSide::Buy => price <= order.request.price,
                OrderSide::Sell => price >= order.request.price,
            };
            if crossed {
                order.status = OrderStatus::Filled;
                order.filled = order.request.size;
                order.avg_price = Some(order.request.price);
                debug!(
                    "[paper] {} {} {} @ {} filled",
                    id,
                    order.request.side.as_str(),
                    order.request.size,
                    order.request.price
                );
            }
        }
    }
}

/// In-process exchange used in `paper` mode
pub struct PaperExchange {
    book: Mutex<Book>,
    /// Max relative move per price query
    volatility: f64,
}

impl PaperExchange {
    pub fn new(start_price: f64, volatility: f64) -> GridResult<Self> {
        if !(start_price.is_finite() && start_price > 0.0) {
            return Err(GridError::InvalidConfig(format!(
                "paper_start_price must be positive, got {}",
                start_price
            )));
        }
        if !(0.0..1.0).contains(&volatility) {
            return Err(GridError::InvalidConfig(format!(
                "paper_volatility must be in [0.0, 1.0), got {}",
                volatility
            )));
        }
        info!("[paper] starting at {} with volatility {}", start_price, volatility);
        Ok(Self {
            book: Mutex::new(Book {
                price: start_price,
                orders: HashMap::new(),
            }),
            volatility,
        })
    }

    /// Move the simulated price and match resting orders
    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        book.price = price;
        book.match_orders();
    }

    pub async fn open_order_count(&self) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .count()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn get_price(&self, _symbol: &str) -> GridResult<f64> {
        let step = if self.volatility > 0.0 {
            rand::thread_rng().gen_range(-self.volatility..=self.volatility)
        } else {
            0.0
        };

        let mut book = self.book.lock().await;
        book.price *= 1.0 + step;
        book.match_orders();
        Ok(book.price)
    }

    async fn place_order(&self, _symbol: &str, order: &OrderRequest) -> GridResult<String> {
        if !(order.size.is_finite() && order.size > 0.0) {
            return Err(GridError::Exchange(format!("[paper] invalid size {}", order.size)));
        }

        let exchange_id = Uuid::new_v4().to_string();
        let mut book = self.book.lock().await;
        let mut record = PaperOrder {
            request: order.clone(),
            status: OrderStatus::Open,
            filled: 0.0,
            avg_price: None,
        };
        if order.kind == OrderKind::Market {
            record.status = OrderStatus::Filled;
            record.filled = order.size;
            record.avg_price = Some(book.price);
        }
        book.orders.insert(exchange_id.clone(), record);
        book.match_orders();
        Ok(exchange_id)
    }

    async fn cancel_order(&self, _symbol: &str, exchange_id: &str) -> GridResult<()> {
        let mut book = self.book.lock().await;
        if let Some(order) = book.orders.get_mut(exchange_id) {
            if order.status == OrderStatus::Open {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, exchange_id: &str) -> GridResult<OrderStatusReport> {
        let book = self.book.lock().await;
        let order = book
            .orders
            .get(exchange_id)
            .ok_or_else(|| GridError::OrderNotFound(exchange_id.to_string()))?;
        Ok(OrderStatusReport {
            status: order.status,
            filled_size: order.filled,
            avg_price: order.avg_price,
        })
    }

    async fn get_price_band(&self, _symbol: &str) -> GridResult<PriceBand> {
        Ok(PriceBand::around(self.book.lock().await.price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(side: OrderSide, kind: OrderKind, price: f64) -> OrderRequest {
        OrderRequest {
            client_id: 1,
            level_index: None,
            side,
            kind,
            price,
            size: 1.0,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn test_limit_fills_when_price_crosses() {
        let paper = PaperExchange::new(100.0, 0.0).unwrap();
        let buy = paper
            .place_order("X", &request(OrderSide::Buy, OrderKind::Limit, 99.0))
            .await
            .unwrap();
        let sell = paper
            .place_order("X", &request(OrderSide::Sell, OrderKind::Limit, 101.0))
            .await
            .unwrap();
        assert_eq!(paper.open_order_count().await, 2);

        paper.set_price(98.5).await;
        let report = paper.get_order_status("X", &buy).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.avg_price, Some(99.0));
        let report = paper.get_order_status("X", &sell).await.unwrap();
        assert_eq!(report.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_market_order_fills_at_current_price() {
        let paper = PaperExchange::new(100.0, 0.0).unwrap();
        let id = paper
            .place_order("X", &request(OrderSide::Buy, OrderKind::Market, 100.0))
            .await
            .unwrap();
        let report = paper.get_order_status("X", &id).await.unwrap();
        assert_eq!(report, OrderStatusReport::filled(1.0, 100.0));
    }

    #[tokio::test]
    async fn test_random_walk_stays_within_volatility() {
        let paper = PaperExchange::new(100.0, 0.01).unwrap();
        let mut last = 100.0;
        for _ in 0..50 {
            let price = paper.get_price("X").await.unwrap();
            assert!((price / last - 1.0).abs() <= 0.01 + 1e-12);
            last = price;
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_ok() {
        let paper = PaperExchange::new(100.0, 0.0).unwrap();
        assert!(paper.cancel_order("X", "missing").await.is_ok());
        assert!(matches!(
            paper.get_order_status("X", "missing").await,
            Err(GridError::OrderNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(PaperExchange::new(0.0, 0.0).is_err());
        assert!(PaperExchange::new(100.0, 1.5).is_err());
    }
}
