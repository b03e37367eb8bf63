//! Core data types for grid trading

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys (long exposure), -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// Parse an exchange or operator side string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "b" | "bid" => Some(OrderSide::Buy),
            "sell" | "s" | "a" | "ask" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Order type sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Lifecycle of a single order
///
/// `Pending` means the ladder wants the order on the book but the exchange has
/// not acknowledged it yet. Terminal states are only reached through an
/// exchange observation or an operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open)
    }
}

/// Who asked for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderOrigin {
    /// Placed by the ladder (initial fill-out, re-quote or restore)
    Grid,
    /// Injected by an operator `manual_order` command
    Operator,
    /// The one-off market buy that establishes the base position
    InitPosition,
}

/// Bot execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotStatus {
    /// Waiting for the first price to lay out the ladder
    Initializing,
    /// Normal grid operation
    Running,
    /// Shut down by signal
    Stopped,
}

/// A tracked order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Local id, unique for the lifetime of the state file
    pub id: u64,
    /// Exchange order id once acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    /// Ladder level this order occupies, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Limit price (reference price for market orders)
    pub price: f64,
    pub size: f64,
    /// Cumulative filled size observed so far
    #[serde(default)]
    pub filled_size: f64,
    pub status: OrderStatus,
    pub origin: OrderOrigin,
    /// Placement or cancellation attempts that failed at the exchange
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// May only shrink the open position
    #[serde(default)]
    pub reduce_only: bool,
    pub created_at: u64,
}

impl Order {
    pub fn limit(id: u64, level: Option<u32>, side: OrderSide, price: f64, size: f64, origin: OrderOrigin) -> Self {
        Self {
            id,
            exchange_id: None,
            level,
            side,
            kind: OrderKind::Limit,
            price,
            size,
            filled_size: 0.0,
            status: OrderStatus::Pending,
            origin,
            attempts: 0,
            last_error: None,
            reduce_only: false,
            created_at: now_millis(),
        }
    }

    pub fn market(id: u64, side: OrderSide, reference_price: f64, size: f64, origin: OrderOrigin) -> Self {
        Self {
            kind: OrderKind::Market,
            ..Self::limit(id, None, side, reference_price, size, origin)
        }
    }

    /// Pending or open
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Open on the exchange and therefore pollable
    pub fn is_acknowledged(&self) -> bool {
        self.status == OrderStatus::Open && self.exchange_id.is_some()
    }

    /// Build the placement request for this order
    pub fn request(&self) -> OrderRequest {
        OrderRequest {
            client_id: self.id,
            level_index: self.level,
            side: self.side,
            kind: self.kind,
            price: self.price,
            size: self.size,
            reduce_only: self.reduce_only,
        }
    }
}

/// Request to place an order at the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Local order id
    pub client_id: u64,
    /// Level index this order belongs to
    pub level_index: Option<u32>,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: f64,
    pub size: f64,
    pub reduce_only: bool,
}

/// What the exchange reports about an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    /// Cumulative filled size
    pub filled_size: f64,
    /// Average execution price of the filled size
    pub avg_price: Option<f64>,
}

impl OrderStatusReport {
    pub fn open(filled_size: f64, avg_price: Option<f64>) -> Self {
        Self {
            status: OrderStatus::Open,
            filled_size,
            avg_price,
        }
    }

    pub fn filled(filled_size: f64, avg_price: f64) -> Self {
        Self {
            status: OrderStatus::Filled,
            filled_size,
            avg_price: Some(avg_price),
        }
    }

    pub fn cancelled(filled_size: f64) -> Self {
        Self {
            status: OrderStatus::Cancelled,
            filled_size,
            avg_price: None,
        }
    }
}

/// Status of an individual grid level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    /// No order at this level
    Empty,
    /// Order wanted, waiting for exchange acknowledgement
    Pending,
    /// Order resting on the book
    Active,
    /// Cancelled by operator, not re-quoted until restored
    Held,
}

/// Individual grid level tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Index of this level (0 = lowest price)
    pub index: u32,
    /// Price at this level
    pub price: f64,
    /// Side this level quotes when it next gets an order
    pub intended_side: OrderSide,
    /// Default order size at this level
    pub size: f64,
    /// The level's live order, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    /// Operator cancelled this level
    #[serde(default)]
    pub held: bool,
    /// Consecutive placement failures at this level
    #[serde(default)]
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last fill price at this level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fill_price: Option<f64>,
}

impl GridLevel {
    /// Create a new grid level
    pub fn new(index: u32, price: f64, intended_side: OrderSide, size: f64) -> Self {
        Self {
            index,
            price,
            intended_side,
            size,
            order: None,
            held: false,
            failures: 0,
            last_error: None,
            last_fill_price: None,
        }
    }

    /// Check if this level has a pending or open order
    pub fn has_active_order(&self) -> bool {
        self.order.as_ref().is_some_and(Order::is_live)
    }

    pub fn status(&self) -> LevelStatus {
        match &self.order {
            Some(o) if o.status == OrderStatus::Open => LevelStatus::Active,
            Some(o) if o.status == OrderStatus::Pending => LevelStatus::Pending,
            _ if self.held => LevelStatus::Held,
            _ => LevelStatus::Empty,
        }
    }
}

/// Fill event, produced from an exchange status observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Local order id
    pub order_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    pub origin: OrderOrigin,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    /// Fee charged on this fill's notional
    pub fee: f64,
    pub timestamp: u64,
    /// True for the fill that completes the order; only this one re-quotes
    pub terminal: bool,
}

impl Fill {
    /// Notional value of this fill
    pub fn notional(&self, contract_size: f64) -> f64 {
        self.price * self.size * contract_size
    }
}

/// Exchange price limits: buys above `max_buy` or sells below `min_sell` are refused
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBand {
    pub max_buy: f64,
    pub min_sell: f64,
}

impl PriceBand {
    /// Band used when the exchange does not report one: +/-2% around `price`
    pub fn around(price: f64) -> Self {
        Self {
            max_buy: price * 1.02,
            min_sell: price * 0.98,
        }
    }

    /// Whether an order at `price` on `side` is inside the band
    pub fn allows(&self, side: OrderSide, price: f64) -> bool {
        match side {
            OrderSide::Buy => price <= self.max_buy,
            OrderSide::Sell => price >= self.min_sell,
        }
    }
}
