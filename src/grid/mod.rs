//! Grid trading engine
//!
//! Maintains a ladder of limit orders over a fixed price range, re-quotes
//! the opposite side one level away whenever an order fills, books fills
//! into a FIFO PnL ledger and persists everything after each cycle.
//!
//! # Architecture
//!
//! - [`config`] - Grid and runtime configuration and validation
//! - [`types`] - Core data types (Order, GridLevel, Fill, etc.)
//! - [`errors`] - Grid-specific error types
//! - [`ladder`] - Level layout, order assignment and fill handling
//! - [`ledger`] - FIFO inventory and PnL accounting
//! - [`state`] - Persisted state and the atomic snapshot store
//! - [`commands`] - Append-only operator command log
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`paper`] - Simulated exchange for paper trading
//! - [`runner`] - Reconciliation loop
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grid_engine::grid::{GridConfig, GridRunner, PaperExchange, RuntimeConfig};
//!
//! let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 0.5);
//! let exchange = Arc::new(PaperExchange::new(11000.0, 0.001)?);
//! let mut runner = GridRunner::new(config, RuntimeConfig::default(), exchange)?;
//!
//! let (_tx, rx) = tokio::sync::watch::channel(false);
//! runner.run(rx).await?;
//! ```
//!
//! Operators steer a live grid by appending JSON lines to the command log:
//!
//! ```text
//! {"type":"cancel_level","params":{"level":7}}
//! {"type":"restore_level","params":{"level":7}}
//! ```

pub mod commands;
pub mod config;
pub mod errors;
pub mod executor;
pub mod ladder;
pub mod ledger;
pub mod paper;
pub mod runner;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use commands::{Command, CommandLog, CommandProcessor, CommandRecord, CommandStatus};
pub use config::{GridConfig, RuntimeConfig};
pub use errors::{GridError, GridResult};
pub use executor::ExchangeAdapter;
pub use ladder::{FillOutcome, GridLadder, InitPositionStatus};
pub use ledger::{InventoryLot, PnlLedger};
pub use paper::PaperExchange;
pub use runner::{CycleReport, GridRunner, MarketCache};
pub use state::{GridState, RestoreSource, StateStore};
pub use types::{
    BotStatus, Fill, GridLevel, LevelStatus, Order, OrderKind, OrderOrigin, OrderRequest,
    OrderSide, OrderStatus, OrderStatusReport, PriceBand,
};
