#![deny(unreachable_pub)]
pub mod config;
pub mod grid;

pub use config::Settings;
pub use grid::{GridConfig, GridError, GridResult, GridRunner, RuntimeConfig};
