//! Grid trading configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Ladder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Instrument to trade (e.g., "BTC-USDT-SWAP")
    pub symbol: String,

    /// Lower price boundary for the grid
    pub lower_price: f64,

    /// Upper price boundary for the grid
    pub upper_price: f64,

    /// Number of grid intervals (creates levels + 1 price points)
    pub levels: u32,

    /// Contracts per grid order
    pub order_size: f64,

    /// Market-buy the aggregate sell size at startup
    #[serde(default)]
    pub init_position: bool,

    /// Fee charged on every fill's notional
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Base units per contract
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,

    /// Decimal places level prices are rounded to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_decimals: Option<u32>,
}

fn default_fee_rate() -> f64 {
    0.0005
}

fn default_contract_size() -> f64 {
    1.0
}

impl GridConfig {
    /// Create a new grid configuration with required parameters
    pub fn new(
        symbol: impl Into<String>,
        lower_price: f64,
        upper_price: f64,
        levels: u32,
        order_size: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            lower_price,
            upper_price,
            levels,
            order_size,
            init_position: false,
            fee_rate: default_fee_rate(),
            contract_size: default_contract_size(),
            price_decimals: None,
        }
    }

    /// Builder: enable or disable the initial market buy
    pub fn with_init_position(mut self, enabled: bool) -> Self {
        self.init_position = enabled;
        self
    }

    /// Builder: set fee rate
    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Builder: set contract size
    pub fn with_contract_size(mut self, contract_size: f64) -> Self {
        self.contract_size = contract_size;
        self
    }

    /// Builder: round level prices to this many decimals
    pub fn with_price_decimals(mut self, decimals: u32) -> Self {
        self.price_decimals = Some(decimals);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if !self.lower_price.is_finite() || self.lower_price <= 0.0 {
            return Err(GridError::InvalidConfig(
                "lower_price must be a positive number".into(),
            ));
        }

        if !self.upper_price.is_finite() || self.lower_price >= self.upper_price {
            return Err(GridError::InvalidConfig(
                "lower_price must be less than upper_price".into(),
            ));
        }

        if self.levels < 1 {
            return Err(GridError::InvalidConfig("levels must be at least 1".into()));
        }

        if !self.order_size.is_finite() || self.order_size <= 0.0 {
            return Err(GridError::InvalidConfig("order_size must be positive".into()));
        }

        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(GridError::InvalidConfig(
                "fee_rate must be in [0.0, 1.0)".into(),
            ));
        }

        if self.contract_size <= 0.0 {
            return Err(GridError::InvalidConfig(
                "contract_size must be positive".into(),
            ));
        }

        if let Some(decimals) = self.price_decimals {
            if decimals > 12 {
                return Err(GridError::InvalidConfig(
                    "price_decimals must be at most 12".into(),
                ));
            }
            // Rounding must not merge neighbouring levels
            let mut previous = self.level_price(0);
            for index in 1..=self.levels {
                let price = self.level_price(index);
                if price <= previous {
                    return Err(GridError::InvalidConfig(format!(
                        "price_decimals {} collapses level {} onto level {} ({})",
                        decimals,
                        index,
                        index - 1,
                        price
                    )));
                }
                previous = price;
            }
        }

        Ok(())
    }

    /// Calculate the price step between grid levels
    pub fn price_step(&self) -> f64 {
        (self.upper_price - self.lower_price) / self.levels as f64
    }

    /// Calculate total number of price points (levels + 1)
    pub fn num_levels(&self) -> u32 {
        self.levels + 1
    }

    /// Price of level `index` before any exchange precision is applied
    pub fn level_price(&self, index: u32) -> f64 {
        self.round_price(self.lower_price + self.price_step() * index as f64)
    }

    /// Round a price to `price_decimals`, if configured
    pub fn round_price(&self, price: f64) -> f64 {
        match self.price_decimals {
            Some(decimals) => {
                let factor = 10f64.powi(decimals as i32);
                (price * factor).round() / factor
            }
            None => price,
        }
    }

    /// Check if price is within grid range
    pub fn is_price_in_range(&self, price: f64) -> bool {
        price >= self.lower_price && price <= self.upper_price
    }
}

/// Loop timing, file locations and failure policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Persisted state snapshot
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Append-only operator command log
    #[serde(default = "default_commands_path")]
    pub commands_path: PathBuf,

    /// Sleep between reconciliation cycles
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// Minimum spacing of full REST reconciliation (order status + placements)
    #[serde(default = "default_full_reconcile_interval_ms")]
    pub full_reconcile_interval_ms: u64,

    /// Cached price and price band older than this are refreshed before use
    #[serde(default = "default_band_ttl_ms")]
    pub band_ttl_ms: u64,

    /// Upper bound on any single exchange call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Log a heartbeat every N cycles (0 disables)
    #[serde(default = "default_heartbeat_every")]
    pub heartbeat_every: u64,

    /// Placement failures at one level before it is reported in state
    #[serde(default = "default_failure_report_threshold")]
    pub failure_report_threshold: u32,

    /// Stop the loop on an invariant violation instead of skipping the mutation
    #[serde(default)]
    pub halt_on_invariant_violation: bool,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("grid_state.json")
}

fn default_commands_path() -> PathBuf {
    PathBuf::from("grid_commands.jsonl")
}

fn default_loop_interval_ms() -> u64 {
    2000
}

fn default_full_reconcile_interval_ms() -> u64 {
    2000
}

fn default_band_ttl_ms() -> u64 {
    8000
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_every() -> u64 {
    20
}

fn default_failure_report_threshold() -> u32 {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            commands_path: default_commands_path(),
            loop_interval_ms: default_loop_interval_ms(),
            full_reconcile_interval_ms: default_full_reconcile_interval_ms(),
            band_ttl_ms: default_band_ttl_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            heartbeat_every: default_heartbeat_every(),
            failure_report_threshold: default_failure_report_threshold(),
            halt_on_invariant_violation: false,
        }
    }
}

impl RuntimeConfig {
    /// Builder: place state and command files under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            state_path: dir.join("grid_state.json"),
            commands_path: dir.join("grid_commands.jsonl"),
            ..Self::default()
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn full_reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.full_reconcile_interval_ms)
    }

    pub fn band_ttl(&self) -> Duration {
        Duration::from_millis(self.band_ttl_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.call_timeout_ms == 0 {
            return Err(GridError::InvalidConfig(
                "call_timeout_ms must be positive".into(),
            ));
        }
        if self.failure_report_threshold == 0 {
            return Err(GridError::InvalidConfig(
                "failure_report_threshold must be at least 1".into(),
            ));
        }
        if self.state_path == self.commands_path {
            return Err(GridError::InvalidConfig(
                "state_path and commands_path must differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 1.0);
        assert!(config.validate().is_ok());

        // Invalid: lower >= upper
        let config = GridConfig::new("BTC-USDT-SWAP", 12000.0, 10000.0, 20, 1.0);
        assert!(config.validate().is_err());

        // Invalid: no intervals
        let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 0, 1.0);
        assert!(config.validate().is_err());

        // Invalid: order_size <= 0
        let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 0.0);
        assert!(config.validate().is_err());

        // Invalid: empty symbol
        let config = GridConfig::new("", 10000.0, 12000.0, 20, 1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_price_step_and_levels() {
        let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 1.0);
        assert!((config.price_step() - 100.0).abs() < 1e-9);
        assert_eq!(config.num_levels(), 21);
        assert!((config.level_price(0) - 10000.0).abs() < 1e-9);
        assert!((config.level_price(20) - 12000.0).abs() < 1e-9);
    }

    #[test]
    fn test_price_rounding() {
        let config = GridConfig::new("ETH-USDT-SWAP", 100.0, 200.0, 3, 1.0).with_price_decimals(2);
        assert!((config.level_price(1) - 133.33).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rounding_that_merges_levels_is_rejected() {
        // Step of 0.006 rounds several neighbours onto the same cent
        let config = GridConfig::new("X", 100.0, 100.06, 10, 1.0).with_price_decimals(2);
        match config.validate() {
            Err(GridError::InvalidConfig(msg)) => assert!(msg.contains("collapses"), "{}", msg),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }

        // Same range with enough precision is fine
        let config = GridConfig::new("X", 100.0, 100.06, 10, 1.0).with_price_decimals(3);
        assert!(config.validate().is_ok());

        // A step that rounds to zero is caught by the same check
        let config = GridConfig::new("X", 100.0, 100.004, 4, 1.0).with_price_decimals(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_defaults() {
        let runtime: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(runtime, RuntimeConfig::default());
        assert_eq!(runtime.band_ttl(), Duration::from_secs(8));
        assert!(runtime.validate().is_ok());
    }
}
