use config::{Config, Environment, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{GridConfig, RuntimeConfig};

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Venue and instrument
    pub exchange: ExchangeSettings,
    /// Ladder parameters
    pub grid: GridSettings,
    /// Loop timing, file locations and failure policy
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    /// Instrument to trade (e.g., "BTC-USDT-SWAP")
    pub symbol: String,
    /// Mode: only "paper" is built in
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Starting price of the simulated market
    #[serde(default)]
    pub paper_start_price: Option<f64>,
    /// Max relative price move per poll in paper mode
    #[serde(default)]
    pub paper_volatility: f64,
}

fn default_mode() -> String {
    "paper".to_string()
}

/// `[grid]` section; the symbol comes from `[exchange]`
#[derive(Debug, Clone, Deserialize)]
pub struct GridSettings {
    pub lower_price: f64,
    pub upper_price: f64,
    pub levels: u32,
    pub order_size: f64,
    #[serde(default)]
    pub init_position: bool,
    #[serde(default)]
    pub fee_rate: Option<f64>,
    #[serde(default)]
    pub contract_size: Option<f64>,
    #[serde(default)]
    pub price_decimals: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment overrides the file, e.g. GRID__GRID__LEVELS=40
            .add_source(Environment::with_prefix("GRID").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Ladder configuration assembled from `[exchange]` and `[grid]`
    pub fn grid_config(&self) -> GridConfig {
        let grid = &self.grid;
        let mut config = GridConfig::new(
            self.exchange.symbol.clone(),
            grid.lower_price,
            grid.upper_price,
            grid.levels,
            grid.order_size,
        )
        .with_init_position(grid.init_position);

        if let Some(fee_rate) = grid.fee_rate {
            config = config.with_fee_rate(fee_rate);
        }
        if let Some(contract_size) = grid.contract_size {
            config = config.with_contract_size(contract_size);
        }
        if let Some(decimals) = grid.price_decimals {
            config = config.with_price_decimals(decimals);
        }
        config
    }

    /// Price the paper exchange starts from: configured, else the range midpoint
    pub fn paper_start_price(&self) -> f64 {
        self.exchange
            .paper_start_price
            .unwrap_or((self.grid.lower_price + self.grid.upper_price) / 2.0)
    }
}
