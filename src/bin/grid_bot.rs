//! Grid Trading Bot Binary
//!
//! Runs the grid engine against the built-in paper exchange.
//!
//! ## Setup
//!
//! 1. Create a config file (TOML, YAML or JSON):
//!    ```toml
//!    [exchange]
//!    symbol = "BTC-USDT-SWAP"
//!    paper_volatility = 0.001
//!
//!    [grid]
//!    lower_price = 10000.0
//!    upper_price = 12000.0
//!    levels = 20
//!    order_size = 0.5
//!    ```
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- grid.toml
//!    ```
//!
//! Any key can be overridden from the environment or a `.env` file,
//! e.g. `GRID__GRID__LEVELS=40` or `GRID__RUNTIME__STATE_PATH=/var/lib/grid.json`.
//! Ctrl-C stops the loop after the current step and writes a final snapshot.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::watch;

use grid_engine::grid::{GridRunner, PaperExchange};
use grid_engine::Settings;

#[tokio::main]
async fn main() {
    // Load .env file before reading configuration so it can override keys
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("grid.toml");

    let settings = match Settings::new(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config '{}': {}", config_path, e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str())).init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    if settings.exchange.mode != "paper" {
        error!(
            "Unsupported exchange mode '{}': only 'paper' is built in",
            settings.exchange.mode
        );
        std::process::exit(1);
    }

    let grid_config = settings.grid_config();
    info!("Grid range: {} - {}", grid_config.lower_price, grid_config.upper_price);
    info!(
        "Levels: {} intervals, step {:.4}, size {}",
        grid_config.levels,
        grid_config.price_step(),
        grid_config.order_size
    );
    info!(
        "State: {:?}, commands: {:?}",
        settings.runtime.state_path, settings.runtime.commands_path
    );

    let exchange = match PaperExchange::new(settings.paper_start_price(), settings.exchange.paper_volatility) {
        Ok(exchange) => Arc::new(exchange),
        Err(e) => {
            error!("Failed to create paper exchange: {}", e);
            std::process::exit(1);
        }
    };

    let mut runner = match GridRunner::new(grid_config, settings.runtime.clone(), exchange) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Failed to start grid engine: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!("Failed to listen for Ctrl-C: {}", e);
                // Keep the sender alive so the loop is not stopped by a dropped channel
                std::future::pending::<()>().await;
            }
        }
    });

    if let Err(e) = runner.run(shutdown_rx).await {
        error!("Grid engine exited with error: {}", e);
        std::process::exit(1);
    }

    let state = runner.state();
    info!(
        "Final: position={:.4} realized={:.4} unrealized={:.4} fees={:.4} round_trips={}",
        state.ledger.net_position(),
        state.ledger.realized_pnl(),
        state.ledger.unrealized_pnl(),
        state.ledger.total_fees(),
        state.ledger.round_trips()
    );
}
