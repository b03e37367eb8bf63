//! Grid state with crash-safe JSON persistence
//!
//! The snapshot is written to a temp file, fsynced and renamed over the
//! primary path, then the same bytes are written the same way to
//! `<path>.bak`. A reader therefore always sees either the previous or the
//! new complete snapshot, and a damaged primary can fall back to the backup.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::commands::{push_bounded, CommandOutcome};
use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::ladder::GridLadder;
use super::ledger::PnlLedger;
use super::types::{now_millis, BotStatus, Fill, PriceBand};

/// Snapshot format version written by this build
pub const STATE_VERSION: u32 = 1;

const MAX_RECENT_FILLS: usize = 300;
const MAX_EQUITY_POINTS: usize = 2000;
const MAX_COMMAND_OUTCOMES: usize = 100;
const MAX_GENERAL_ALERTS: usize = 50;

/// One point of the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: u64,
    pub price: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub position: f64,
}

/// Condition an operator should look at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Level the alert is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    pub message: String,
    pub raised_at: u64,
}

/// Everything that survives a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub version: u32,

    pub symbol: String,

    pub status: BotStatus,

    pub ladder: GridLadder,

    pub ledger: PnlLedger,

    /// Command log lines already applied (the next line to read)
    #[serde(default)]
    pub consumed_offset: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_band: Option<PriceBand>,

    #[serde(default)]
    pub recent_fills: VecDeque<Fill>,

    #[serde(default)]
    pub equity_history: VecDeque<EquityPoint>,

    #[serde(default)]
    pub command_outcomes: VecDeque<CommandOutcome>,

    #[serde(default)]
    pub alerts: Vec<Alert>,

    /// Reconciliation cycles completed
    #[serde(default)]
    pub cycles: u64,

    pub last_updated: u64,

    /// Range the ladder was built from
    config_snapshot: ConfigSnapshot,
}

/// Minimal config snapshot for state validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConfigSnapshot {
    symbol: String,
    lower_price: f64,
    upper_price: f64,
    levels: u32,
}

impl GridState {
    /// State for a first start: ladder laid out but not yet placed
    pub fn fresh(config: &GridConfig) -> Self {
        Self {
            version: STATE_VERSION,
            symbol: config.symbol.clone(),
            status: BotStatus::Initializing,
            ladder: GridLadder::new(config),
            ledger: PnlLedger::new(config.fee_rate, config.contract_size),
            consumed_offset: 0,
            last_price: None,
            price_band: None,
            recent_fills: VecDeque::new(),
            equity_history: VecDeque::new(),
            command_outcomes: VecDeque::new(),
            alerts: Vec::new(),
            cycles: 0,
            last_updated: now_millis(),
            config_snapshot: ConfigSnapshot {
                symbol: config.symbol.clone(),
                lower_price: config.lower_price,
                upper_price: config.upper_price,
                levels: config.levels,
            },
        }
    }

    /// Validate that loaded state matches current config
    pub fn validate_against_config(&self, config: &GridConfig) -> GridResult<()> {
        let snapshot = &self.config_snapshot;
        if snapshot.symbol != config.symbol {
            return Err(GridError::InvalidConfig(format!(
                "State symbol '{}' doesn't match config symbol '{}'",
                snapshot.symbol, config.symbol
            )));
        }

        if (snapshot.lower_price - config.lower_price).abs() > 1e-9
            || (snapshot.upper_price - config.upper_price).abs() > 1e-9
            || snapshot.levels != config.levels
            || !self.ladder.matches_config(config)
        {
            return Err(GridError::InvalidConfig(format!(
                "State grid {}..{} x{} doesn't match config {}..{} x{}",
                snapshot.lower_price,
                snapshot.upper_price,
                snapshot.levels,
                config.lower_price,
                config.upper_price,
                config.levels
            )));
        }
        Ok(())
    }

    pub fn record_fill(&mut self, fill: Fill) {
        push_bounded(&mut self.recent_fills, fill, MAX_RECENT_FILLS);
    }

    pub fn record_command(&mut self, outcome: CommandOutcome) {
        push_bounded(&mut self.command_outcomes, outcome, MAX_COMMAND_OUTCOMES);
    }

    /// Mark the ledger at `price` and append an equity point
    pub fn record_equity(&mut self, price: f64) {
        self.ledger.mark(price);
        let point = EquityPoint {
            timestamp: now_millis(),
            price,
            equity: self.ledger.equity(),
            realized_pnl: self.ledger.realized_pnl(),
            unrealized_pnl: self.ledger.unrealized_pnl(),
            position: self.ledger.net_position(),
        };
        push_bounded(&mut self.equity_history, point, MAX_EQUITY_POINTS);
    }

    /// Raise an alert, replacing any earlier one for the same level.
    ///
    /// Alerts without a level are deduplicated by message and only the most
    /// recent `MAX_GENERAL_ALERTS` are kept.
    pub fn raise_alert(&mut self, level: Option<u32>, message: impl Into<String>) {
        let message = message.into();
        let existing = match level {
            Some(_) => self.alerts.iter_mut().find(|a| a.level == level),
            None => self
                .alerts
                .iter_mut()
                .find(|a| a.level.is_none() && a.message == message),
        };
        if let Some(existing) = existing {
            existing.message = message;
            return;
        }
        warn!("Alert: {}", message);
        self.alerts.push(Alert {
            level,
            message,
            raised_at: now_millis(),
        });

        let general = self.alerts.iter().filter(|a| a.level.is_none()).count();
        let mut excess = general.saturating_sub(MAX_GENERAL_ALERTS);
        self.alerts.retain(|a| {
            if excess > 0 && a.level.is_none() {
                excess -= 1;
                return false;
            }
            true
        });
    }

    /// Keep one level-less alert whose message starts with `prefix`, updated
    /// in place; `None` clears it.
    pub fn update_alert(&mut self, prefix: &str, message: Option<String>) {
        let existing = self
            .alerts
            .iter()
            .position(|a| a.level.is_none() && a.message.starts_with(prefix));
        match (existing, message) {
            (Some(i), Some(message)) => self.alerts[i].message = message,
            (None, Some(message)) => self.raise_alert(None, message),
            (Some(i), None) => {
                info!("Cleared alert: {}", self.alerts[i].message);
                self.alerts.remove(i);
            }
            (None, None) => {}
        }
    }

    /// Drop level alerts for levels no longer in `failing`
    pub fn retain_level_alerts(&mut self, failing: &[u32]) {
        self.alerts
            .retain(|a| a.level.map_or(true, |level| failing.contains(&level)));
    }

    /// Ladder and ledger invariants
    pub fn check_invariants(&self) -> GridResult<()> {
        self.ladder.check_invariants()?;
        self.ledger.check_invariants()
    }

    /// Update timestamp
    pub fn touch(&mut self) {
        self.last_updated = now_millis();
    }
}

/// Where `StateStore::restore` found its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    Primary,
    Backup,
    Fresh,
}

/// Atomic snapshot writer/reader for one state path
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    backup_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let backup_path = with_suffix(&path, ".bak");
        Self { path, backup_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Persist `state` to the primary path, then mirror it to the backup
    pub fn save(&self, state: &GridState) -> GridResult<()> {
        let content = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &content)?;
        if let Err(e) = write_atomic(&self.backup_path, &content) {
            warn!("Failed to refresh state backup {:?}: {}", self.backup_path, e);
        }
        debug!("State saved to {:?}", self.path);
        Ok(())
    }

    /// Read the primary snapshot; `None` if it does not exist
    pub fn load(&self) -> GridResult<Option<GridState>> {
        read_snapshot(&self.path)
    }

    /// Load the primary snapshot, fall back to the backup, or start fresh.
    ///
    /// A readable snapshot built for a different grid is an error: the
    /// operator has to move the old state away explicitly.
    pub fn restore(&self, config: &GridConfig) -> GridResult<(GridState, RestoreSource)> {
        let primary = match read_snapshot(&self.path) {
            Ok(found) => found.map(|s| (s, RestoreSource::Primary)),
            Err(e) => {
                warn!("Primary state unusable: {}, trying backup", e);
                None
            }
        };

        let found = match primary {
            Some(found) => Some(found),
            None => match read_snapshot(&self.backup_path) {
                Ok(found) => found.map(|s| (s, RestoreSource::Backup)),
                Err(e) => {
                    warn!("Backup state unusable: {}", e);
                    None
                }
            },
        };

        match found {
            Some((state, source)) => {
                state.validate_against_config(config)?;
                info!(
                    "Loaded state from {:?}: status={:?}, {} levels, offset={}, realized={:.4}",
                    source,
                    state.status,
                    state.ladder.num_levels(),
                    state.consumed_offset,
                    state.ledger.realized_pnl()
                );
                Ok((state, source))
            }
            None => {
                info!("No usable state at {:?}, starting fresh", self.path);
                Ok((GridState::fresh(config), RestoreSource::Fresh))
            }
        }
    }
}

fn read_snapshot(path: &Path) -> GridResult<Option<GridState>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(corrupt(path, e.to_string())),
    };

    let state: GridState = serde_json::from_slice(&content).map_err(|e| corrupt(path, e.to_string()))?;
    if state.version > STATE_VERSION {
        return Err(corrupt(
            path,
            format!("snapshot version {} is newer than {}", state.version, STATE_VERSION),
        ));
    }
    Ok(Some(state))
}

fn corrupt(path: &Path, reason: String) -> GridError {
    GridError::CorruptState {
        path: path.display().to_string(),
        reason,
    }
}

/// Write to `<path>.tmp`, fsync, rename over `path`
fn write_atomic(path: &Path, content: &[u8]) -> GridResult<()> {
    let temp_path = with_suffix(path, ".tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)?;

    // Persist the rename itself where the platform allows opening directories
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
