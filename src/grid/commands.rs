//! Operator command log
//!
//! Operators append one JSON object per line to the command log. The engine
//! never rewrites the file; it remembers how many lines it has consumed
//! (the offset lives in the state snapshot) and only reads past that point.
//!
//! ```text
//! {"type":"cancel_level","params":{"level":7},"issued_at":"2024-05-01T12:00:00Z"}
//! {"type":"restore_level","params":{"price":10700}}
//! {"op":"place_limit","side":"buy","price":10650,"contracts":1}
//! ```

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{GridError, GridResult};
use super::ladder::{GridLadder, RestoreOutcome};
use super::state::GridState;
use super::types::{now_millis, OrderSide};

/// A command as written by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
}

impl CommandRecord {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params: match params {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            issued_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Parse one log line.
    ///
    /// Accepts `{"type": .., "params": {..}}` as well as the flat form where
    /// the name is under `op` and parameters sit next to it.
    pub fn parse_line(line: &str) -> GridResult<Self> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut obj) = value else {
            return Err(GridError::Validation("command must be a JSON object".into()));
        };

        let kind = match obj.remove("type").or_else(|| obj.remove("op")) {
            Some(Value::String(kind)) => kind,
            _ => return Err(GridError::Validation("command has no type".into())),
        };
        let issued_at = match obj.remove("issued_at") {
            Some(Value::String(ts)) => Some(ts),
            _ => None,
        };
        let params = match obj.remove("params") {
            Some(Value::Object(params)) => params,
            Some(_) => return Err(GridError::Validation("params must be an object".into())),
            None => obj,
        };

        Ok(Self {
            kind,
            params,
            issued_at,
        })
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// Validated operator command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    CancelAll,
    CancelLevel { level: u32 },
    RestoreLevel { level: u32 },
    ManualOrder {
        side: OrderSide,
        price: f64,
        size: f64,
        /// Defaults to true for sells
        reduce_only: bool,
    },
}

impl Command {
    /// Resolve a record against the ladder. Levels may be addressed by
    /// `level` index or by `price`.
    pub fn from_record(record: &CommandRecord, ladder: &GridLadder) -> GridResult<Self> {
        match record.kind.as_str() {
            "cancel_all" => Ok(Command::CancelAll),
            "cancel_level" | "cancel_by_price" | "hold_level" | "cancel_and_hold" => {
                Ok(Command::CancelLevel {
                    level: resolve_level(record, ladder)?,
                })
            }
            "restore_level" => Ok(Command::RestoreLevel {
                level: resolve_level(record, ladder)?,
            }),
            "manual_order" | "place_limit" => {
                let side = record
                    .string("side")
                    .and_then(OrderSide::parse)
                    .ok_or_else(|| GridError::Validation("manual_order needs side buy|sell".into()))?;
                let price = record
                    .number("price")
                    .ok_or_else(|| GridError::Validation("manual_order needs a numeric price".into()))?;
                let size = record
                    .number("size")
                    .or_else(|| record.number("contracts"))
                    .ok_or_else(|| GridError::Validation("manual_order needs a numeric size".into()))?;
                if !(price.is_finite() && price > 0.0) || !(size.is_finite() && size > 0.0) {
                    return Err(GridError::Validation(format!(
                        "manual_order price and size must be positive (price={}, size={})",
                        price, size
                    )));
                }
                let reduce_only = record
                    .flag("reduce_only")
                    .or_else(|| record.flag("reduceOnly"))
                    .unwrap_or(side == OrderSide::Sell);
                Ok(Command::ManualOrder {
                    side,
                    price,
                    size,
                    reduce_only,
                })
            }
            other => Err(GridError::Validation(format!("unknown command type '{}'", other))),
        }
    }
}

fn resolve_level(record: &CommandRecord, ladder: &GridLadder) -> GridResult<u32> {
    if let Some(value) = record.params.get("level") {
        let index = value
            .as_u64()
            .ok_or_else(|| GridError::Validation(format!("level must be a non-negative integer, got {}", value)))?;
        return match u32::try_from(index) {
            Ok(index) if index < ladder.num_levels() => Ok(index),
            _ => Err(GridError::LevelNotFound(index.min(u32::MAX as u64) as u32)),
        };
    }

    let price = record
        .number("price")
        .ok_or_else(|| GridError::Validation(format!("{} needs level or price", record.kind)))?;
    ladder
        .level_at_price(price)
        .ok_or_else(|| GridError::Validation(format!("price {} is not a grid level", price)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Applied,
    Rejected,
}

/// Outcome of one consumed log line, kept in the state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Zero-based line number in the command log
    pub offset: u64,
    pub kind: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub processed_at: u64,
}

/// A complete (newline-terminated) line of the command log
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub offset: u64,
    pub line: String,
}

/// Reader (and test writer) for the append-only command log
#[derive(Debug, Clone)]
pub struct CommandLog {
    path: PathBuf,
}

impl CommandLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Complete lines at or after `offset`. A trailing line without a newline
    /// is still being written and is left for a later read.
    pub fn read_from(&self, offset: u64) -> GridResult<Vec<LogEntry>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GridError::CommandLog(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut segments: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
        // Whatever follows the last newline is incomplete (or empty)
        segments.pop();

        if (segments.len() as u64) < offset {
            warn!(
                "Command log {} has {} lines but {} were consumed; ignoring until it grows",
                self.path.display(),
                segments.len(),
                offset
            );
            return Ok(Vec::new());
        }

        Ok(segments
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(i, raw)| LogEntry {
                offset: i as u64,
                line: String::from_utf8_lossy(raw).trim().to_string(),
            })
            .collect())
    }

    /// Append one command as a complete line
    pub fn append(&self, record: &CommandRecord) -> GridResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GridError::CommandLog(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| GridError::CommandLog(e.to_string()))?;
        Ok(())
    }
}

/// Summary of one processing pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReport {
    pub applied: usize,
    pub rejected: usize,
    /// Commands refused because they would break a ladder invariant
    pub violations: Vec<String>,
}

impl ProcessReport {
    pub fn consumed(&self) -> usize {
        self.applied + self.rejected
    }
}

/// Applies new command log lines to the grid state
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    log: CommandLog,
}

impl CommandProcessor {
    pub fn new(log: CommandLog) -> Self {
        Self { log }
    }

    /// Apply every unconsumed line in order and advance the consumed offset.
    ///
    /// Invalid lines are consumed and recorded as rejected. Nothing here
    /// touches the exchange: resulting placements and cancellations are
    /// left on the ladder for the next reconciliation pass.
    pub fn process(&self, state: &mut GridState, current_price: Option<f64>) -> GridResult<ProcessReport> {
        let entries = self.log.read_from(state.consumed_offset)?;
        let mut report = ProcessReport::default();

        for entry in entries {
            let (kind, result) = if entry.line.is_empty() {
                (String::new(), Err(GridError::Validation("empty line".into())))
            } else {
                match CommandRecord::parse_line(&entry.line) {
                    Ok(record) => {
                        let result = Command::from_record(&record, &state.ladder)
                            .and_then(|cmd| apply(&mut state.ladder, cmd, current_price));
                        (record.kind, result)
                    }
                    Err(e) => (String::new(), Err(e)),
                }
            };

            let outcome = match result {
                Ok(detail) => {
                    info!("Command #{} {} applied: {}", entry.offset, kind, detail);
                    report.applied += 1;
                    CommandOutcome {
                        offset: entry.offset,
                        kind,
                        status: CommandStatus::Applied,
                        detail: Some(detail),
                        processed_at: now_millis(),
                    }
                }
                Err(e) => {
                    warn!("Command #{} {} rejected: {}", entry.offset, kind, e);
                    report.rejected += 1;
                    if matches!(e, GridError::InvariantViolation(_)) {
                        report.violations.push(e.to_string());
                    }
                    CommandOutcome {
                        offset: entry.offset,
                        kind,
                        status: CommandStatus::Rejected,
                        detail: Some(e.to_string()),
                        processed_at: now_millis(),
                    }
                }
            };

            state.record_command(outcome);
            state.consumed_offset = entry.offset + 1;
        }

        Ok(report)
    }
}

fn apply(ladder: &mut GridLadder, command: Command, current_price: Option<f64>) -> GridResult<String> {
    match command {
        Command::CancelAll => {
            let count = ladder.cancel_all();
            Ok(format!("{} orders withdrawn, all levels held", count))
        }
        Command::CancelLevel { level } => match ladder.cancel_level(level)? {
            Some(order) => Ok(format!("level {} held, order {} withdrawn", level, order.id)),
            None => Ok(format!("level {} held", level)),
        },
        Command::RestoreLevel { level } => match ladder.restore_level(level, current_price)? {
            RestoreOutcome::Placed(side) => Ok(format!("level {} restored with a {}", level, side.as_str())),
            RestoreOutcome::AlreadyActive => Ok(format!("level {} released, order already live", level)),
        },
        Command::ManualOrder {
            side,
            price,
            size,
            reduce_only,
        } => {
            let id = ladder.manual_order(side, price, size, reduce_only)?;
            let suffix = if reduce_only { " (reduce-only)" } else { "" };
            Ok(format!("order {} queued: {} {} @ {}{}", id, side.as_str(), size, price, suffix))
        }
    }
}

/// Keep the newest `cap` entries
pub(crate) fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::config::GridConfig;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    fn initialized_state() -> GridState {
        let config = GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 0.5);
        let mut state = GridState::fresh(&config);
        state.ladder.initialize(11000.0, false).unwrap();
        state
    }

    fn write_raw(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_nested_and_flat_forms() {
        let nested = CommandRecord::parse_line(r#"{"type":"cancel_level","params":{"level":7}}"#).unwrap();
        assert_eq!(nested.kind, "cancel_level");
        assert_eq!(nested.params.get("level"), Some(&json!(7)));

        let flat = CommandRecord::parse_line(r#"{"op":"place_limit","side":"buy","price":10650,"contracts":1}"#).unwrap();
        assert_eq!(flat.kind, "place_limit");
        assert_eq!(flat.number("contracts"), Some(1.0));

        assert!(CommandRecord::parse_line("not json").is_err());
        assert!(CommandRecord::parse_line(r#"{"params":{}}"#).is_err());
    }

    #[test]
    fn test_command_resolution() {
        let state = initialized_state();
        let ladder = &state.ladder;

        let by_price = CommandRecord::new("hold_level", json!({"price": 10700.0}));
        assert_eq!(Command::from_record(&by_price, ladder), Ok(Command::CancelLevel { level: 7 }));

        let off_grid = CommandRecord::new("cancel_level", json!({"price": 10750.0}));
        assert!(matches!(Command::from_record(&off_grid, ladder), Err(GridError::Validation(_))));

        let out_of_range = CommandRecord::new("restore_level", json!({"level": 21}));
        assert_eq!(Command::from_record(&out_of_range, ladder), Err(GridError::LevelNotFound(21)));

        let manual = CommandRecord::new("place_limit", json!({"side": "sell", "price": 11050.0, "contracts": 2}));
        assert_eq!(
            Command::from_record(&manual, ladder),
            Ok(Command::ManualOrder {
                side: OrderSide::Sell,
                price: 11050.0,
                size: 2.0,
                reduce_only: true
            })
        );

        let opening_sell = CommandRecord::new(
            "place_limit",
            json!({"side": "sell", "price": 11050.0, "size": 1, "reduceOnly": false}),
        );
        assert!(matches!(
            Command::from_record(&opening_sell, ladder),
            Ok(Command::ManualOrder { reduce_only: false, .. })
        ));

        let buy = CommandRecord::new("manual_order", json!({"side": "buy", "price": 10950.0, "size": 1}));
        assert!(matches!(
            Command::from_record(&buy, ladder),
            Ok(Command::ManualOrder { reduce_only: false, .. })
        ));

        let negative = CommandRecord::new("manual_order", json!({"side": "buy", "price": 100.0, "size": -1}));
        assert!(matches!(Command::from_record(&negative, ladder), Err(GridError::Validation(_))));

        let unknown = CommandRecord::new("liquidate", json!({}));
        assert!(matches!(Command::from_record(&unknown, ladder), Err(GridError::Validation(_))));
    }

    #[test]
    fn test_partial_trailing_line_is_not_consumed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        write_raw(
            &path,
            "{\"type\":\"cancel_level\",\"params\":{\"level\":1}}\n{\"type\":\"cancel_le",
        );

        let log = CommandLog::new(&path);
        let entries = log.read_from(0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 0);

        // The writer finishes its line
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"vel\",\"params\":{\"level\":2}}\n").unwrap();
        let entries = log.read_from(1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 1);
        assert!(entries[0].line.contains("\"level\":2"));
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let log = CommandLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_from(0).unwrap().is_empty());
    }

    #[test]
    fn test_process_applies_in_order_and_advances_offset() {
        let dir = tempdir().unwrap();
        let log = CommandLog::new(dir.path().join("commands.jsonl"));
        log.append(&CommandRecord::new("cancel_level", json!({"level": 7}))).unwrap();
        log.append(&CommandRecord::new("restore_level", json!({"level": 7}))).unwrap();

        let processor = CommandProcessor::new(log.clone());
        let mut state = initialized_state();
        let original = state.ladder.level(7).and_then(|l| l.order.clone()).unwrap();

        let report = processor.process(&mut state, Some(11000.0)).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(state.consumed_offset, 2);

        let level = state.ladder.level(7).unwrap();
        assert!(!level.held);
        let restored = level.order.clone().unwrap();
        assert_eq!(restored.side, OrderSide::Buy);
        assert_ne!(restored.id, original.id);

        // Nothing new: no effect
        let report = processor.process(&mut state, Some(11000.0)).unwrap();
        assert_eq!(report.consumed(), 0);
        assert_eq!(state.command_outcomes.len(), 2);
    }

    #[test]
    fn test_malformed_lines_are_consumed_and_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        write_raw(
            &path,
            "garbage\n\n{\"type\":\"cancel_level\",\"params\":{\"level\":99}}\n{\"type\":\"cancel_all\"}\n",
        );

        let processor = CommandProcessor::new(CommandLog::new(&path));
        let mut state = initialized_state();
        let report = processor.process(&mut state, None).unwrap();

        assert_eq!(report.rejected, 3);
        assert_eq!(report.applied, 1);
        assert_eq!(state.consumed_offset, 4);
        let statuses: Vec<_> = state.command_outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                CommandStatus::Rejected,
                CommandStatus::Rejected,
                CommandStatus::Rejected,
                CommandStatus::Applied
            ]
        );
        assert!(state.ladder.levels().iter().all(|l| l.held));
    }

    #[test]
    fn test_manual_order_on_occupied_level_is_a_violation() {
        let dir = tempdir().unwrap();
        let log = CommandLog::new(dir.path().join("commands.jsonl"));
        log.append(&CommandRecord::new(
            "manual_order",
            json!({"side": "buy", "price": 10500.0, "size": 1.0}),
        ))
        .unwrap();

        let processor = CommandProcessor::new(log);
        let mut state = initialized_state();
        let report = processor.process(&mut state, Some(11000.0)).unwrap();

        assert_eq!(report.rejected, 1);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(state.consumed_offset, 1);
        assert!(state.ladder.check_invariants().is_ok());
    }

    #[test]
    fn test_push_bounded() {
        let mut queue = VecDeque::new();
        for i in 0..5 {
            push_bounded(&mut queue, i, 3);
        }
        assert_eq!(queue, VecDeque::from(vec![2, 3, 4]));
    }
}
