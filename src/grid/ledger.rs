//! FIFO inventory accounting
//!
//! Every fill either opens inventory in the current direction or closes the
//! oldest open lots first. Realized PnL is booked on the closed quantity,
//! net of the entry and exit fees attributable to it. Unrealized PnL is
//! marked against the latest price and never accumulated fill-by-fill.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};
use super::types::{Fill, OrderSide};

/// Sizes below this are treated as fully consumed
const SIZE_EPSILON: f64 = 1e-12;

/// One open inventory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLot {
    /// Direction of the exposure (buy = long)
    pub side: OrderSide,
    /// Remaining contracts
    pub size: f64,
    pub entry_price: f64,
    /// Entry fee still attributable to the remaining size
    pub entry_fee: f64,
    pub opened_at: u64,
}

/// Realized/unrealized PnL from a stream of fills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlLedger {
    fee_rate: f64,
    contract_size: f64,
    lots: VecDeque<InventoryLot>,
    realized_pnl: f64,
    unrealized_pnl: f64,
    total_fees: f64,
    total_volume: f64,
    round_trips: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mark_price: Option<f64>,
}

impl PnlLedger {
    pub fn new(fee_rate: f64, contract_size: f64) -> Self {
        Self {
            fee_rate,
            contract_size,
            lots: VecDeque::new(),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_fees: 0.0,
            total_volume: 0.0,
            round_trips: 0,
            mark_price: None,
        }
    }

    /// Fee charged on a fill of `size` contracts at `price`
    pub fn fee_for(&self, price: f64, size: f64) -> f64 {
        self.fee_rate * price * size * self.contract_size
    }

    /// Book a fill and return the realized PnL it produced.
    ///
    /// On error the ledger is left untouched.
    pub fn apply(&mut self, fill: &Fill) -> GridResult<f64> {
        if !(fill.size.is_finite() && fill.size > 0.0) {
            return Err(GridError::InvariantViolation(format!(
                "fill for order {} has non-positive size {}",
                fill.order_id, fill.size
            )));
        }
        if !(fill.price.is_finite() && fill.price > 0.0) {
            return Err(GridError::InvariantViolation(format!(
                "fill for order {} has invalid price {}",
                fill.order_id, fill.price
            )));
        }
        if !(fill.fee.is_finite() && fill.fee >= 0.0) {
            return Err(GridError::InvariantViolation(format!(
                "fill for order {} has invalid fee {}",
                fill.order_id, fill.fee
            )));
        }

        let mut lots = self.lots.clone();
        let mut remaining = fill.size;
        let mut realized = 0.0;
        let mut closed_any = false;

        while remaining > SIZE_EPSILON {
            let Some(front) = lots.front_mut() else {
                break;
            };
            if front.side == fill.side {
                break;
            }

            let matched = remaining.min(front.size);
            let entry_fee = front.entry_fee * matched / front.size;
            let exit_fee = fill.fee * matched / fill.size;
            realized += (fill.price - front.entry_price) * matched * front.side.sign() * self.contract_size
                - entry_fee
                - exit_fee;

            front.size -= matched;
            front.entry_fee -= entry_fee;
            remaining -= matched;
            closed_any = true;

            if front.size <= SIZE_EPSILON {
                lots.pop_front();
            }
        }

        // Whatever was not matched opens (or extends) inventory on the fill's side
        if remaining > SIZE_EPSILON {
            lots.push_back(InventoryLot {
                side: fill.side,
                size: remaining,
                entry_price: fill.price,
                entry_fee: fill.fee * remaining / fill.size,
                opened_at: fill.timestamp,
            });
        }

        Self::check_lots(&lots)?;

        self.lots = lots;
        self.realized_pnl += realized;
        self.total_fees += fill.fee;
        self.total_volume += fill.notional(self.contract_size);
        if closed_any {
            self.round_trips += 1;
        }
        if let Some(price) = self.mark_price {
            self.mark(price);
        }

        Ok(realized)
    }

    /// Re-mark open inventory at `price`
    pub fn mark(&mut self, price: f64) {
        self.mark_price = Some(price);
        self.unrealized_pnl = self
            .lots
            .iter()
            .map(|lot| (price - lot.entry_price) * lot.size * lot.side.sign() * self.contract_size)
            .sum();
    }

    /// Signed open position in contracts (positive = long)
    pub fn net_position(&self) -> f64 {
        self.lots.iter().map(|lot| lot.size * lot.side.sign()).sum()
    }

    /// Size-weighted entry price of open inventory
    pub fn avg_entry_price(&self) -> Option<f64> {
        let size: f64 = self.lots.iter().map(|lot| lot.size).sum();
        if size <= SIZE_EPSILON {
            return None;
        }
        let cost: f64 = self.lots.iter().map(|lot| lot.size * lot.entry_price).sum();
        Some(cost / size)
    }

    pub fn lots(&self) -> &VecDeque<InventoryLot> {
        &self.lots
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.unrealized_pnl
    }

    pub fn equity(&self) -> f64 {
        self.realized_pnl + self.unrealized_pnl
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub fn round_trips(&self) -> u32 {
        self.round_trips
    }

    pub fn check_invariants(&self) -> GridResult<()> {
        Self::check_lots(&self.lots)
    }

    fn check_lots(lots: &VecDeque<InventoryLot>) -> GridResult<()> {
        let Some(first) = lots.front() else {
            return Ok(());
        };
        for lot in lots {
            if !(lot.size.is_finite() && lot.size > 0.0) {
                return Err(GridError::InvariantViolation(format!(
                    "inventory lot with non-positive size {}",
                    lot.size
                )));
            }
            if lot.side != first.side {
                return Err(GridError::InvariantViolation(
                    "inventory holds lots on both sides".into(),
                ));
            }
        }
        Ok(())
    }
}
