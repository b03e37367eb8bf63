//! Grid ladder - level layout, order assignment and fill handling
//!
//! The ladder owns every order the engine knows about. It never talks to the
//! exchange: it records what should be on the book (`Pending` orders), what
//! the exchange has acknowledged (`Open`), and what has to be pulled
//! (the cancellation queue). The reconciliation loop turns that into
//! exchange calls and feeds the results back through `mark_*` and `observe`.

use std::collections::HashSet;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::types::{
    now_millis, Fill, GridLevel, Order, OrderOrigin, OrderRequest, OrderSide, OrderStatus,
    OrderStatusReport,
};

/// Sizes below this are treated as zero
const SIZE_EPSILON: f64 = 1e-12;

/// Progress of the optional initial market buy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPositionStatus {
    Disabled,
    Pending,
    Filled,
    Failed,
}

/// Orders laid out by `initialize`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutSummary {
    pub buys: u32,
    pub sells: u32,
    /// Size of the initial market buy, if one was issued
    pub init_size: Option<f64>,
}

/// What the ladder did with a fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillOutcome {
    /// Order not complete yet
    Partial,
    /// First fill after the init-position buy; no re-quote
    Suppressed,
    /// Init-position fill after suppression was already consumed
    InitPosition,
    /// Operator order; excluded from re-quoting
    Operator,
    /// Order no longer attached to a level (e.g. filled while being cancelled)
    Detached,
    /// Opposite-side order scheduled
    Requoted { level: u32, side: OrderSide },
    /// Neighbour would be outside the configured range
    Boundary,
    /// Neighbour already holds an order
    TargetOccupied(u32),
    /// Neighbour was cancelled by the operator
    TargetHeld(u32),
}

/// Result of `restore_level`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestoreOutcome {
    Placed(OrderSide),
    AlreadyActive,
}

/// Result of feeding an exchange status report into the ladder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// New fill increment (or the terminal fill)
    pub fill: Option<Fill>,
    /// Order removed from the ladder because it reached a terminal status
    pub closed: Option<Order>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Init,
    Level(u32),
    Manual(usize),
    Cancelling(usize),
}

/// Price levels and their order assignments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLadder {
    lower_price: f64,
    upper_price: f64,
    step: f64,
    levels: Vec<GridLevel>,
    /// Operator orders at prices that are not grid levels
    #[serde(default)]
    manual_orders: Vec<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init_order: Option<Order>,
    /// Orders removed from the ladder that still need an exchange cancel
    #[serde(default)]
    cancelling: Vec<Order>,
    init_position: InitPositionStatus,
    suppress_next_fill: bool,
    initialized: bool,
    next_order_id: u64,
}

impl GridLadder {
    /// Compute level prices by even division of the configured range
    pub fn new(config: &GridConfig) -> Self {
        let levels = (0..config.num_levels())
            .map(|i| GridLevel::new(i, config.level_price(i), OrderSide::Buy, config.order_size))
            .collect();

        Self {
            lower_price: config.lower_price,
            upper_price: config.upper_price,
            step: config.price_step(),
            levels,
            manual_orders: Vec::new(),
            init_order: None,
            cancelling: Vec::new(),
            init_position: InitPositionStatus::Disabled,
            suppress_next_fill: false,
            initialized: false,
            next_order_id: 1,
        }
    }

    /// Lay out the full ladder around `current_price`.
    ///
    /// Levels below the price get buys, levels above get sells and a level
    /// exactly at the price stays empty. With `init_position` one market buy
    /// sized to the total sell size is issued as well.
    pub fn initialize(&mut self, current_price: f64, init_position: bool) -> GridResult<LayoutSummary> {
        if self.initialized {
            return Err(GridError::InvariantViolation("ladder already initialized".into()));
        }
        if !(current_price.is_finite() && current_price > 0.0) {
            return Err(GridError::Validation(format!(
                "invalid reference price {}",
                current_price
            )));
        }

        let mut summary = LayoutSummary {
            buys: 0,
            sells: 0,
            init_size: None,
        };
        let mut sell_total = 0.0;

        for i in 0..self.levels.len() {
            let (price, size) = (self.levels[i].price, self.levels[i].size);
            let side = determine_order_side(price, current_price);
            self.levels[i].intended_side = side;

            if price == current_price {
                continue;
            }

            let id = self.next_id();
            self.levels[i].order = Some(Order::limit(id, Some(i as u32), side, price, size, OrderOrigin::Grid));
            match side {
                OrderSide::Buy => summary.buys += 1,
                OrderSide::Sell => {
                    summary.sells += 1;
                    sell_total += size;
                }
            }
        }

        if init_position && sell_total > SIZE_EPSILON {
            let id = self.next_id();
            self.init_order = Some(Order::market(
                id,
                OrderSide::Buy,
                current_price,
                sell_total,
                OrderOrigin::InitPosition,
            ));
            self.init_position = InitPositionStatus::Pending;
            self.suppress_next_fill = true;
            summary.init_size = Some(sell_total);
        }

        self.initialized = true;
        info!(
            "Ladder laid out at {}: {} buys, {} sells, init_position={:?}",
            current_price, summary.buys, summary.sells, summary.init_size
        );
        Ok(summary)
    }

    /// React to a fill: a filled buy at L quotes a sell at L+1, a filled sell
    /// at L quotes a buy at L-1.
    pub fn on_fill(&mut self, fill: &Fill) -> FillOutcome {
        if !fill.terminal {
            return FillOutcome::Partial;
        }

        match fill.origin {
            OrderOrigin::InitPosition => {
                if self.suppress_next_fill {
                    self.suppress_next_fill = false;
                    info!("Init position filled: size={} price={}, no re-quote", fill.size, fill.price);
                    return FillOutcome::Suppressed;
                }
                return FillOutcome::InitPosition;
            }
            OrderOrigin::Operator => return FillOutcome::Operator,
            OrderOrigin::Grid => {}
        }

        let Some(index) = fill.level else {
            return FillOutcome::Detached;
        };
        let Some(level) = self.levels.get_mut(index as usize) else {
            return FillOutcome::Detached;
        };
        level.intended_side = fill.side.opposite();
        level.last_fill_price = Some(fill.price);

        let target = match fill.side {
            OrderSide::Buy => index.checked_add(1).filter(|t| (*t as usize) < self.levels.len()),
            OrderSide::Sell => index.checked_sub(1),
        };
        let Some(target) = target else {
            debug!("Fill at boundary level {}, nothing to re-quote", index);
            return FillOutcome::Boundary;
        };

        let target_level = &self.levels[target as usize];
        if target_level.held {
            return FillOutcome::TargetHeld(target);
        }
        if target_level.has_active_order() {
            return FillOutcome::TargetOccupied(target);
        }

        let side = fill.side.opposite();
        let id = self.next_id();
        let target_level = &mut self.levels[target as usize];
        target_level.intended_side = side;
        target_level.order = Some(Order::limit(
            id,
            Some(target),
            side,
            target_level.price,
            target_level.size,
            OrderOrigin::Grid,
        ));

        info!(
            "Re-quote after {} fill at level {}: {} at level {} ({})",
            fill.side.as_str(),
            index,
            side.as_str(),
            target,
            target_level.price
        );
        FillOutcome::Requoted { level: target, side }
    }

    /// Remove the level's order without re-quoting and hold the level
    pub fn cancel_level(&mut self, index: u32) -> GridResult<Option<Order>> {
        let level = self
            .levels
            .get_mut(index as usize)
            .ok_or(GridError::LevelNotFound(index))?;
        level.held = true;
        let removed = level.order.take();
        Ok(removed.map(|order| self.retire(order)))
    }

    /// Clear the hold and re-issue the default order if the level is empty.
    ///
    /// The side follows the current price when known (buy below, sell at or
    /// above), otherwise the level's stored expectation.
    pub fn restore_level(&mut self, index: u32, current_price: Option<f64>) -> GridResult<RestoreOutcome> {
        let level = self
            .levels
            .get_mut(index as usize)
            .ok_or(GridError::LevelNotFound(index))?;
        level.held = false;
        level.failures = 0;
        level.last_error = None;

        if level.has_active_order() {
            return Ok(RestoreOutcome::AlreadyActive);
        }

        let side = match current_price {
            Some(price) if level.price < price => OrderSide::Buy,
            Some(_) => OrderSide::Sell,
            None => level.intended_side,
        };

        let id = self.next_id();
        let level = &mut self.levels[index as usize];
        level.intended_side = side;
        level.order = Some(Order::limit(id, Some(index), side, level.price, level.size, OrderOrigin::Grid));
        Ok(RestoreOutcome::Placed(side))
    }

    /// Pull every grid and manual order and hold all levels
    pub fn cancel_all(&mut self) -> usize {
        let mut retired = Vec::new();
        for level in &mut self.levels {
            level.held = true;
            if let Some(order) = level.order.take() {
                retired.push(order);
            }
        }
        retired.append(&mut self.manual_orders);

        // A market buy that was never sent is dropped; one already sent will fill
        if let Some(init) = self.init_order.as_mut() {
            if init.status == OrderStatus::Pending {
                init.status = OrderStatus::Cancelled;
                self.init_position = InitPositionStatus::Failed;
                self.suppress_next_fill = false;
            }
        }

        let count = retired.len();
        for order in retired {
            self.retire(order);
        }
        count
    }

    /// Inject an operator order outside the re-quote policy.
    ///
    /// At a grid level's price the order occupies that level.
    pub fn manual_order(&mut self, side: OrderSide, price: f64, size: f64, reduce_only: bool) -> GridResult<u64> {
        if !(price.is_finite() && price > 0.0) {
            return Err(GridError::Validation(format!("manual order price must be positive, got {}", price)));
        }
        if !(size.is_finite() && size > 0.0) {
            return Err(GridError::Validation(format!("manual order size must be positive, got {}", size)));
        }

        match self.level_at_price(price) {
            Some(index) => {
                if self.levels[index as usize].has_active_order() {
                    return Err(GridError::InvariantViolation(format!(
                        "level {} already holds an active order",
                        index
                    )));
                }
                let id = self.next_id();
                let level = &mut self.levels[index as usize];
                let mut order = Order::limit(id, Some(index), side, level.price, size, OrderOrigin::Operator);
                order.reduce_only = reduce_only;
                level.order = Some(order);
                Ok(id)
            }
            None => {
                let id = self.next_id();
                let mut order = Order::limit(id, None, side, price, size, OrderOrigin::Operator);
                order.reduce_only = reduce_only;
                self.manual_orders.push(order);
                Ok(id)
            }
        }
    }

    /// Orders that still need to be sent, init-position buy first.
    ///
    /// While the init-position buy is unsent nothing else goes out, so the
    /// base position is established before the grid starts trading.
    pub fn pending_placements(&self) -> Vec<OrderRequest> {
        if let Some(init) = &self.init_order {
            if init.status == OrderStatus::Pending {
                return vec![init.request()];
            }
        }
        self.levels
            .iter()
            .filter_map(|l| l.order.as_ref())
            .chain(self.manual_orders.iter())
            .filter(|o| o.status == OrderStatus::Pending)
            .map(Order::request)
            .collect()
    }

    /// Record an exchange acknowledgement.
    ///
    /// An exchange id already held by another live order is rejected and
    /// the order stays pending.
    pub fn mark_placed(&mut self, id: u64, exchange_id: String) -> GridResult<()> {
        let slot = self.locate(id).ok_or_else(|| GridError::OrderNotFound(id.to_string()))?;
        if self
            .all_orders()
            .any(|o| o.id != id && o.is_live() && o.exchange_id.as_deref() == Some(exchange_id.as_str()))
        {
            return Err(GridError::InvariantViolation(format!(
                "exchange order {} already tracked, refusing it for order {}",
                exchange_id, id
            )));
        }
        if let Some(order) = self.order_mut(slot) {
            order.exchange_id = Some(exchange_id);
            order.status = OrderStatus::Open;
            order.last_error = None;
        }
        if let Slot::Level(index) = slot {
            let level = &mut self.levels[index as usize];
            level.failures = 0;
            level.last_error = None;
        }
        Ok(())
    }

    /// Record a failed placement; the order stays pending and is retried.
    /// Returns the failure count of the order's level (or of the order itself).
    pub fn mark_placement_failed(&mut self, id: u64, reason: &str) -> GridResult<u32> {
        let slot = self.locate(id).ok_or_else(|| GridError::OrderNotFound(id.to_string()))?;
        let mut attempts = 0;
        if let Some(order) = self.order_mut(slot) {
            order.attempts += 1;
            order.last_error = Some(reason.to_string());
            attempts = order.attempts;
        }
        if let Slot::Level(index) = slot {
            let level = &mut self.levels[index as usize];
            level.failures += 1;
            level.last_error = Some(reason.to_string());
            attempts = level.failures;
        }
        Ok(attempts)
    }

    /// Acknowledged orders whose status should be polled, init-position first
    pub fn orders_to_poll(&self) -> Vec<(u64, String)> {
        self.all_orders()
            .filter(|o| o.is_acknowledged())
            .filter_map(|o| o.exchange_id.clone().map(|x| (o.id, x)))
            .collect()
    }

    /// Orders waiting for an exchange cancel
    pub fn cancel_requests(&self) -> Vec<(u64, String)> {
        self.cancelling
            .iter()
            .filter_map(|o| o.exchange_id.clone().map(|x| (o.id, x)))
            .collect()
    }

    /// Exchange confirmed the cancel (or already forgot the order)
    pub fn mark_cancelled(&mut self, id: u64) -> Option<Order> {
        let index = self.cancelling.iter().position(|o| o.id == id)?;
        let mut order = self.cancelling.remove(index);
        order.status = OrderStatus::Cancelled;
        Some(order)
    }

    pub fn mark_cancel_failed(&mut self, id: u64, reason: &str) {
        if let Some(order) = self.cancelling.iter_mut().find(|o| o.id == id) {
            order.attempts += 1;
            order.last_error = Some(reason.to_string());
        }
    }

    /// Apply an exchange status report for order `id`.
    ///
    /// A growth in filled size yields a fill increment; a `Filled` report
    /// yields the terminal fill even when every unit was already booked.
    /// Terminal orders are removed from their slot.
    pub fn observe(
        &mut self,
        id: u64,
        report: &OrderStatusReport,
        fee_for: impl Fn(f64, f64) -> f64,
    ) -> GridResult<Observation> {
        let slot = self.locate(id).ok_or_else(|| GridError::OrderNotFound(id.to_string()))?;
        let order = self
            .order_mut(slot)
            .ok_or_else(|| GridError::OrderNotFound(id.to_string()))?;
        if order.status.is_terminal() {
            return Ok(Observation::default());
        }

        let reported = if report.filled_size.is_finite() {
            report.filled_size.clamp(0.0, order.size)
        } else {
            0.0
        };
        let filled = if report.status == OrderStatus::Filled {
            order.size
        } else {
            reported.max(order.filled_size)
        };
        let increment = (filled - order.filled_size).max(0.0);
        let terminal = report.status == OrderStatus::Filled;
        let price = report
            .avg_price
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(order.price);

        let fill = if increment > SIZE_EPSILON || terminal {
            let size = if increment > SIZE_EPSILON { increment } else { 0.0 };
            Some(Fill {
                order_id: order.id,
                exchange_id: order.exchange_id.clone(),
                level: match slot {
                    Slot::Cancelling(_) => None,
                    _ => order.level,
                },
                origin: order.origin,
                side: order.side,
                price,
                size,
                fee: fee_for(price, size),
                timestamp: now_millis(),
                terminal,
            })
        } else {
            None
        };
        order.filled_size = filled;

        if !report.status.is_terminal() {
            return Ok(Observation { fill, closed: None });
        }
        order.status = report.status;

        let closed = self.close(slot);
        if let Some(order) = &closed {
            if order.status != OrderStatus::Filled && order.origin != OrderOrigin::InitPosition {
                warn!(
                    "Order {} ({} {} @ {}) ended {:?} on the exchange",
                    order.id,
                    order.side.as_str(),
                    order.size,
                    order.price,
                    order.status
                );
            }
        }
        Ok(Observation { fill, closed })
    }

    /// Check the ladder's structural invariants
    pub fn check_invariants(&self) -> GridResult<()> {
        for pair in self.levels.windows(2) {
            if pair[1].price <= pair[0].price {
                return Err(GridError::InvariantViolation(format!(
                    "level prices not strictly increasing at level {}",
                    pair[1].index
                )));
            }
        }

        for level in &self.levels {
            if let Some(order) = &level.order {
                if order.level != Some(level.index) {
                    return Err(GridError::InvariantViolation(format!(
                        "order {} parked on level {} but tagged {:?}",
                        order.id, level.index, order.level
                    )));
                }
                if !order.is_live() {
                    return Err(GridError::InvariantViolation(format!(
                        "terminal order {} still attached to level {}",
                        order.id, level.index
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for order in self.all_orders().filter(|o| o.is_live()) {
            if let Some(exchange_id) = &order.exchange_id {
                if !seen.insert(exchange_id.as_str()) {
                    return Err(GridError::InvariantViolation(format!(
                        "exchange order {} tracked twice",
                        exchange_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Level whose price matches `price`
    pub fn level_at_price(&self, price: f64) -> Option<u32> {
        let tolerance = self.step * 1e-6;
        self.levels
            .iter()
            .find(|l| (l.price - price).abs() <= tolerance)
            .map(|l| l.index)
    }

    /// Levels whose placement failed at least `threshold` times in a row
    pub fn failing_levels(&self, threshold: u32) -> Vec<u32> {
        self.levels
            .iter()
            .filter(|l| l.failures >= threshold)
            .map(|l| l.index)
            .collect()
    }

    /// Live (pending or open) buy and sell orders on levels and manual slots
    pub fn live_order_counts(&self) -> (usize, usize) {
        self.levels
            .iter()
            .filter_map(|l| l.order.as_ref())
            .chain(self.manual_orders.iter())
            .filter(|o| o.is_live())
            .fold((0, 0), |(buys, sells), o| match o.side {
                OrderSide::Buy => (buys + 1, sells),
                OrderSide::Sell => (buys, sells + 1),
            })
    }

    /// Whether this ladder was built from the same range as `config`
    pub fn matches_config(&self, config: &GridConfig) -> bool {
        (self.lower_price - config.lower_price).abs() < 1e-9
            && (self.upper_price - config.upper_price).abs() < 1e-9
            && self.levels.len() == config.num_levels() as usize
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn level(&self, index: u32) -> Option<&GridLevel> {
        self.levels.get(index as usize)
    }

    pub fn num_levels(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn manual_orders(&self) -> &[Order] {
        &self.manual_orders
    }

    pub fn init_order(&self) -> Option<&Order> {
        self.init_order.as_ref()
    }

    pub fn cancelling(&self) -> &[Order] {
        &self.cancelling
    }

    pub fn init_position(&self) -> InitPositionStatus {
        self.init_position
    }

    pub fn suppressing_first_fill(&self) -> bool {
        self.suppress_next_fill
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The init-position buy, while it has not been acknowledged
    pub fn unsent_init_order(&self) -> Option<&Order> {
        self.init_order
            .as_ref()
            .filter(|o| o.status == OrderStatus::Pending)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    fn all_orders(&self) -> impl Iterator<Item = &Order> {
        self.init_order
            .iter()
            .chain(self.levels.iter().filter_map(|l| l.order.as_ref()))
            .chain(self.manual_orders.iter())
            .chain(self.cancelling.iter())
    }

    fn locate(&self, id: u64) -> Option<Slot> {
        if self.init_order.as_ref().is_some_and(|o| o.id == id) {
            return Some(Slot::Init);
        }
        if let Some(level) = self
            .levels
            .iter()
            .find(|l| l.order.as_ref().is_some_and(|o| o.id == id))
        {
            return Some(Slot::Level(level.index));
        }
        if let Some(i) = self.manual_orders.iter().position(|o| o.id == id) {
            return Some(Slot::Manual(i));
        }
        self.cancelling.iter().position(|o| o.id == id).map(Slot::Cancelling)
    }

    fn order_mut(&mut self, slot: Slot) -> Option<&mut Order> {
        match slot {
            Slot::Init => self.init_order.as_mut(),
            Slot::Level(i) => self.levels.get_mut(i as usize).and_then(|l| l.order.as_mut()),
            Slot::Manual(i) => self.manual_orders.get_mut(i),
            Slot::Cancelling(i) => self.cancelling.get_mut(i),
        }
    }

    /// Detach a terminal order from its slot. The init-position order stays
    /// as a record; its status drives `init_position`.
    fn close(&mut self, slot: Slot) -> Option<Order> {
        match slot {
            Slot::Init => {
                let order = self.init_order.clone()?;
                if order.status == OrderStatus::Filled {
                    self.init_position = InitPositionStatus::Filled;
                } else {
                    warn!("Init position order ended {:?}", order.status);
                    self.init_position = InitPositionStatus::Failed;
                    self.suppress_next_fill = false;
                }
                Some(order)
            }
            Slot::Level(i) => self.levels.get_mut(i as usize).and_then(|l| l.order.take()),
            Slot::Manual(i) => Some(self.manual_orders.remove(i)),
            Slot::Cancelling(i) => Some(self.cancelling.remove(i)),
        }
    }

    /// Queue an acknowledged order for exchange cancel; drop an unsent one
    fn retire(&mut self, mut order: Order) -> Order {
        if order.is_acknowledged() {
            self.cancelling.push(order.clone());
        } else {
            order.status = OrderStatus::Cancelled;
        }
        order
    }
}

/// Buy below the reference price, sell at or above it
pub fn determine_order_side(level_price: f64, current_price: f64) -> OrderSide {
    if level_price < current_price {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_config() -> GridConfig {
        GridConfig::new("BTC-USDT-SWAP", 10000.0, 12000.0, 20, 0.5)
    }

    fn ack_all(ladder: &mut GridLadder) {
        for req in ladder.pending_placements() {
            ladder
                .mark_placed(req.client_id, format!("ex-{}", req.client_id))
                .unwrap();
        }
    }

    fn terminal_fill(ladder: &mut GridLadder, level: u32, price: f64) -> Fill {
        let order = ladder.level(level).and_then(|l| l.order.clone()).unwrap();
        let obs = ladder
            .observe(order.id, &OrderStatusReport::filled(order.size, price), |_, _| 0.0)
            .unwrap();
        obs.fill.unwrap()
    }

    #[test]
    fn test_layout_without_init_position() {
        let mut ladder = GridLadder::new(&scenario_config());
        let summary = ladder.initialize(11000.0, false).unwrap();

        assert_eq!(ladder.num_levels(), 21);
        assert_eq!(summary.buys, 10);
        assert_eq!(summary.sells, 10);
        assert_eq!(summary.init_size, None);
        assert!(ladder.init_order().is_none());

        for level in ladder.levels() {
            match level.order.as_ref() {
                Some(order) => {
                    assert_eq!(order.size, 0.5);
                    if level.price < 11000.0 {
                        assert_eq!(order.side, OrderSide::Buy);
                    } else {
                        assert_eq!(order.side, OrderSide::Sell);
                    }
                }
                None => assert_eq!(level.price, 11000.0),
            }
        }
        assert_eq!(ladder.pending_placements().len(), 20);
        assert!(ladder.check_invariants().is_ok());
    }

    #[test]
    fn test_layout_with_init_position() {
        let mut ladder = GridLadder::new(&scenario_config());
        let summary = ladder.initialize(11000.0, true).unwrap();

        assert_eq!(summary.init_size, Some(5.0));
        assert_eq!(ladder.init_position(), InitPositionStatus::Pending);
        assert!(ladder.suppressing_first_fill());

        // Only the market buy goes out until the exchange has it
        let pending = ladder.pending_placements();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, crate::grid::types::OrderKind::Market);
        assert_eq!(pending[0].size, 5.0);

        ack_all(&mut ladder);
        assert_eq!(ladder.pending_placements().len(), 20);
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        assert!(matches!(
            ladder.initialize(11000.0, false),
            Err(GridError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_buy_fill_requotes_sell_above() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);

        // Level 10 sits at the reference price and starts empty
        let fill = terminal_fill(&mut ladder, 9, 10900.0);
        let outcome = ladder.on_fill(&fill);

        assert_eq!(outcome, FillOutcome::Requoted { level: 10, side: OrderSide::Sell });
        let requote = ladder.level(10).and_then(|l| l.order.clone()).unwrap();
        assert_eq!(requote.side, OrderSide::Sell);
        assert_eq!(requote.price, 11000.0);
        assert_eq!(requote.size, 0.5);
        assert_eq!(requote.status, OrderStatus::Pending);
        assert!(ladder.level(9).unwrap().order.is_none());
        assert_eq!(ladder.level(9).unwrap().intended_side, OrderSide::Sell);

        // The new sell fills and re-quotes the buy back at level 9
        ladder.mark_placed(requote.id, "ex-requote".into()).unwrap();
        let fill = terminal_fill(&mut ladder, 10, 11000.0);
        assert_eq!(ladder.on_fill(&fill), FillOutcome::Requoted { level: 9, side: OrderSide::Buy });
    }

    #[test]
    fn test_requote_skips_occupied_and_held_levels() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);

        let fill = terminal_fill(&mut ladder, 3, 10300.0);
        assert_eq!(ladder.on_fill(&fill), FillOutcome::TargetOccupied(4));

        ladder.cancel_level(14).unwrap();
        let fill = terminal_fill(&mut ladder, 15, 11500.0);
        assert_eq!(ladder.on_fill(&fill), FillOutcome::TargetHeld(14));
        assert!(ladder.level(14).unwrap().order.is_none());
    }

    #[test]
    fn test_boundary_levels_do_not_requote_outside_range() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);

        let top = ladder.num_levels() - 1;
        let mut fill = terminal_fill(&mut ladder, top, 12000.0);
        // A buy filling at the top level has no level above it
        fill.side = OrderSide::Buy;
        assert_eq!(ladder.on_fill(&fill), FillOutcome::Boundary);

        let mut fill = terminal_fill(&mut ladder, 0, 10000.0);
        fill.side = OrderSide::Sell;
        assert_eq!(ladder.on_fill(&fill), FillOutcome::Boundary);

        for level in ladder.levels() {
            if let Some(order) = &level.order {
                assert!(order.price >= 10000.0 && order.price <= 12000.0);
            }
        }
    }

    #[test]
    fn test_init_fill_is_suppressed_once() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, true).unwrap();
        ack_all(&mut ladder);
        ack_all(&mut ladder);

        let init = ladder.init_order().cloned().unwrap();
        let obs = ladder
            .observe(init.id, &OrderStatusReport::filled(init.size, 11001.0), |_, _| 0.0)
            .unwrap();
        let fill = obs.fill.unwrap();
        assert_eq!(fill.size, 5.0);
        assert_eq!(ladder.on_fill(&fill), FillOutcome::Suppressed);
        assert!(!ladder.suppressing_first_fill());
        assert_eq!(ladder.init_position(), InitPositionStatus::Filled);

        // Grid fills re-quote normally afterwards
        let fill = terminal_fill(&mut ladder, 11, 11100.0);
        assert_eq!(ladder.on_fill(&fill), FillOutcome::Requoted { level: 10, side: OrderSide::Buy });
    }

    #[test]
    fn test_cancel_then_restore_leaves_single_order() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);

        let original = ladder.level(7).and_then(|l| l.order.clone()).unwrap();
        let removed = ladder.cancel_level(7).unwrap().unwrap();
        assert_eq!(removed.id, original.id);
        assert!(ladder.level(7).unwrap().held);
        assert_eq!(ladder.cancel_requests(), vec![(original.id, original.exchange_id.clone().unwrap())]);

        let outcome = ladder.restore_level(7, Some(11000.0)).unwrap();
        assert_eq!(outcome, RestoreOutcome::Placed(OrderSide::Buy));

        let level = ladder.level(7).unwrap();
        let restored = level.order.clone().unwrap();
        assert!(!level.held);
        assert_eq!(restored.price, 10700.0);
        assert_eq!(restored.size, 0.5);
        assert_ne!(restored.id, original.id);

        // Restoring again does not stack a second order
        assert_eq!(ladder.restore_level(7, Some(11000.0)).unwrap(), RestoreOutcome::AlreadyActive);
        let live_at_7 = ladder
            .levels()
            .iter()
            .filter(|l| l.index == 7 && l.has_active_order())
            .count();
        assert_eq!(live_at_7, 1);
        assert!(ladder.check_invariants().is_ok());
    }

    #[test]
    fn test_cancel_level_out_of_range() {
        let mut ladder = GridLadder::new(&scenario_config());
        assert_eq!(ladder.cancel_level(21), Err(GridError::LevelNotFound(21)));
        assert_eq!(ladder.restore_level(99, None), Err(GridError::LevelNotFound(99)));
    }

    #[test]
    fn test_manual_orders() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();

        // Occupied level
        assert!(matches!(
            ladder.manual_order(OrderSide::Sell, 11500.0, 1.0, true),
            Err(GridError::InvariantViolation(_))
        ));

        // Free level at the reference price
        let id = ladder.manual_order(OrderSide::Sell, 11000.0, 2.0, true).unwrap();
        let order = ladder.level(10).and_then(|l| l.order.clone()).unwrap();
        assert_eq!(order.id, id);
        assert_eq!(order.origin, OrderOrigin::Operator);
        assert!(order.request().reduce_only);

        // Off-grid price
        ladder.manual_order(OrderSide::Buy, 10950.0, 1.0, false).unwrap();
        assert_eq!(ladder.manual_orders().len(), 1);

        assert!(matches!(
            ladder.manual_order(OrderSide::Buy, -1.0, 1.0, false),
            Err(GridError::Validation(_))
        ));

        ack_all(&mut ladder);
        let obs = ladder
            .observe(id, &OrderStatusReport::filled(2.0, 11000.0), |_, _| 0.0)
            .unwrap();
        assert_eq!(ladder.on_fill(&obs.fill.unwrap()), FillOutcome::Operator);
    }

    #[test]
    fn test_cancel_all_holds_every_level() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);
        ladder.manual_order(OrderSide::Buy, 10950.0, 1.0, false).unwrap();

        let count = ladder.cancel_all();
        assert_eq!(count, 21);
        assert!(ladder.levels().iter().all(|l| l.held && l.order.is_none()));
        assert!(ladder.manual_orders().is_empty());
        // The unsent manual order is simply dropped
        assert_eq!(ladder.cancel_requests().len(), 20);
        assert_eq!(ladder.live_order_counts(), (0, 0));
    }

    #[test]
    fn test_partial_fill_then_terminal() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        ack_all(&mut ladder);
        let order = ladder.level(2).and_then(|l| l.order.clone()).unwrap();

        let obs = ladder
            .observe(order.id, &OrderStatusReport::open(0.2, Some(10200.0)), |p, s| p * s * 0.001)
            .unwrap();
        let partial = obs.fill.unwrap();
        assert!(!partial.terminal);
        assert!((partial.size - 0.2).abs() < 1e-12);
        assert!((partial.fee - 10200.0 * 0.2 * 0.001).abs() < 1e-9);
        assert_eq!(ladder.on_fill(&partial), FillOutcome::Partial);
        assert!(obs.closed.is_none());

        // Same report again: nothing new
        let obs = ladder
            .observe(order.id, &OrderStatusReport::open(0.2, Some(10200.0)), |_, _| 0.0)
            .unwrap();
        assert!(obs.fill.is_none());

        let obs = ladder
            .observe(order.id, &OrderStatusReport::filled(0.5, 10200.0), |_, _| 0.0)
            .unwrap();
        let fill = obs.fill.unwrap();
        assert!(fill.terminal);
        assert!((fill.size - 0.3).abs() < 1e-12);
        assert_eq!(obs.closed.unwrap().status, OrderStatus::Filled);
        assert!(ladder.level(2).unwrap().order.is_none());
    }

    #[test]
    fn test_placement_failures_are_counted() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        let order = ladder.level(4).and_then(|l| l.order.clone()).unwrap();

        for _ in 0..3 {
            ladder.mark_placement_failed(order.id, "rate limited").unwrap();
        }
        assert_eq!(ladder.failing_levels(3), vec![4]);
        assert_eq!(ladder.level(4).unwrap().last_error.as_deref(), Some("rate limited"));

        ladder.mark_placed(order.id, "ex-4".into()).unwrap();
        assert!(ladder.failing_levels(3).is_empty());
    }

    #[test]
    fn test_duplicate_exchange_id_is_rejected() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, false).unwrap();
        let a = ladder.level(1).and_then(|l| l.order.clone()).unwrap();
        let b = ladder.level(2).and_then(|l| l.order.clone()).unwrap();
        ladder.mark_placed(a.id, "same".into()).unwrap();

        let err = ladder.mark_placed(b.id, "same".into()).unwrap_err();
        assert!(matches!(err, GridError::InvariantViolation(_)));

        // The second order is left untouched and the ladder stays consistent
        let b_after = ladder.level(2).and_then(|l| l.order.clone()).unwrap();
        assert_eq!(b_after.status, OrderStatus::Pending);
        assert!(b_after.exchange_id.is_none());
        assert!(ladder.check_invariants().is_ok());

        // Re-acknowledging the same order with its own id is fine
        ladder.mark_placed(a.id, "same".into()).unwrap();
        ladder.mark_placed(b.id, "other".into()).unwrap();
        assert!(ladder.check_invariants().is_ok());
    }

    #[test]
    fn test_unsent_init_order_until_acknowledged() {
        let mut ladder = GridLadder::new(&scenario_config());
        ladder.initialize(11000.0, true).unwrap();
        let init = ladder.unsent_init_order().cloned().unwrap();

        ladder.mark_placement_failed(init.id, "rejected").unwrap();
        assert_eq!(ladder.unsent_init_order().map(|o| o.attempts), Some(1));
        assert_eq!(ladder.pending_placements().len(), 1);

        ladder.mark_placed(init.id, "ex-init".into()).unwrap();
        assert!(ladder.unsent_init_order().is_none());
        assert_eq!(ladder.pending_placements().len(), 20);
    }
}
