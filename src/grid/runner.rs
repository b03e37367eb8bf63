//! Grid bot runner - the reconciliation loop
//!
//! One cycle:
//! 1. poll the price (failure skips status checks, commands still run)
//! 2. poll acknowledged orders, book fills, re-quote
//! 3. apply new operator commands
//! 4. send cancels and placements
//! 5. persist
//!
//! Steps 2 and 4 are the "full" reconciliation and run at most every
//! `full_reconcile_interval`; step 4 also runs whenever a command was applied.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::Instant;

use super::commands::{CommandLog, CommandProcessor};
use super::config::{GridConfig, RuntimeConfig};
use super::errors::{GridError, GridResult};
use super::executor::ExchangeAdapter;
use super::ladder::FillOutcome;
use super::state::{GridState, RestoreSource, StateStore};
use super::types::{BotStatus, OrderKind, OrderStatusReport, PriceBand};

const INIT_ALERT: &str = "init-position market buy";

/// Last observed price and band with their observation times
#[derive(Debug, Clone)]
pub struct MarketCache {
    ttl: Duration,
    price: Option<(f64, Instant)>,
    band: Option<(PriceBand, Instant)>,
}

impl MarketCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            price: None,
            band: None,
        }
    }

    pub fn update_price(&mut self, price: f64) {
        self.price = Some((price, Instant::now()));
    }

    pub fn update_band(&mut self, band: PriceBand) {
        self.band = Some((band, Instant::now()));
    }

    /// Price observed within the TTL
    pub fn fresh_price(&self) -> Option<f64> {
        self.price
            .filter(|(_, at)| at.elapsed() <= self.ttl)
            .map(|(price, _)| price)
    }

    /// Band observed within the TTL
    pub fn fresh_band(&self) -> Option<PriceBand> {
        self.band
            .filter(|(_, at)| at.elapsed() <= self.ttl)
            .map(|(band, _)| band)
    }

    /// Last price regardless of age
    pub fn last_price(&self) -> Option<f64> {
        self.price.map(|(price, _)| price)
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub price: Option<f64>,
    /// Status polling and placements ran
    pub full: bool,
    pub fills: usize,
    pub commands_applied: usize,
    pub commands_rejected: usize,
    pub placed: usize,
    pub place_failures: usize,
    /// Placements held back by the band guard or a stale price
    pub deferred: usize,
    pub cancelled: usize,
    pub cancel_failures: usize,
    pub errors: Vec<String>,
}

/// Drives one grid against one exchange
pub struct GridRunner<E: ExchangeAdapter> {
    config: GridConfig,
    runtime: RuntimeConfig,
    exchange: Arc<E>,
    store: StateStore,
    processor: CommandProcessor,
    state: GridState,
    market: MarketCache,
    last_full: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
    violation: Option<String>,
}

impl<E: ExchangeAdapter + 'static> GridRunner<E> {
    /// Validate configuration and restore (or create) the grid state
    pub fn new(config: GridConfig, runtime: RuntimeConfig, exchange: Arc<E>) -> GridResult<Self> {
        config.validate()?;
        runtime.validate()?;

        let store = StateStore::new(&runtime.state_path);
        let (state, source) = store.restore(&config)?;
        if source == RestoreSource::Backup {
            warn!("Resumed from backup snapshot {:?}", store.backup_path());
        }

        let processor = CommandProcessor::new(CommandLog::new(&runtime.commands_path));
        let market = MarketCache::new(runtime.band_ttl());

        Ok(Self {
            config,
            runtime,
            exchange,
            store,
            processor,
            state,
            market,
            last_full: None,
            shutdown: None,
            violation: None,
        })
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Run cycles until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> GridResult<()> {
        info!(
            "Starting grid engine: {} [{} - {}] x{} size={} init_position={}",
            self.config.symbol,
            self.config.lower_price,
            self.config.upper_price,
            self.config.levels,
            self.config.order_size,
            self.config.init_position
        );
        self.shutdown = Some(shutdown.clone());

        let mut result = Ok(());
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) => debug!("Cycle {} done: {:?}", report.cycle, report),
                Err(e) => {
                    error!("Halting: {}", e);
                    result = Err(e);
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.runtime.loop_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state.status = BotStatus::Stopped;
        self.persist()?;
        info!("Grid engine stopped after {} cycles", self.state.cycles);
        result
    }

    /// One reconciliation cycle. Errors only when an invariant violation
    /// must halt the loop; everything else is logged and retried.
    pub async fn run_cycle(&mut self) -> GridResult<CycleReport> {
        self.state.cycles += 1;
        let now = Instant::now();
        let full = self
            .last_full
            .map_or(true, |at| now.duration_since(at) >= self.runtime.full_reconcile_interval());
        let mut report = CycleReport {
            cycle: self.state.cycles,
            full,
            ..CycleReport::default()
        };

        // 1. Price
        let price = match self.refresh_price().await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!("Price poll failed: {}", e);
                report.errors.push(e.to_string());
                None
            }
        };
        report.price = price;

        if let Some(price) = price {
            if !self.state.ladder.is_initialized() {
                self.lay_out(price)?;
            }
            self.state.last_price = Some(price);
            self.state.record_equity(price);
        }

        // 2. Order status
        if full && price.is_some() && !self.stopping() {
            self.poll_orders(&mut report).await;
        }

        // 3. Commands (only once there is a ladder to apply them to)
        if self.state.ladder.is_initialized() && !self.stopping() {
            match self.processor.process(&mut self.state, self.market.fresh_price()) {
                Ok(processed) => {
                    report.commands_applied = processed.applied;
                    report.commands_rejected = processed.rejected;
                    for violation in processed.violations {
                        self.on_violation(violation);
                    }
                }
                Err(e) => {
                    warn!("Command log unavailable: {}", e);
                    report.errors.push(e.to_string());
                }
            }
        }

        // 4. Cancels and placements
        if (full || report.commands_applied > 0) && !self.stopping() {
            self.send_cancels(&mut report).await;
            self.send_placements(&mut report).await;
        }
        if full {
            self.last_full = Some(now);
        }

        self.check_health();
        self.heartbeat();

        // 5. Persist
        if let Err(e) = self.persist() {
            error!("Failed to persist state: {}", e);
            report.errors.push(e.to_string());
        }

        if self.runtime.halt_on_invariant_violation {
            if let Some(violation) = self.violation.take() {
                return Err(GridError::InvariantViolation(violation));
            }
        }
        self.violation = None;
        Ok(report)
    }

    fn lay_out(&mut self, price: f64) -> GridResult<()> {
        if !self.config.is_price_in_range(price) {
            warn!(
                "Price {} is outside the grid range [{}, {}]",
                price, self.config.lower_price, self.config.upper_price
            );
        }
        self.state.ladder.initialize(price, self.config.init_position)?;
        self.state.status = BotStatus::Running;
        Ok(())
    }

    async fn refresh_price(&mut self) -> GridResult<f64> {
        let price = bounded(
            self.runtime.call_timeout(),
            "get_price",
            self.exchange.get_price(&self.config.symbol),
        )
        .await?;
        if !(price.is_finite() && price > 0.0) {
            return Err(GridError::Exchange(format!("invalid price {}", price)));
        }
        self.market.update_price(price);
        Ok(price)
    }

    /// Band for placement checks: cached, then fetched, then +/-2% of `price`
    async fn current_band(&mut self, price: f64) -> PriceBand {
        if let Some(band) = self.market.fresh_band() {
            return band;
        }
        match bounded(
            self.runtime.call_timeout(),
            "get_price_band",
            self.exchange.get_price_band(&self.config.symbol),
        )
        .await
        {
            Ok(band) => {
                self.market.update_band(band);
                self.state.price_band = Some(band);
                band
            }
            Err(e) => {
                warn!("Price band unavailable ({}), using +/-2% around {}", e, price);
                PriceBand::around(price)
            }
        }
    }

    async fn poll_orders(&mut self, report: &mut CycleReport) {
        for (id, exchange_id) in self.state.ladder.orders_to_poll() {
            if self.stopping() {
                return;
            }
            let status = bounded(
                self.runtime.call_timeout(),
                "get_order_status",
                self.exchange.get_order_status(&self.config.symbol, &exchange_id),
            )
            .await;

            match status {
                Ok(status) => self.apply_status(id, &status, report),
                Err(GridError::OrderNotFound(_)) => {
                    warn!("Exchange no longer knows order {} ({})", id, exchange_id);
                    self.apply_status(id, &OrderStatusReport::cancelled(0.0), report);
                }
                Err(e) => {
                    warn!("Status poll for {} failed: {}", exchange_id, e);
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    /// Feed a status report through ladder, ledger and re-quote policy
    fn apply_status(&mut self, id: u64, status: &OrderStatusReport, report: &mut CycleReport) {
        let GridState { ladder, ledger, .. } = &mut self.state;
        let observation = match ladder.observe(id, status, |price, size| ledger.fee_for(price, size)) {
            Ok(observation) => observation,
            Err(e) => {
                warn!("Ignoring status for order {}: {}", id, e);
                return;
            }
        };

        let Some(fill) = observation.fill else {
            return;
        };

        if fill.size > 0.0 {
            match self.state.ledger.apply(&fill) {
                Ok(realized) => info!(
                    "Fill {} {} @ {} (level {:?}, fee {:.6}) realized {:.4}",
                    fill.side.as_str(),
                    fill.size,
                    fill.price,
                    fill.level,
                    fill.fee,
                    realized
                ),
                Err(e) => {
                    // Neither re-quoted nor recorded
                    self.on_violation(e.to_string());
                    return;
                }
            }
            report.fills += 1;
        }

        match self.state.ladder.on_fill(&fill) {
            FillOutcome::TargetOccupied(level) => {
                debug!("Re-quote target level {} already holds an order", level)
            }
            FillOutcome::TargetHeld(level) => info!("Re-quote skipped: level {} is held", level),
            _ => {}
        }

        if fill.size > 0.0 {
            self.state.record_fill(fill);
        }
    }

    async fn send_cancels(&mut self, report: &mut CycleReport) {
        for (id, exchange_id) in self.state.ladder.cancel_requests() {
            let cancelled = bounded(
                self.runtime.call_timeout(),
                "cancel_order",
                self.exchange.cancel_order(&self.config.symbol, &exchange_id),
            )
            .await;

            match cancelled {
                Ok(()) | Err(GridError::OrderNotFound(_)) => {
                    // Book anything that filled before the cancel landed
                    let status = bounded(
                        self.runtime.call_timeout(),
                        "get_order_status",
                        self.exchange.get_order_status(&self.config.symbol, &exchange_id),
                    )
                    .await;
                    match status {
                        Ok(status) if status.status.is_terminal() => self.apply_status(id, &status, report),
                        Ok(_) => debug!("Cancel of {} not reflected yet", exchange_id),
                        Err(_) => {
                            self.state.ladder.mark_cancelled(id);
                        }
                    }
                    report.cancelled += 1;
                }
                Err(e) => {
                    warn!("Cancel of {} failed: {}", exchange_id, e);
                    self.state.ladder.mark_cancel_failed(id, &e.to_string());
                    report.cancel_failures += 1;
                    report.errors.push(e.to_string());
                }
            }
        }
    }

    async fn send_placements(&mut self, report: &mut CycleReport) {
        let pending = self.state.ladder.pending_placements().len();
        if pending == 0 {
            return;
        }
        let Some(price) = self.market.fresh_price() else {
            debug!("No fresh price, deferring {} placements", pending);
            report.deferred += pending;
            return;
        };
        let band = self.current_band(price).await;

        // The init-position buy goes out alone; the ladder follows once it is acknowledged
        for _ in 0..2 {
            let init_only = self.state.ladder.unsent_init_order().is_some();
            let requests = self.state.ladder.pending_placements();
            if requests.is_empty() {
                break;
            }

            for request in requests {
                if self.stopping() {
                    return;
                }
                if request.kind == OrderKind::Limit && !band.allows(request.side, request.price) {
                    debug!(
                        "{} @ {} outside band {:?}, deferred",
                        request.side.as_str(),
                        request.price,
                        band
                    );
                    report.deferred += 1;
                    continue;
                }

                let placed = bounded(
                    self.runtime.call_timeout(),
                    "place_order",
                    self.exchange.place_order(&self.config.symbol, &request),
                )
                .await;

                match placed {
                    Ok(exchange_id) => {
                        debug!(
                            "Placed {} {} @ {} (level {:?}) as {}",
                            request.side.as_str(),
                            request.size,
                            request.price,
                            request.level_index,
                            exchange_id
                        );
                        match self.state.ladder.mark_placed(request.client_id, exchange_id) {
                            Ok(()) => report.placed += 1,
                            Err(e @ GridError::InvariantViolation(_)) => self.on_violation(e.to_string()),
                            Err(e) => warn!("Placed order vanished from ladder: {}", e),
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Placement {} @ {} (level {:?}) failed: {}",
                            request.side.as_str(),
                            request.price,
                            request.level_index,
                            e
                        );
                        if let Err(missing) = self
                            .state
                            .ladder
                            .mark_placement_failed(request.client_id, &e.to_string())
                        {
                            warn!("Failed order vanished from ladder: {}", missing);
                        }
                        report.place_failures += 1;
                        report.errors.push(e.to_string());
                    }
                }
            }

            // Only a freshly acknowledged init buy releases the ladder this cycle
            if !init_only || self.state.ladder.unsent_init_order().is_some() {
                break;
            }
        }
    }

    /// Invariants and failing-level alerts
    fn check_health(&mut self) {
        if let Err(e) = self.state.check_invariants() {
            self.on_violation(e.to_string());
        }

        let failing = self
            .state
            .ladder
            .failing_levels(self.runtime.failure_report_threshold);
        for &index in &failing {
            let message = match self.state.ladder.level(index) {
                Some(level) => format!(
                    "level {} ({}) placement failed {} times: {}",
                    index,
                    level.price,
                    level.failures,
                    level.last_error.as_deref().unwrap_or("unknown error")
                ),
                None => continue,
            };
            self.state.raise_alert(Some(index), message);
        }
        self.state.retain_level_alerts(&failing);

        let threshold = self.runtime.failure_report_threshold;
        let init_alert = self
            .state
            .ladder
            .unsent_init_order()
            .filter(|o| o.attempts >= threshold)
            .map(|o| {
                format!(
                    "{} of {} placement failed {} times, grid orders held back: {}",
                    INIT_ALERT,
                    o.size,
                    o.attempts,
                    o.last_error.as_deref().unwrap_or("unknown error")
                )
            });
        self.state.update_alert(INIT_ALERT, init_alert);
    }

    fn on_violation(&mut self, message: String) {
        error!("Invariant violation: {}", message);
        self.state.raise_alert(None, message.clone());
        self.violation = Some(message);
    }

    fn heartbeat(&self) {
        let every = self.runtime.heartbeat_every;
        if every == 0 || self.state.cycles % every != 0 {
            return;
        }
        let (buys, sells) = self.state.ladder.live_order_counts();
        let ledger = &self.state.ledger;
        info!(
            "[HB] cycle={} price={:?} buys={} sells={} position={:.4} realized={:.4} unrealized={:.4} fees={:.4}",
            self.state.cycles,
            self.market.last_price(),
            buys,
            sells,
            ledger.net_position(),
            ledger.realized_pnl(),
            ledger.unrealized_pnl(),
            ledger.total_fees()
        );
    }

    fn persist(&mut self) -> GridResult<()> {
        self.state.touch();
        self.store.save(&self.state)
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Bound an exchange call by `timeout`
async fn bounded<T>(timeout: Duration, what: &str, call: impl Future<Output = GridResult<T>>) -> GridResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GridError::Timeout(format!("{} exceeded {:?}", what, timeout))),
    }
}
