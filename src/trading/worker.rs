//! Per-account worker.
//!
//! Owns the account's position ledger and is its only writer. Strategy
//! orders, replicated fills and exit cycles all arrive here and are handled
//! one at a time; other components talk to it through a [`WorkerHandle`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::call_gate::AccountGate;
use super::config::ExitConfig;
use super::exit_engine::{ExitDecision, ExitEngine, ExitOverride, ExitReason};
use super::ledger::{LedgerChange, PositionLedger, ReconcileReport};
use super::risk_sizer::{RiskSizer, SizingContext};
use super::signal_bus::SignalBus;
use crate::db::StateStore;
use crate::error::{GateError, PersistenceError, WorkerError};
use crate::exchange::PriceFeed;
use crate::metrics::{PerformanceMetrics, PerformanceTracker, Streak};
use crate::models::{
    AccountId, FillConfirmation, OrderRequest, Position, PositionState, SizeType, TierName,
    TradeSide, TradeSignal,
};
use crate::shutdown::Shutdown;

const COMMAND_BUFFER: usize = 64;

/// Timer periods driving a worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerIntervals {
    /// Exit evaluation cycle
    pub cycle: Duration,

    /// Write dirty positions
    pub flush: Duration,

    /// Refresh the cached balance (also probes a degraded account)
    pub balance_refresh: Duration,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            cycle: Duration::from_secs(1),
            flush: Duration::from_secs(30),
            balance_refresh: Duration::from_secs(30),
        }
    }
}

/// Read-only view of one account, refreshed after every command and cycle.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account: AccountId,
    pub positions: Vec<Position>,
    pub streak: Streak,
    pub volatility: Option<Decimal>,
    pub metrics: PerformanceMetrics,
    pub reconciled: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.iter().filter(|p| !p.is_closed()).count()
    }
}

pub enum WorkerCommand {
    /// Strategy entry or exit on this account.
    PlaceOrder {
        order: OrderRequest,
        reply: oneshot::Sender<Result<FillConfirmation, WorkerError>>,
    },
    /// A follower order sized by the replication engine.
    Replicate {
        order: OrderRequest,
        reduce_only: bool,
        reply: oneshot::Sender<Result<FillConfirmation, WorkerError>>,
    },
    EmergencyClose {
        symbol: String,
        reply: oneshot::Sender<Result<ExitDecision, WorkerError>>,
    },
}

/// Cloneable address of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    account: AccountId,
    tx: mpsc::Sender<WorkerCommand>,
    snapshot: watch::Receiver<AccountSnapshot>,
}

impl WorkerHandle {
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        self.snapshot.borrow().clone()
    }

    pub async fn place_order(&self, order: OrderRequest) -> Result<FillConfirmation, WorkerError> {
        self.request(|reply| WorkerCommand::PlaceOrder { order, reply })
            .await?
    }

    /// Submit a replicated order. With `reduce_only` the size is capped at
    /// what the ledger holds when the order leaves, and nothing is sent when
    /// there is no opposite position.
    pub async fn replicate_order(
        &self,
        order: OrderRequest,
        reduce_only: bool,
    ) -> Result<FillConfirmation, WorkerError> {
        self.request(|reply| WorkerCommand::Replicate {
            order,
            reduce_only,
            reply,
        })
        .await?
    }

    pub async fn emergency_close(&self, symbol: &str) -> Result<ExitDecision, WorkerError> {
        self.request(|reply| WorkerCommand::EmergencyClose {
            symbol: symbol.to_string(),
            reply,
        })
        .await?
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> Result<T, WorkerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| WorkerError::Stopped(self.account.to_string()))?;
        response
            .await
            .map_err(|_| WorkerError::Stopped(self.account.to_string()))
    }
}

pub struct AccountWorker {
    gate: Arc<AccountGate>,
    ledger: PositionLedger,
    exit: ExitEngine,
    prices: Arc<dyn PriceFeed>,
    store: Arc<dyn StateStore>,
    tracker: PerformanceTracker,

    /// Present on the master only
    bus: Option<SignalBus>,

    /// Ceiling for strategy entries
    entry_limits: Option<EntryLimits>,

    rx: mpsc::Receiver<WorkerCommand>,
    snapshot_tx: watch::Sender<AccountSnapshot>,
    intervals: WorkerIntervals,
    shutdown: Shutdown,
    reconciled: bool,
}

impl AccountWorker {
    /// Load the account's ledger and build its worker. Call [`prepare`] before
    /// trading, or let the first cycle do it.
    ///
    /// [`prepare`]: AccountWorker::prepare
    pub async fn new(
        gate: Arc<AccountGate>,
        store: Arc<dyn StateStore>,
        prices: Arc<dyn PriceFeed>,
        exit: ExitConfig,
        tracker_window: usize,
        intervals: WorkerIntervals,
        shutdown: Shutdown,
    ) -> Result<(Self, WorkerHandle), PersistenceError> {
        let account = gate.id().clone();
        let ledger = PositionLedger::load(account.clone(), store.clone()).await?;
        let tracker = PerformanceTracker::new(tracker_window);

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot_of(&ledger, &tracker, false));

        let worker = Self {
            gate,
            ledger,
            exit: ExitEngine::new(exit),
            prices,
            store,
            tracker,
            bus: None,
            entry_limits: None,
            rx,
            snapshot_tx,
            intervals,
            shutdown,
            reconciled: false,
        };
        let handle = WorkerHandle {
            account,
            tx,
            snapshot: snapshot_rx,
        };

        Ok((worker, handle))
    }

    /// Publish this account's fills as trade signals.
    pub fn with_bus(mut self, bus: SignalBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Bound strategy entries by the risk sizer for this account's tier.
    pub fn with_sizer(mut self, sizer: RiskSizer, tier_override: Option<TierName>) -> Self {
        self.entry_limits = Some(EntryLimits {
            sizer,
            tier_override,
        });
        self
    }

    fn account(&self) -> &AccountId {
        self.ledger.account()
    }

    /// Reconcile the ledger with the exchange and read a first balance.
    pub async fn prepare(&mut self) -> Result<ReconcileReport, WorkerError> {
        let held = self.gate.open_positions().await?;
        let report = self.ledger.reconcile(&held, self.exit.config()).await?;

        if report.is_clean() {
            info!(account = %self.account(), positions = self.ledger.len(), "Ledger matches exchange");
        } else {
            warn!(
                account = %self.account(),
                dropped = ?report.dropped,
                adjusted = ?report.adjusted,
                adopted = ?report.adopted,
                "Ledger reconciled against exchange"
            );
        }
        self.reconciled = true;

        match self.gate.balance().await {
            Ok(reading) => info!(account = %self.account(), balance = %reading.amount, stale = reading.stale, "Starting balance"),
            Err(e) => warn!(account = %self.account(), error = %e, "Starting balance unknown"),
        }

        self.publish_snapshot();
        Ok(report)
    }

    /// Handle commands and timers until shutdown, then flush.
    pub async fn run(mut self) {
        info!(account = %self.account(), master = self.bus.is_some(), "Account worker started");

        let mut cycle = ticker(self.intervals.cycle);
        let mut flush = ticker(self.intervals.flush);
        let mut refresh = ticker(self.intervals.balance_refresh);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = cycle.tick() => self.tick().await,
                _ = flush.tick() => self.flush().await,
                _ = refresh.tick() => self.refresh_balance().await,
            }
        }

        self.flush().await;
        info!(account = %self.account(), "Account worker stopped");
    }

    async fn handle(&mut self, command: WorkerCommand) {
        // Snapshot goes out before the reply so callers see their own change.
        match command {
            WorkerCommand::PlaceOrder { order, reply } => {
                let result = self.place_order(order).await;
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            WorkerCommand::Replicate {
                order,
                reduce_only,
                reply,
            } => {
                let result = self.replicate_order(order, reduce_only).await;
                self.publish_snapshot();
                let _ = reply.send(result);
            }
            WorkerCommand::EmergencyClose { symbol, reply } => {
                let result = self.emergency_close(&symbol).await;
                self.publish_snapshot();
                let _ = reply.send(result);
            }
        }
    }

    async fn tick(&mut self) {
        if !self.reconciled {
            if let Err(e) = self.prepare().await {
                warn!(account = %self.account(), error = %e, "Reconciliation failed, exits paused");
                return;
            }
        }
        self.run_exit_cycle().await;
    }

    async fn place_order(&mut self, order: OrderRequest) -> Result<FillConfirmation, WorkerError> {
        if !self.reconciled {
            return Err(WorkerError::NotReconciled(self.account().to_string()));
        }

        // Followers scale against the capital the decision was made with.
        let balance = match self.bus {
            Some(_) => Some(self.gate.balance().await?),
            None => None,
        };

        let order = match balance {
            Some(balance) => self.bound_entry(order, balance.amount).await?,
            None => order,
        };

        let fill = self.gate.submit_order(&order).await?;
        if !fill.status.is_fill() || fill.filled_quantity <= Decimal::ZERO {
            info!(
                account = %self.account(),
                order_id = %fill.order_id,
                status = fill.status.as_str(),
                "Order did not fill"
            );
            return Ok(fill);
        }

        let closing = self
            .ledger
            .get(&order.symbol)
            .filter(|p| p.side.closing_side() == order.side)
            .map(|p| p.quantity);
        let change = self.record_fill(&order.symbol, order.side, &fill).await;

        if let (Some(bus), Some(balance)) = (&self.bus, balance) {
            let reduces = matches!(
                change,
                LedgerChange::Reduced { .. } | LedgerChange::Closed { .. }
            );
            let signal =
                TradeSignal::from_fill(self.account().clone(), &order, &fill, balance.amount, reduces);

            // A flip is a close followed by an entry on the other side.
            let signals = match (&change, closing) {
                (LedgerChange::Closed { flipped: true, .. }, Some(held)) => signal.split_flip(held),
                _ => vec![signal],
            };

            for signal in signals {
                if let Err(e) = self.store.journal_signal(&signal).await {
                    error!(order_id = %signal.order_id, error = %e, "Failed to journal signal");
                }
                let order_id = signal.order_id.clone();
                if let Err(e) = bus.publish(signal) {
                    warn!(order_id = %order_id, error = %e, "Signal not delivered");
                }
            }
        }

        Ok(fill)
    }

    async fn replicate_order(
        &mut self,
        mut order: OrderRequest,
        reduce_only: bool,
    ) -> Result<FillConfirmation, WorkerError> {
        if !self.reconciled {
            return Err(WorkerError::NotReconciled(self.account().to_string()));
        }

        if reduce_only {
            let held = self
                .ledger
                .get(&order.symbol)
                .filter(|p| p.side.closing_side() == order.side && !p.is_closed())
                .map(|p| p.quantity)
                .ok_or_else(|| WorkerError::NoPosition(order.symbol.clone()))?;
            if order.size > held {
                debug!(
                    account = %self.account(),
                    symbol = %order.symbol,
                    requested = %order.size,
                    held = %held,
                    "Reduction capped at held quantity"
                );
                order.size = held;
            }
        }

        let fill = self.gate.submit_order(&order).await?;
        if fill.status.is_fill() && fill.filled_quantity > Decimal::ZERO {
            self.record_fill(&order.symbol, order.side, &fill).await;
        }
        Ok(fill)
    }

    /// Cap an opening order at the sizer's ceiling. Reductions pass untouched.
    async fn bound_entry(
        &self,
        mut order: OrderRequest,
        balance: Decimal,
    ) -> Result<OrderRequest, WorkerError> {
        let Some(limits) = &self.entry_limits else {
            return Ok(order);
        };

        let held = self.ledger.get(&order.symbol);
        if held.is_some_and(|p| p.side.closing_side() == order.side) {
            return Ok(order);
        }

        let tier = limits.sizer.tier(balance, limits.tier_override);
        if held.is_none() && self.ledger.len() >= tier.max_concurrent_positions {
            return Err(refused(
                &order.symbol,
                format!(
                    "{} tier holds at most {} positions",
                    tier.name.as_str(),
                    tier.max_concurrent_positions
                ),
            ));
        }

        let price = self
            .prices
            .last_price(&order.symbol)
            .await
            .map_err(|e| refused(&order.symbol, format!("no price to bound the size: {}", e)))?;

        let ctx = SizingContext {
            balance,
            tier,
            streak: self.tracker.streak(),
            volatility: self.tracker.volatility(),
            price,
        };
        let ceiling = match order.size_type {
            SizeType::Base => limits
                .sizer
                .size(&ctx, Decimal::ONE)
                .round_dp_with_strategy(8, RoundingStrategy::ToZero),
            SizeType::Quote => limits
                .sizer
                .notional(&ctx, Decimal::ONE)
                .round_dp_with_strategy(2, RoundingStrategy::ToZero),
        };
        if ceiling <= Decimal::ZERO {
            return Err(refused(&order.symbol, "risk sizer allows nothing".to_string()));
        }

        if order.size > ceiling {
            warn!(
                account = %self.account(),
                symbol = %order.symbol,
                requested = %order.size,
                ceiling = %ceiling,
                tier = tier.name.as_str(),
                "Order capped by risk sizer"
            );
            order.size = ceiling;
        }
        Ok(order)
    }

    async fn record_fill(
        &mut self,
        symbol: &str,
        side: TradeSide,
        fill: &FillConfirmation,
    ) -> LedgerChange {
        let change = self
            .ledger
            .apply_fill(
                symbol,
                side,
                fill.filled_quantity,
                fill.fill_price,
                self.exit.config(),
            )
            .await;

        if let LedgerChange::Closed { trade, .. } = &change {
            self.tracker.record(trade.clone());
            debug!(account = %self.account(), streak = ?self.tracker.streak(), "Closed trade recorded");
        }
        change
    }

    async fn emergency_close(&mut self, symbol: &str) -> Result<ExitDecision, WorkerError> {
        warn!(account = %self.account(), symbol = %symbol, "Emergency close requested");
        self.evaluate(symbol, Utc::now(), Some(ExitOverride::Emergency))
            .await
    }

    async fn run_exit_cycle(&mut self) {
        let now = Utc::now();

        for symbol in self.ledger.symbols() {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.evaluate(&symbol, now, None).await {
                Ok(_) => {}
                Err(WorkerError::Gate(GateError::ShuttingDown)) => break,
                Err(e) => debug!(account = %self.account(), symbol = %symbol, error = %e, "Exit evaluation incomplete"),
            }
        }

        self.publish_snapshot();
    }

    async fn evaluate(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
        override_exit: Option<ExitOverride>,
    ) -> Result<ExitDecision, WorkerError> {
        let (state, entry_price) = self
            .ledger
            .get(symbol)
            .map(|p| (p.state, p.entry_price))
            .ok_or_else(|| WorkerError::NoPosition(symbol.to_string()))?;

        if state == PositionState::ExitFailed {
            // The failed close may have executed after all.
            let held = self.gate.open_positions().await?;
            let live = held.iter().find(|h| h.symbol == symbol);
            self.ledger.resync(symbol, live, self.exit.config()).await;

            if self.ledger.get(symbol).is_none() {
                info!(account = %self.account(), symbol = %symbol, "Exit-failed position no longer held");
                return Ok(ExitDecision::Hold);
            }
        }

        let price = match self.prices.last_price(symbol).await {
            Ok(price) => price,
            Err(e) if override_exit.is_some() => {
                warn!(symbol = %symbol, error = %e, "No price for emergency close, using entry price");
                entry_price
            }
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "No price, exit evaluation skipped");
                return Ok(ExitDecision::Hold);
            }
        };

        let decision = match self.ledger.get_mut(symbol) {
            Some(position) => self.exit.evaluate(position, price, now, override_exit),
            None => return Ok(ExitDecision::Hold),
        };

        if let ExitDecision::Close { reason, quantity } = decision {
            self.close(symbol, reason, quantity).await?;
        }
        Ok(decision)
    }

    async fn close(
        &mut self,
        symbol: &str,
        reason: ExitReason,
        quantity: Decimal,
    ) -> Result<(), WorkerError> {
        let side = self
            .ledger
            .get(symbol)
            .map(|p| p.side.closing_side())
            .ok_or_else(|| WorkerError::NoPosition(symbol.to_string()))?;
        let attempts = self.exit.config().close_retries;

        let failure = match self.gate.close_position(symbol, side, quantity, attempts).await {
            Ok(fill) if fill.status.is_fill() && fill.filled_quantity > Decimal::ZERO => {
                if let Some(position) = self.ledger.get_mut(symbol) {
                    ExitEngine::claim(position, reason, fill.filled_quantity);
                }
                info!(
                    account = %self.account(),
                    symbol = %symbol,
                    reason = %reason,
                    quantity = %fill.filled_quantity,
                    price = %fill.fill_price,
                    "Exit filled"
                );
                self.record_fill(symbol, side, &fill).await;
                return Ok(());
            }
            Ok(fill) => format!("close order {} ended {}", fill.order_id, fill.status.as_str()),
            Err(GateError::ShuttingDown) => return Err(GateError::ShuttingDown.into()),
            Err(e) => e.to_string(),
        };

        let reason = format!("{}: {}", reason, failure);
        self.ledger.mark_exit_failed(symbol, reason.clone()).await;
        Err(WorkerError::ExitFailed {
            symbol: symbol.to_string(),
            reason,
        })
    }

    async fn flush(&mut self) {
        match self.ledger.flush().await {
            Ok(0) => {}
            Ok(written) => debug!(account = %self.account(), written, "Positions flushed"),
            Err(e) => error!(account = %self.account(), error = %e, "Position flush failed, will retry"),
        }
    }

    async fn refresh_balance(&self) {
        match self.gate.balance().await {
            Ok(reading) if reading.stale => {
                debug!(account = %self.account(), cached = %reading.amount, "Balance refresh failed, cached value kept")
            }
            Ok(_) => {}
            Err(e) => debug!(account = %self.account(), error = %e, "Balance refresh failed"),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx
            .send_replace(snapshot_of(&self.ledger, &self.tracker, self.reconciled));
    }
}

/// Interval whose first tick is one period away.
fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn snapshot_of(
    ledger: &PositionLedger,
    tracker: &PerformanceTracker,
    reconciled: bool,
) -> AccountSnapshot {
    AccountSnapshot {
        account: ledger.account().clone(),
        positions: ledger.snapshot(),
        streak: tracker.streak(),
        volatility: tracker.volatility(),
        metrics: tracker.metrics(),
        reconciled,
        updated_at: Utc::now(),
    }
}

struct EntryLimits {
    sizer: RiskSizer,
    tier_override: Option<TierName>,
}

fn refused(symbol: &str, reason: String) -> WorkerError {
    WorkerError::OrderRefused {
        symbol: symbol.to_string(),
        reason,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::account;
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::error::ExchangeError;
    use crate::exchange::PaperMarket;
    use crate::models::{AccountRole, OrderStatus, PositionSide};
    use rust_decimal_macros::dec;

    fn market() -> Arc<PaperMarket> {
        let market = PaperMarket::new();
        market.set_price("BTC-USD", dec!(100));
        market
    }

    #[tokio::test]
    async fn test_master_fill_is_journaled_and_published() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let bus = SignalBus::new(16);
        let mut stream = bus.subscribe();

        let master = account("master", AccountRole::Master, dec!(10000), &market, db.clone(), &shutdown).await;
        let mut worker = master.worker.with_bus(bus.clone());
        worker.prepare().await.unwrap();

        let fill = worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();
        let signal = stream.next().await.unwrap();
        assert_eq!(signal.order_id, fill.order_id);
        assert_eq!(signal.master_balance, dec!(10000));
        assert_eq!(signal.filled_quantity, dec!(2));
        assert!(!signal.reduces_position);
        assert_eq!(db.pending_signals().await.unwrap().len(), 1);

        worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Sell, dec!(1)))
            .await
            .unwrap();
        let signal = stream.next().await.unwrap();
        assert!(signal.reduces_position);
        assert_eq!(worker.ledger.get("BTC-USD").unwrap().quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_master_entries_capped_by_sizer() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let bus = SignalBus::new(16);
        let _stream = bus.subscribe();

        let master = account("master", AccountRole::Master, dec!(10000), &market, db, &shutdown).await;
        let mut worker = master
            .worker
            .with_bus(bus.clone())
            .with_sizer(RiskSizer::new(crate::trading::TradingConfig::default()), None);
        worker.prepare().await.unwrap();

        // Standard tier: 5% of 10000 at price 100 is 5 BTC.
        let fill = worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(20)))
            .await
            .unwrap();
        assert_eq!(fill.filled_quantity, dec!(5));

        // Reductions are never capped.
        let fill = worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Sell, dec!(5)))
            .await
            .unwrap();
        assert_eq!(fill.filled_quantity, dec!(5));
        assert!(worker.ledger.get("BTC-USD").is_none());

        let err = worker
            .place_order(OrderRequest::base("DOGE-USD", TradeSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::OrderRefused { .. }));
        assert_eq!(master.exchange.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_unfilled_order_is_not_published() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let bus = SignalBus::new(16);
        let mut stream = bus.subscribe();

        let master = account("master", AccountRole::Master, dec!(10000), &market, db.clone(), &shutdown).await;
        master.exchange.set_fill_status(OrderStatus::Cancelled);
        let mut worker = master.worker.with_bus(bus.clone());
        worker.prepare().await.unwrap();

        let fill = worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();
        assert_eq!(fill.status, OrderStatus::Cancelled);
        assert!(worker.ledger.is_empty());
        assert!(db.pending_signals().await.unwrap().is_empty());

        drop(worker);
        drop(bus);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_orders_refused_before_reconciliation() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;

        let result = acct
            .worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(1)))
            .await;
        assert!(matches!(result, Err(WorkerError::NotReconciled(_))));
        assert!(acct.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_stop_loss_closes_through_gate() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;
        acct.worker.prepare().await.unwrap();

        acct.worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();
        market.set_price("BTC-USD", dec!(94));
        acct.worker.run_exit_cycle().await;

        assert!(acct.worker.ledger.get("BTC-USD").is_none());
        assert!(acct.exchange.holding("BTC-USD").is_none());

        let snapshot = acct.handle.snapshot();
        assert!(snapshot.positions.is_empty());
        assert_eq!(snapshot.streak, Streak::losses(1));
        assert_eq!(snapshot.metrics.total_trades, 1);
    }

    #[tokio::test]
    async fn test_exhausted_close_marks_exit_failed_then_recovers() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db.clone(), &shutdown).await;
        acct.worker.prepare().await.unwrap();

        acct.worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();
        market.set_price("BTC-USD", dec!(94));
        acct.exchange
            .fail_next_n(ExchangeError::Rejected("book busy".into()), 3);
        acct.worker.run_exit_cycle().await;

        let position = acct.worker.ledger.get("BTC-USD").unwrap();
        assert_eq!(position.state, PositionState::ExitFailed);
        assert!(position.exit_failure.as_deref().unwrap().starts_with("STOP_LOSS"));

        let stored = db.load_positions(&AccountId::new("acct")).await.unwrap();
        assert_eq!(stored[0].state, PositionState::ExitFailed);

        // Next cycle re-checks the exchange and closes.
        acct.worker.run_exit_cycle().await;
        assert!(acct.worker.ledger.get("BTC-USD").is_none());
        assert!(db.load_positions(&AccountId::new("acct")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_close_reports_emergency_reason() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;
        acct.worker.prepare().await.unwrap();

        acct.worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();

        let decision = acct.worker.emergency_close("BTC-USD").await.unwrap();
        assert_eq!(decision.reason(), Some(ExitReason::Emergency));
        assert!(acct.worker.ledger.is_empty());

        assert!(matches!(
            acct.worker.emergency_close("ETH-USD").await,
            Err(WorkerError::NoPosition(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_adopts_exchange_positions() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;
        acct.exchange
            .hold("ETH-USD", PositionSide::Long, dec!(3), dec!(50));

        let report = acct.worker.prepare().await.unwrap();
        assert_eq!(report.adopted, vec!["ETH-USD".to_string()]);

        let snapshot = acct.handle.snapshot();
        assert!(snapshot.reconciled);
        assert_eq!(snapshot.position("ETH-USD").unwrap().quantity, dec!(3));
    }

    #[tokio::test]
    async fn test_master_flip_publishes_close_then_entry() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let bus = SignalBus::new(16);
        let mut stream = bus.subscribe();

        let master = account("master", AccountRole::Master, dec!(10000), &market, db.clone(), &shutdown).await;
        let mut worker = master.worker.with_bus(bus.clone());
        worker.prepare().await.unwrap();

        worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(1)))
            .await
            .unwrap();
        stream.next().await.unwrap();

        let fill = worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Sell, dec!(3)))
            .await
            .unwrap();

        let close = stream.next().await.unwrap();
        assert_eq!(close.order_id, fill.order_id);
        assert!(close.reduces_position);
        assert_eq!(close.filled_quantity, dec!(1));

        let entry = stream.next().await.unwrap();
        assert_eq!(entry.order_id, format!("{}:open", fill.order_id));
        assert!(!entry.reduces_position);
        assert_eq!(entry.side, TradeSide::Sell);
        assert_eq!(entry.filled_quantity, dec!(2));

        let position = worker.ledger.get("BTC-USD").unwrap();
        assert_eq!((position.side, position.quantity), (PositionSide::Short, dec!(2)));
        assert_eq!(db.pending_signals().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_partial_profit_fill_keeps_rest_of_rung() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;
        acct.worker.prepare().await.unwrap();

        acct.worker
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(4)))
            .await
            .unwrap();
        market.set_price("BTC-USD", dec!(105));

        // Rung 1 asks for 1, the exchange fills 0.4 of it.
        acct.exchange.set_fill_ratio(dec!(0.4));
        acct.worker.run_exit_cycle().await;

        let position = acct.worker.ledger.get("BTC-USD").unwrap();
        assert_eq!(position.quantity, dec!(3.6));
        assert!(!position.targets[0].claimed);

        acct.exchange.set_fill_ratio(Decimal::ONE);
        acct.worker.run_exit_cycle().await;

        let position = acct.worker.ledger.get("BTC-USD").unwrap();
        assert_eq!(position.quantity, dec!(3.0));
        assert!(position.targets[0].claimed);
        assert!(!position.targets[1].claimed);
    }

    #[tokio::test]
    async fn test_replicated_reduction_is_capped_by_ledger() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown)
            .await
            .start()
            .await;
        let handle = acct.handle.clone();

        let fill = handle
            .replicate_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)), false)
            .await
            .unwrap();
        assert_eq!(fill.filled_quantity, dec!(2));
        assert_eq!(handle.snapshot().open_position_count(), 1);

        // The account's own exit closes the position before the reduction lands.
        handle.emergency_close("BTC-USD").await.unwrap();
        let result = handle
            .replicate_order(OrderRequest::base("BTC-USD", TradeSide::Sell, dec!(2)), true)
            .await;
        assert!(matches!(result, Err(WorkerError::NoPosition(_))));
        assert_eq!(acct.exchange.orders().len(), 2);
        assert!(acct.exchange.holding("BTC-USD").is_none());

        handle
            .replicate_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)), false)
            .await
            .unwrap();
        let fill = handle
            .replicate_order(OrderRequest::base("BTC-USD", TradeSide::Sell, dec!(5)), true)
            .await
            .unwrap();
        assert_eq!(fill.filled_quantity, dec!(2));
        assert!(handle.snapshot().positions.is_empty());
        assert!(acct.exchange.holding("BTC-USD").is_none());

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_handle_commands_until_shutdown() {
        let (_dir, db) = temp_database().await;
        let market = market();
        let shutdown = Shutdown::new();
        let mut acct = account("acct", AccountRole::Follower, dec!(1000), &market, db, &shutdown).await;
        acct.worker.prepare().await.unwrap();
        let handle = acct.handle.clone();
        let task = tokio::spawn(acct.worker.run());

        let fill = handle
            .replicate_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(0.5)), false)
            .await
            .unwrap();
        assert_eq!(fill.status, OrderStatus::Filled);
        assert_eq!(handle.snapshot().open_position_count(), 1);

        shutdown.trigger();
        task.await.unwrap();

        let result = handle
            .place_order(OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(1)))
            .await;
        assert!(matches!(result, Err(WorkerError::Stopped(_))));
    }
}
