//! Replication engine: fans each master signal out to every follower.
//!
//! Followers are sized by capital (`quantity * follower_balance /
//! master_balance`), clamped by the risk sizer, and submitted concurrently
//! through their own call gates. A follower's failure is recorded as its own
//! outcome and never touches another follower. An outcome row per
//! (order_id, follower) makes redelivery harmless.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::call_gate::AccountGate;
use super::config::ReplicationConfig;
use super::risk_sizer::{RiskSizer, SizingContext};
use super::signal_bus::SignalStream;
use super::worker::WorkerHandle;
use crate::db::StateStore;
use crate::error::{GateError, PersistenceError, WorkerError};
use crate::models::{
    AccountHealth, AccountId, OrderRequest, ReplicationOutcome, ReplicationResult, SizeType,
    SkipReason, TierName, TradeSignal,
};
use crate::shutdown::Shutdown;

/// Per-exchange order constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeLimits {
    /// Smallest order notional the exchange accepts
    pub min_order_notional: Decimal,

    /// Decimal places allowed in a base quantity
    pub quantity_precision: u32,
}

impl Default for ExchangeLimits {
    fn default() -> Self {
        Self {
            min_order_notional: Decimal::TEN,
            quantity_precision: 8,
        }
    }
}

/// Everything the engine needs to replicate onto one follower.
pub struct FollowerHandle {
    pub gate: Arc<AccountGate>,
    pub worker: WorkerHandle,
    pub tier_override: Option<TierName>,
    pub limits: ExchangeLimits,
}

impl FollowerHandle {
    pub fn id(&self) -> &AccountId {
        self.gate.id()
    }
}

/// Follower set, read once per signal.
#[derive(Default)]
pub struct FollowerRegistry {
    followers: RwLock<Vec<Arc<FollowerHandle>>>,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, follower: FollowerHandle) {
        info!(follower = %follower.id(), "Follower registered");
        self.followers.write().await.push(Arc::new(follower));
    }

    pub async fn snapshot(&self) -> Vec<Arc<FollowerHandle>> {
        self.followers.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.followers.read().await.len()
    }
}

/// Counts for one fanned-out signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    pub filled: usize,
    pub skipped: usize,
    pub failed: usize,

    /// Followers that already had an outcome for this signal
    pub duplicates: usize,

    /// Followers left for a later replay (shutdown or store failure)
    pub interrupted: usize,
}

enum Attempt {
    Recorded(ReplicationResult),
    Duplicate,
    Interrupted,
}

/// Size placed (or that would have been) and what happened; `None` when
/// nothing was decided.
type Decision = Option<(Decimal, ReplicationResult)>;

fn skipped(size: Decimal, reason: SkipReason) -> Decision {
    Some((size, ReplicationResult::Skipped { reason }))
}

fn failed(size: Decimal, error: String) -> Decision {
    Some((size, ReplicationResult::Failed { error }))
}

pub struct ReplicationEngine {
    registry: Arc<FollowerRegistry>,
    store: Arc<dyn StateStore>,
    sizer: RiskSizer,
    config: ReplicationConfig,
    shutdown: Shutdown,
}

impl ReplicationEngine {
    pub fn new(
        registry: Arc<FollowerRegistry>,
        store: Arc<dyn StateStore>,
        sizer: RiskSizer,
        config: ReplicationConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            registry,
            store,
            sizer,
            config,
            shutdown,
        }
    }

    /// Consume the bus in publish order until shutdown or until it closes.
    pub async fn run(&self, mut signals: SignalStream) {
        let followers = self.registry.len().await;
        info!(followers, "Replication engine started");

        loop {
            let signal = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                signal = signals.next() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            let dropped = signals.take_lagged();
            if dropped > 0 {
                warn!(dropped, "Signals dropped by the bus, replaying journal");
                if let Err(e) = self.replay_pending().await {
                    error!(error = %e, "Journal replay failed");
                }
            }

            self.replicate(&signal).await;
        }

        info!("Replication engine stopped");
    }

    /// Replicate every journaled signal whose fan-out never completed.
    pub async fn replay_pending(&self) -> Result<usize, PersistenceError> {
        let pending = self.store.pending_signals().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Replaying journaled signals");
        }

        for signal in &pending {
            self.replicate(signal).await;
        }
        Ok(pending.len())
    }

    /// Fan one signal out to the current follower set.
    #[instrument(skip(self, signal), fields(order_id = %signal.order_id, symbol = %signal.symbol))]
    pub async fn replicate(&self, signal: &TradeSignal) -> ReplicationSummary {
        let followers = self.registry.snapshot().await;

        let pending: Vec<BoxFuture<'_, Attempt>> = followers
            .into_iter()
            .map(|follower| async move { self.replicate_to(signal, &follower).await }.boxed())
            .collect();

        let attempts: Vec<Attempt> = stream::iter(pending)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut summary = ReplicationSummary::default();
        for attempt in attempts {
            match attempt {
                Attempt::Recorded(ReplicationResult::Filled { .. }) => summary.filled += 1,
                Attempt::Recorded(ReplicationResult::Skipped { .. }) => summary.skipped += 1,
                Attempt::Recorded(ReplicationResult::Failed { .. }) => summary.failed += 1,
                Attempt::Duplicate => summary.duplicates += 1,
                Attempt::Interrupted => summary.interrupted += 1,
            }
        }

        if summary.interrupted == 0 {
            if let Err(e) = self.store.complete_signal(&signal.order_id).await {
                error!(error = %e, "Failed to complete journal entry, signal will be replayed");
            }
        }

        info!(
            filled = summary.filled,
            skipped = summary.skipped,
            failed = summary.failed,
            duplicates = summary.duplicates,
            interrupted = summary.interrupted,
            "Signal replicated"
        );
        summary
    }

    async fn replicate_to(&self, signal: &TradeSignal, follower: &FollowerHandle) -> Attempt {
        let id = follower.id();

        match self.store.has_outcome(&signal.order_id, id).await {
            Ok(true) => {
                debug!(follower = %id, "Already replicated");
                return Attempt::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                error!(follower = %id, error = %e, "Replication history unreadable, deferring");
                return Attempt::Interrupted;
            }
        }

        let Some((size, result)) = self.execute(signal, follower).await else {
            return Attempt::Interrupted;
        };

        let outcome = ReplicationOutcome::new(
            &signal.order_id,
            id.clone(),
            &signal.symbol,
            signal.side,
            size,
            result.clone(),
        );

        match self.store.save_outcome(&outcome).await {
            Ok(true) => Attempt::Recorded(result),
            Ok(false) => Attempt::Duplicate,
            Err(e) => {
                // The order may have executed; a replay must not place it again.
                error!(follower = %id, status = result.status_str(), error = %e, "Replication outcome not recorded");
                Attempt::Recorded(result)
            }
        }
    }

    /// Size and submit for one follower.
    async fn execute(&self, signal: &TradeSignal, follower: &FollowerHandle) -> Decision {
        if self.shutdown.is_triggered() {
            return None;
        }

        let id = follower.id();

        if follower.gate.health().await == AccountHealth::Unavailable {
            warn!(follower = %id, "Follower unavailable, skipped");
            return skipped(Decimal::ZERO, SkipReason::AccountUnavailable);
        }

        let balance = match follower.gate.balance().await {
            Ok(reading) => reading.amount,
            Err(e) => {
                warn!(follower = %id, error = %e, "Follower balance unknown, skipped");
                return skipped(Decimal::ZERO, SkipReason::NoBalance);
            }
        };

        if signal.master_balance <= Decimal::ZERO {
            return failed(
                Decimal::ZERO,
                format!("master balance {} is not positive", signal.master_balance),
            );
        }

        let Some(proportional) = balance
            .checked_div(signal.master_balance)
            .and_then(|ratio| signal.filled_quantity.checked_mul(ratio))
        else {
            warn!(
                follower = %id,
                balance = %balance,
                master_balance = %signal.master_balance,
                "Proportional size out of range, skipped"
            );
            return failed(Decimal::ZERO, "proportional size out of range".to_string());
        };
        let snapshot = follower.worker.snapshot();
        let tier = self.sizer.tier(balance, follower.tier_override);
        let price = signal.fill_price;

        let (quantity, minimum) = if signal.reduces_position {
            // Advisory only; the follower's worker caps again against its ledger.
            let held = snapshot
                .position(&signal.symbol)
                .filter(|p| p.side.closing_side() == signal.side && !p.is_closed());
            let Some(position) = held else {
                debug!(follower = %id, "Nothing to reduce");
                return skipped(Decimal::ZERO, SkipReason::NothingToReduce);
            };
            (proportional.min(position.quantity), follower.limits.min_order_notional)
        } else {
            let opens_new = snapshot.position(&signal.symbol).is_none();
            if opens_new && snapshot.open_position_count() >= tier.max_concurrent_positions {
                info!(follower = %id, tier = tier.name.as_str(), "Follower at max positions, skipped");
                return skipped(Decimal::ZERO, SkipReason::MaxPositions);
            }

            let ceiling = self.sizer.size(
                &SizingContext {
                    balance,
                    tier,
                    streak: snapshot.streak,
                    volatility: snapshot.volatility,
                    price,
                },
                self.config.signal_strength,
            );
            if proportional > ceiling {
                debug!(follower = %id, proportional = %proportional, ceiling = %ceiling, "Clamped to risk ceiling");
            }
            (
                proportional.min(ceiling),
                tier.min_order_notional.max(follower.limits.min_order_notional),
            )
        };

        let quantity = quantity.round_dp_with_strategy(
            follower.limits.quantity_precision,
            RoundingStrategy::ToZero,
        );
        let Some(notional) = quantity.checked_mul(price) else {
            warn!(follower = %id, quantity = %quantity, price = %price, "Order notional out of range, skipped");
            return failed(quantity, "order notional out of range".to_string());
        };

        if quantity <= Decimal::ZERO || notional < minimum {
            info!(
                follower = %id,
                quantity = %quantity,
                notional = %notional,
                minimum = %minimum,
                "Below minimum order size, skipped"
            );
            return skipped(quantity, SkipReason::BelowMinimum);
        }

        // Reductions are capped in base units, so they are always sent in base units.
        let order = match signal.size_type {
            SizeType::Quote if !signal.reduces_position => OrderRequest {
                symbol: signal.symbol.clone(),
                side: signal.side,
                size: notional.round_dp_with_strategy(2, RoundingStrategy::ToZero),
                size_type: SizeType::Quote,
            },
            _ => OrderRequest::base(&signal.symbol, signal.side, quantity),
        };
        let size = order.size;

        match follower
            .worker
            .replicate_order(order, signal.reduces_position)
            .await
        {
            Ok(fill) if fill.status.is_fill() && fill.filled_quantity > Decimal::ZERO => {
                info!(
                    follower = %id,
                    side = signal.side.as_str(),
                    quantity = %fill.filled_quantity,
                    price = %fill.fill_price,
                    "Replicated"
                );
                Some((
                    size,
                    ReplicationResult::Filled {
                        exchange_order_id: fill.order_id,
                        quantity: fill.filled_quantity,
                        price: fill.fill_price,
                    },
                ))
            }
            Ok(fill) => failed(
                size,
                format!("order {} ended {}", fill.order_id, fill.status.as_str()),
            ),
            Err(WorkerError::Gate(GateError::ShuttingDown)) | Err(WorkerError::Stopped(_)) => None,
            Err(WorkerError::Gate(e)) if e.is_unsupported_symbol() => {
                info!(follower = %id, "Symbol not supported on follower exchange, skipped");
                skipped(size, SkipReason::UnsupportedSymbol)
            }
            Err(WorkerError::NoPosition(_)) => {
                debug!(follower = %id, "Position gone before the reduction, skipped");
                skipped(Decimal::ZERO, SkipReason::NothingToReduce)
            }
            Err(e) => {
                warn!(follower = %id, error = %e, "Follower order failed");
                failed(size, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::db::Database;
    use crate::error::ExchangeError;
    use crate::exchange::PaperMarket;
    use crate::models::{AccountRole, OrderStatus, PositionSide, TradeSide};
    use crate::trading::config::TradingConfig;
    use crate::trading::signal_bus::SignalBus;
    use crate::trading::worker::test_support::{account, RunningAccount};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        market: Arc<PaperMarket>,
        shutdown: Shutdown,
        registry: Arc<FollowerRegistry>,
    }

    async fn fixture() -> Fixture {
        let (dir, db) = temp_database().await;
        let market = PaperMarket::new();
        market.set_price("BTC-USD", dec!(1));

        Fixture {
            _dir: dir,
            db,
            market,
            shutdown: Shutdown::new(),
            registry: Arc::new(FollowerRegistry::new()),
        }
    }

    impl Fixture {
        async fn follower(
            &self,
            id: &str,
            balance: Decimal,
            tier_override: Option<TierName>,
        ) -> RunningAccount {
            let running = account(
                id,
                AccountRole::Follower,
                balance,
                &self.market,
                self.db.clone(),
                &self.shutdown,
            )
            .await
            .start()
            .await;

            self.registry
                .register(FollowerHandle {
                    gate: running.gate.clone(),
                    worker: running.handle.clone(),
                    tier_override,
                    limits: ExchangeLimits {
                        min_order_notional: dec!(1),
                        quantity_precision: 8,
                    },
                })
                .await;
            running
        }

        fn engine(&self, trading: TradingConfig) -> ReplicationEngine {
            ReplicationEngine::new(
                self.registry.clone(),
                self.db.clone(),
                RiskSizer::new(trading),
                ReplicationConfig::default(),
                self.shutdown.clone(),
            )
        }

        async fn outcome_for(&self, follower: &str) -> ReplicationResult {
            self.db
                .recent_outcomes(100)
                .await
                .unwrap()
                .into_iter()
                .find(|o| o.follower_id == follower)
                .and_then(|o| o.result())
                .unwrap()
        }
    }

    fn signal(order_id: &str, symbol: &str, side: TradeSide, quantity: Decimal) -> TradeSignal {
        TradeSignal {
            order_id: order_id.to_string(),
            master_account: AccountId::new("master"),
            symbol: symbol.to_string(),
            side,
            filled_quantity: quantity,
            fill_price: dec!(1),
            size_type: SizeType::Base,
            master_balance: dec!(10000),
            status: OrderStatus::Filled,
            filled_at: Utc::now(),
            reduces_position: false,
        }
    }

    fn buy(order_id: &str) -> TradeSignal {
        signal(order_id, "BTC-USD", TradeSide::Buy, dec!(100))
    }

    fn skip_reason(result: ReplicationResult) -> Option<SkipReason> {
        match result {
            ReplicationResult::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_sizes_proportionally_to_balance() {
        let fx = fixture().await;
        let small = fx.follower("small", dec!(1000), None).await;
        let large = fx.follower("large", dec!(50000), None).await;
        let engine = fx.engine(TradingConfig::default());

        let summary = engine.replicate(&buy("m-1")).await;

        assert_eq!(summary.filled, 2);
        assert_eq!(small.exchange.orders()[0].size, dec!(10));
        assert_eq!(large.exchange.orders()[0].size, dec!(500));
        assert_eq!(small.exchange.orders()[0].side, TradeSide::Buy);
        assert_eq!(
            small.handle.snapshot().position("BTC-USD").unwrap().quantity,
            dec!(10)
        );
    }

    #[tokio::test]
    async fn test_tier_ceiling_clamps_large_follower() {
        let fx = fixture().await;
        let large = fx
            .follower("large", dec!(50000), Some(TierName::Conservative))
            .await;

        let mut trading = TradingConfig::default();
        trading.tiers.conservative.max_position_fraction = dec!(0.005);
        let engine = fx.engine(trading);

        engine.replicate(&buy("m-1")).await;

        // 50000 * 0.5% = 250, below the proportional 500.
        assert_eq!(large.exchange.orders()[0].size, dec!(250));
        let stored = fx.db.recent_outcomes(10).await.unwrap();
        assert_eq!(stored[0].size(), dec!(250));
    }

    #[tokio::test]
    async fn test_failing_follower_does_not_block_others() {
        let fx = fixture().await;
        let a = fx.follower("a", dec!(1000), None).await;
        let b = fx.follower("b", dec!(1000), None).await;
        let c = fx.follower("c", dec!(1000), None).await;
        // One for the balance read, then every order attempt.
        b.exchange
            .fail_next_n(ExchangeError::Rejected("insufficient margin".into()), 4);
        let engine = fx.engine(TradingConfig::default());

        let summary = engine.replicate(&buy("m-1")).await;

        assert_eq!(summary.filled, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(a.exchange.orders().len(), 1);
        assert_eq!(c.exchange.orders().len(), 1);
        assert!(b.exchange.orders().is_empty());
        assert!(matches!(
            fx.outcome_for("b").await,
            ReplicationResult::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_places_one_order() {
        let fx = fixture().await;
        let a = fx.follower("a", dec!(1000), None).await;
        let b = fx.follower("b", dec!(2000), None).await;
        let engine = fx.engine(TradingConfig::default());
        let signal = buy("m-1");

        let first = engine.replicate(&signal).await;
        let second = engine.replicate(&signal).await;

        assert_eq!(first.filled, 2);
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.filled, 0);
        assert_eq!(a.exchange.orders().len(), 1);
        assert_eq!(b.exchange.orders().len(), 1);
        assert_eq!(fx.db.recent_outcomes(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_below_minimum_is_skipped() {
        let fx = fixture().await;
        let tiny = fx.follower("tiny", dec!(50), None).await;
        let engine = fx.engine(TradingConfig::default());

        let summary = engine.replicate(&buy("m-1")).await;

        // 0.5 units of notional 0.5, under the tier minimum of 10.
        assert_eq!(summary.skipped, 1);
        assert!(tiny.exchange.orders().is_empty());
        assert_eq!(
            skip_reason(fx.outcome_for("tiny").await),
            Some(SkipReason::BelowMinimum)
        );
    }

    #[tokio::test]
    async fn test_unavailable_follower_is_skipped() {
        let fx = fixture().await;
        let down = fx.follower("down", dec!(1000), None).await;
        down.exchange
            .fail_next_n(ExchangeError::Network("connection reset".into()), 3);
        let reading = down.gate.balance().await.unwrap();
        assert!(reading.stale);
        assert_eq!(down.gate.health().await, AccountHealth::Unavailable);

        let engine = fx.engine(TradingConfig::default());
        engine.replicate(&buy("m-1")).await;

        assert!(down.exchange.orders().is_empty());
        assert_eq!(
            skip_reason(fx.outcome_for("down").await),
            Some(SkipReason::AccountUnavailable)
        );
    }

    #[tokio::test]
    async fn test_unsupported_symbol_is_skipped_without_health_penalty() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        f.exchange.mark_unsupported("BTC-USD");
        let engine = fx.engine(TradingConfig::default());

        engine.replicate(&buy("m-1")).await;

        assert_eq!(
            skip_reason(fx.outcome_for("f").await),
            Some(SkipReason::UnsupportedSymbol)
        );
        assert_eq!(f.gate.health().await, AccountHealth::Available);
    }

    #[tokio::test]
    async fn test_reduce_is_capped_at_held_quantity() {
        let fx = fixture().await;
        let holder = fx.follower("holder", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());
        engine.replicate(&buy("m-1")).await;

        let late = fx.follower("late", dec!(1000), None).await;

        let mut sell = signal("m-2", "BTC-USD", TradeSide::Sell, dec!(1000));
        sell.reduces_position = true;
        engine.replicate(&sell).await;

        // Proportional 100, but only 10 is held.
        let orders = holder.exchange.orders();
        assert_eq!(orders[1].side, TradeSide::Sell);
        assert_eq!(orders[1].size, dec!(10));
        assert!(holder.handle.snapshot().positions.is_empty());

        assert!(late.exchange.orders().is_empty());
        assert_eq!(
            skip_reason(fx.outcome_for("late").await),
            Some(SkipReason::NothingToReduce)
        );
    }

    #[tokio::test]
    async fn test_master_flip_moves_follower_to_other_side() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());
        engine.replicate(&buy("m-1")).await;

        // Master long 100 sells 300: close 100, then open 200 short.
        let mut flip = signal("m-2", "BTC-USD", TradeSide::Sell, dec!(300));
        flip.reduces_position = true;
        for leg in flip.split_flip(dec!(100)) {
            engine.replicate(&leg).await;
        }

        let orders = f.exchange.orders();
        assert_eq!(orders.len(), 3);
        assert_eq!((orders[1].side, orders[1].size), (TradeSide::Sell, dec!(10)));
        assert_eq!((orders[2].side, orders[2].size), (TradeSide::Sell, dec!(20)));

        let snapshot = f.handle.snapshot();
        let position = snapshot.position("BTC-USD").unwrap();
        assert_eq!((position.side, position.quantity), (PositionSide::Short, dec!(20)));
    }

    #[tokio::test]
    async fn test_quote_sized_signal_replicates_proportional_notional() {
        let fx = fixture().await;
        fx.market.set_price("ETH-USD", dec!(50));
        let f = fx
            .follower("f", dec!(2000), Some(TierName::Aggressive))
            .await;
        let engine = fx.engine(TradingConfig::default());

        let mut quote = signal("m-1", "ETH-USD", TradeSide::Buy, dec!(10));
        quote.fill_price = dec!(50);
        quote.size_type = SizeType::Quote;
        let summary = engine.replicate(&quote).await;

        // A fifth of the master's 10 ETH is 2 ETH, sent as 100 of quote.
        assert_eq!(summary.filled, 1);
        let orders = f.exchange.orders();
        assert_eq!(orders[0].size_type, SizeType::Quote);
        assert_eq!(orders[0].size, dec!(100));
        assert_eq!(f.handle.snapshot().position("ETH-USD").unwrap().quantity, dec!(2));

        match fx.outcome_for("f").await {
            ReplicationResult::Filled { quantity, price, .. } => {
                assert_eq!(quantity, dec!(2));
                assert_eq!(price, dec!(50));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fx.db.recent_outcomes(1).await.unwrap()[0].size(), dec!(100));
    }

    #[tokio::test]
    async fn test_out_of_range_ratio_fails_without_order() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());

        let mut tiny_master = buy("m-1");
        tiny_master.master_balance = Decimal::new(1, 28);
        let summary = engine.replicate(&tiny_master).await;

        assert_eq!(summary.failed, 1);
        assert!(f.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_max_positions_blocks_new_symbols() {
        let fx = fixture().await;
        for symbol in ["AAA-USD", "BBB-USD", "CCC-USD", "DDD-USD"] {
            fx.market.set_price(symbol, dec!(1));
        }
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());

        // Conservative tier at this balance: three positions at most.
        for (n, symbol) in ["AAA-USD", "BBB-USD", "CCC-USD", "DDD-USD"].iter().enumerate() {
            let order_id = format!("m-{}", n);
            engine
                .replicate(&signal(&order_id, symbol, TradeSide::Buy, dec!(100)))
                .await;
        }

        assert_eq!(f.exchange.orders().len(), 3);
        assert_eq!(
            skip_reason(fx.outcome_for("f").await),
            Some(SkipReason::MaxPositions)
        );
    }

    #[tokio::test]
    async fn test_replay_completes_journal() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());
        fx.db.journal_signal(&buy("m-1")).await.unwrap();

        assert_eq!(engine.replay_pending().await.unwrap(), 1);
        assert!(fx.db.pending_signals().await.unwrap().is_empty());
        assert_eq!(f.exchange.orders().len(), 1);

        assert_eq!(engine.replay_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_signal_for_replay() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());
        let signal = buy("m-1");
        fx.db.journal_signal(&signal).await.unwrap();

        fx.shutdown.trigger();
        let summary = engine.replicate(&signal).await;

        assert_eq!(summary.interrupted, 1);
        assert!(f.exchange.orders().is_empty());
        assert_eq!(fx.db.pending_signals().await.unwrap().len(), 1);
        assert!(fx.db.recent_outcomes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_consumes_bus_until_shutdown() {
        let fx = fixture().await;
        let f = fx.follower("f", dec!(1000), None).await;
        let engine = fx.engine(TradingConfig::default());
        let bus = SignalBus::new(16);
        let stream = bus.subscribe();
        let task = tokio::spawn(async move { engine.run(stream).await });

        bus.publish(buy("m-1")).unwrap();
        for _ in 0..100 {
            if !f.exchange.orders().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.exchange.orders().len(), 1);

        fx.shutdown.trigger();
        task.await.unwrap();
    }
}
