//! Per-account position ledger.
//!
//! Owned by the account's worker, which is the only writer. Quantity changes
//! are persisted immediately; trailing/ladder state changes are marked dirty
//! and written on the next flush.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::config::ExitConfig;
use crate::db::StateStore;
use crate::error::PersistenceError;
use crate::exchange::HeldPosition;
use crate::metrics::ClosedTrade;
use crate::models::{
    AccountId, Position, PositionSide, PositionState, ProtectiveLevels, TradeSide,
};

/// What a fill did to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerChange {
    Opened,
    Increased,
    Reduced { realized: Decimal },
    /// Went flat; a flip also reports the new opposite position as opened.
    Closed { trade: ClosedTrade, flipped: bool },
}

/// Summary of a startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub dropped: Vec<String>,
    pub adjusted: Vec<String>,
    pub adopted: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.adjusted.is_empty() && self.adopted.is_empty()
    }
}

pub struct PositionLedger {
    account: AccountId,
    store: Arc<dyn StateStore>,
    positions: BTreeMap<String, Position>,
    dirty: HashSet<String>,
}

impl PositionLedger {
    /// Load the account's persisted positions.
    pub async fn load(account: AccountId, store: Arc<dyn StateStore>) -> Result<Self, PersistenceError> {
        let positions = store
            .load_positions(&account)
            .await?
            .into_iter()
            .filter(|p| !p.is_closed())
            .map(|p| (p.symbol.clone(), p))
            .collect::<BTreeMap<_, _>>();

        debug!(account = %account, count = positions.len(), "Ledger loaded");

        Ok(Self {
            account,
            store,
            positions,
            dirty: HashSet::new(),
        })
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        // Caller may change trailing or ladder state.
        if self.positions.contains_key(symbol) {
            self.dirty.insert(symbol.to_string());
        }
        self.positions.get_mut(symbol)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    /// Apply a confirmed fill on this account.
    pub async fn apply_fill(
        &mut self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        price: Decimal,
        exit: &ExitConfig,
    ) -> LedgerChange {
        if quantity <= Decimal::ZERO {
            return LedgerChange::Increased;
        }

        let change = match self.positions.get_mut(symbol) {
            None => {
                let position_side = PositionSide::from_entry(side);
                let position = Position::open(
                    self.account.clone(),
                    symbol.to_string(),
                    position_side,
                    quantity,
                    price,
                    Utc::now(),
                    exit.levels(position_side, price),
                );
                info!(
                    account = %self.account,
                    symbol = %symbol,
                    side = ?position_side,
                    quantity = %quantity,
                    price = %price,
                    "Position opened"
                );
                self.positions.insert(symbol.to_string(), position);
                LedgerChange::Opened
            }
            Some(position) if position.side.entry_side() == side => {
                let levels = averaged_levels(exit, position, quantity, price);
                position.add(quantity, price, levels);
                debug!(account = %self.account, symbol = %symbol, quantity = %position.quantity, "Position increased");
                LedgerChange::Increased
            }
            Some(position) => {
                let held = position.quantity;
                let realized = position.reduce(quantity, price);

                if !position.is_closed() {
                    debug!(account = %self.account, symbol = %symbol, remaining = %position.quantity, "Position reduced");
                    LedgerChange::Reduced { realized }
                } else {
                    let trade = ClosedTrade {
                        symbol: symbol.to_string(),
                        pnl: position.realized_pnl,
                        return_pct: return_on_entry(position),
                        closed_at: Utc::now(),
                    };
                    info!(account = %self.account, symbol = %symbol, pnl = %trade.pnl, "Position closed");

                    let remainder = quantity - held;
                    let flipped = remainder > Decimal::ZERO;
                    if flipped {
                        let position_side = PositionSide::from_entry(side);
                        *position = Position::open(
                            self.account.clone(),
                            symbol.to_string(),
                            position_side,
                            remainder,
                            price,
                            Utc::now(),
                            exit.levels(position_side, price),
                        );
                    } else {
                        self.positions.remove(symbol);
                    }
                    LedgerChange::Closed { trade, flipped }
                }
            }
        };

        // The fill happened whatever the store says; a failed write stays dirty.
        self.persist_logged(symbol).await;
        change
    }

    /// Surface a position whose close exhausted its retries.
    pub async fn mark_exit_failed(&mut self, symbol: &str, reason: String) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };

        error!(
            account = %self.account,
            symbol = %symbol,
            quantity = %position.quantity,
            reason = %reason,
            "Exit failed, position needs operator attention"
        );
        position.state = PositionState::ExitFailed;
        position.exit_failure = Some(reason);
        position.updated_at = Utc::now();

        self.persist_logged(symbol).await;
    }

    /// Align with what the exchange actually holds.
    pub async fn reconcile(
        &mut self,
        held: &[HeldPosition],
        exit: &ExitConfig,
    ) -> Result<ReconcileReport, PersistenceError> {
        let mut report = ReconcileReport::default();

        let mut symbols: Vec<String> = self.symbols();
        symbols.extend(held.iter().map(|h| h.symbol.clone()));
        symbols.sort();
        symbols.dedup();

        for symbol in symbols {
            let live = held.iter().find(|h| h.symbol == symbol);
            match self.sync_symbol(&symbol, live, exit) {
                Some(SyncAction::Dropped) => report.dropped.push(symbol.clone()),
                Some(SyncAction::Adjusted) => report.adjusted.push(symbol.clone()),
                Some(SyncAction::Adopted) => report.adopted.push(symbol.clone()),
                None => continue,
            }
            self.persist(&symbol).await?;
        }

        Ok(report)
    }

    /// Re-sync one symbol after a close whose outcome is unknown.
    pub async fn resync(&mut self, symbol: &str, live: Option<&HeldPosition>, exit: &ExitConfig) {
        if self.sync_symbol(symbol, live, exit).is_some() {
            self.persist_logged(symbol).await;
        }
    }

    fn sync_symbol(
        &mut self,
        symbol: &str,
        live: Option<&HeldPosition>,
        exit: &ExitConfig,
    ) -> Option<SyncAction> {
        let live = live.filter(|h| h.quantity > Decimal::ZERO);
        let existing = self.positions.get(symbol).map(|p| (p.side, p.quantity));

        match (existing, live) {
            (None, None) => None,
            (Some(_), None) => {
                warn!(account = %self.account, symbol = %symbol, "Position no longer held on exchange, dropping");
                self.positions.remove(symbol);
                Some(SyncAction::Dropped)
            }
            (Some((side, quantity)), Some(h)) if side == h.side => {
                if quantity == h.quantity {
                    return None;
                }
                warn!(
                    account = %self.account,
                    symbol = %symbol,
                    ledger = %quantity,
                    exchange = %h.quantity,
                    "Quantity drift, adopting exchange value"
                );
                if let Some(position) = self.positions.get_mut(symbol) {
                    position.quantity = h.quantity;
                    position.entry_quantity = position.entry_quantity.max(h.quantity);
                    position.updated_at = Utc::now();
                }
                Some(SyncAction::Adjusted)
            }
            (_, Some(h)) => {
                warn!(account = %self.account, symbol = %symbol, side = ?h.side, quantity = %h.quantity, "Adopting exchange position");
                let position = Position::open(
                    self.account.clone(),
                    symbol.to_string(),
                    h.side,
                    h.quantity,
                    h.average_price,
                    Utc::now(),
                    exit.levels(h.side, h.average_price),
                );
                self.positions.insert(symbol.to_string(), position);
                Some(SyncAction::Adopted)
            }
        }
    }

    /// Whether any position change has not reached the store yet.
    pub fn has_unsaved(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write every dirty position.
    pub async fn flush(&mut self) -> Result<usize, PersistenceError> {
        let dirty: Vec<String> = self.dirty.iter().cloned().collect();
        let count = dirty.len();
        for symbol in dirty {
            self.persist(&symbol).await?;
        }
        Ok(count)
    }

    async fn persist(&mut self, symbol: &str) -> Result<(), PersistenceError> {
        let result = match self.positions.get(symbol) {
            Some(position) => self.store.save_position(position).await,
            None => self.store.delete_position(&self.account, symbol).await,
        };

        match result {
            Ok(()) => {
                self.dirty.remove(symbol);
                Ok(())
            }
            Err(e) => {
                // Retried on the next flush.
                self.dirty.insert(symbol.to_string());
                Err(e)
            }
        }
    }

    async fn persist_logged(&mut self, symbol: &str) {
        if let Err(e) = self.persist(symbol).await {
            error!(account = %self.account, symbol = %symbol, error = %e, "Failed to persist position, will retry on flush");
        }
    }
}

enum SyncAction {
    Dropped,
    Adjusted,
    Adopted,
}

/// Realized P&L over the entry notional.
fn return_on_entry(position: &Position) -> Decimal {
    let notional = position.entry_price * position.entry_quantity;
    if notional.is_zero() {
        Decimal::ZERO
    } else {
        position.realized_pnl / notional
    }
}

/// Levels for a position after adding `quantity` at `price`.
fn averaged_levels(
    exit: &ExitConfig,
    position: &Position,
    quantity: Decimal,
    price: Decimal,
) -> ProtectiveLevels {
    let total = position.quantity + quantity;
    let average = if total.is_zero() {
        price
    } else {
        (position.quantity * position.entry_price + quantity * price) / total
    };
    exit.levels(position.side, average)
}
