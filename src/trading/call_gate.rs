//! Per-account call gate.
//!
//! Every authenticated exchange call for one account passes through its gate:
//! - At most one call in flight, with a minimum spacing after the previous one
//! - A strictly increasing call identifier, made durable before the call leaves
//! - Health tracking: consecutive errors degrade, then disable, the account
//! - Fail-static balance reads that never report zero for an unknown balance

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::GateConfig;
use crate::db::StateStore;
use crate::error::{CallKind, ExchangeError, GateError, PersistenceError};
use crate::exchange::{Exchange, HeldPosition};
use crate::models::{
    AccountHealth, AccountId, AccountRole, AccountStatus, BalanceReading, CallIdentifier,
    FillConfirmation, OrderRequest, TradeSide,
};
use crate::shutdown::Shutdown;

/// Serializes and identifies calls for one account.
pub struct AccountGate {
    id: AccountId,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn StateStore>,
    config: GateConfig,
    min_spacing: Duration,
    shutdown: Shutdown,

    /// Last identifier issued; guarded separately so issuance is serialized
    /// even for callers outside the execution slot.
    last_nonce: Mutex<u64>,

    /// Execution slot, holding when the previous call completed.
    slot: Mutex<Option<Instant>>,

    status: RwLock<AccountStatus>,
}

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

impl AccountGate {
    /// Open the gate, resuming above the last persisted identifier.
    pub async fn open(
        id: AccountId,
        role: AccountRole,
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn StateStore>,
        config: GateConfig,
        min_spacing: Duration,
        shutdown: Shutdown,
    ) -> Result<Self, PersistenceError> {
        let last = store.load_nonce(&id).await?.unwrap_or(0);
        debug!(account = %id, last_nonce = last, "Call gate opened");

        Ok(Self {
            status: RwLock::new(AccountStatus::new(id.clone(), role)),
            id,
            exchange,
            store,
            config,
            min_spacing,
            shutdown,
            last_nonce: Mutex::new(last),
            slot: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub async fn status(&self) -> AccountStatus {
        self.status.read().await.clone()
    }

    pub async fn health(&self) -> AccountHealth {
        self.status.read().await.health
    }

    /// Last successfully observed balance, without any I/O.
    pub async fn cached_balance(&self) -> Option<Decimal> {
        self.status.read().await.last_good_balance
    }

    /// Issue the next identifier: `max(last + 1, now)`, persisted before return.
    pub async fn next_identifier(&self) -> Result<CallIdentifier, GateError> {
        if self.shutdown.is_triggered() {
            return Err(GateError::ShuttingDown);
        }

        let mut last = self.last_nonce.lock().await;
        let candidate = (*last + 1).max(now_micros());

        // Never hand out this value again, even if the write below fails.
        *last = candidate;

        if let Err(e) = self.store.save_nonce(&self.id, candidate).await {
            error!(account = %self.id, nonce = candidate, error = %e, "Failed to persist call identifier");
            return Err(e.into());
        }

        Ok(CallIdentifier(candidate))
    }

    /// Run one exchange call inside the account's execution slot.
    pub async fn execute<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, GateError>
    where
        F: FnOnce(Arc<dyn Exchange>, CallIdentifier) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        if self.status.read().await.auth_locked {
            return Err(GateError::Unavailable(self.id.to_string()));
        }

        let mut slot = self.slot.lock().await;

        if let Some(completed) = *slot {
            let elapsed = completed.elapsed();
            if elapsed < self.min_spacing {
                tokio::time::sleep(self.min_spacing - elapsed).await;
            }
        }

        let result = match self.next_identifier().await {
            Ok(nonce) => {
                debug!(account = %self.id, op, nonce = %nonce, "Exchange call");
                let result = call(self.exchange.clone(), nonce).await.map_err(GateError::from);
                *slot = Some(Instant::now());
                result
            }
            Err(e) => Err(e),
        };
        drop(slot);

        self.record(op, &result).await;
        result
    }

    /// `execute` with bounded exponential backoff. Every attempt re-enters the
    /// gate, so it gets a fresh identifier and honours the spacing.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        kind: CallKind,
        call: F,
    ) -> Result<T, GateError>
    where
        F: FnMut(Arc<dyn Exchange>, CallIdentifier) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.execute_with_attempts(op, kind, self.config.retry_attempts, call)
            .await
    }

    async fn execute_with_attempts<T, F, Fut>(
        &self,
        op: &'static str,
        kind: CallKind,
        attempts: u32,
        mut call: F,
    ) -> Result<T, GateError>
    where
        F: FnMut(Arc<dyn Exchange>, CallIdentifier) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.execute(op, &mut call).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && e.is_retryable(kind) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.max_backoff());
                    warn!(
                        account = %self.id,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying exchange call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record<T>(&self, op: &'static str, result: &Result<T, GateError>) {
        let mut status = self.status.write().await;

        match result {
            Ok(_) => {
                if status.health != AccountHealth::Available {
                    info!(account = %self.id, op, "Account recovered");
                }
                status.consecutive_errors = 0;
                status.health = AccountHealth::Available;
            }
            Err(e) if !e.counts_against_health() => {}
            Err(e) => {
                status.consecutive_errors += 1;

                if e.is_auth() {
                    status.auth_locked = true;
                    status.health = AccountHealth::Unavailable;
                    error!(account = %self.id, op, error = %e, "Authentication failed, account disabled until reset");
                } else if status.consecutive_errors >= self.config.max_consecutive_errors {
                    if status.health != AccountHealth::Unavailable {
                        warn!(
                            account = %self.id,
                            errors = status.consecutive_errors,
                            cached_balance = ?status.last_good_balance,
                            "Account unavailable, balance frozen"
                        );
                    }
                    status.health = AccountHealth::Unavailable;
                } else {
                    status.health = AccountHealth::Degraded;
                    warn!(account = %self.id, op, errors = status.consecutive_errors, error = %e, "Exchange call failed");
                }
            }
        }
    }

    /// Operator reset after credentials were fixed.
    pub async fn reset_health(&self) {
        let mut status = self.status.write().await;
        status.auth_locked = false;
        status.consecutive_errors = 0;
        status.health = AccountHealth::Available;
        info!(account = %self.id, "Account health reset");
    }

    // ==================== Calls ====================

    /// Live balance, or the last good one flagged stale.
    pub async fn balance(&self) -> Result<BalanceReading, GateError> {
        let result = self
            .execute_with_retry("get_balance", CallKind::Read, |ex, nonce| async move {
                ex.get_balance(nonce).await
            })
            .await;

        let mut status = self.status.write().await;

        match result {
            Ok(amount) => {
                status.balance = Some(amount);
                status.last_good_balance = Some(amount);
                status.balance_observed_at = Some(Utc::now());
                Ok(BalanceReading {
                    amount,
                    stale: false,
                })
            }
            Err(e) => {
                status.balance = None;
                match status.last_good_balance {
                    Some(amount) => {
                        debug!(account = %self.id, error = %e, cached = %amount, "Using cached balance");
                        Ok(BalanceReading { amount, stale: true })
                    }
                    None => {
                        warn!(account = %self.id, error = %e, "No balance has been observed");
                        Err(GateError::NoBalance(self.id.to_string()))
                    }
                }
            }
        }
    }

    pub async fn submit_order(&self, order: &OrderRequest) -> Result<FillConfirmation, GateError> {
        self.execute_with_retry("submit_order", CallKind::Order, |ex, nonce| {
            let order = order.clone();
            async move { ex.submit_order(nonce, &order).await }
        })
        .await
    }

    /// Close `quantity` of a position with an order on `side`, trying at
    /// most `attempts` times.
    pub async fn close_position(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
        attempts: u32,
    ) -> Result<FillConfirmation, GateError> {
        self.execute_with_attempts("close_position", CallKind::Order, attempts, |ex, nonce| {
            let symbol = symbol.to_string();
            async move { ex.close_position(nonce, &symbol, side, quantity).await }
        })
        .await
    }

    pub async fn open_positions(&self) -> Result<Vec<HeldPosition>, GateError> {
        self.execute_with_retry("open_positions", CallKind::Read, |ex, nonce| async move {
            ex.open_positions(nonce).await
        })
        .await
    }
}
