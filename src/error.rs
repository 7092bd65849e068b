//! Typed errors for exchange calls, durable state and the per-account call gate.

use thiserror::Error;

/// Failure reported by an exchange adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    /// Permanent for this symbol on this exchange; never retried.
    #[error("symbol {0} is not supported by this exchange")]
    UnsupportedSymbol(String),

    #[error("stale data: {0}")]
    Stale(String),
}

/// Durable state could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// What kind of exchange call is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Balance and position reads: safe to repeat.
    Read,
    /// Order placement and closes: a network failure has an unknown outcome.
    Order,
}

/// Everything the account call gate can return.
#[derive(Debug, Error)]
pub enum GateError {
    /// The identifier could not be made durable, so the call was not issued.
    #[error("call identifier not persisted: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("account {0} is unavailable pending operator attention")]
    Unavailable(String),

    #[error("shutdown in progress, no new calls are issued")]
    ShuttingDown,

    #[error("no balance has ever been observed for account {0}")]
    NoBalance(String),
}

/// Why a signal was not put on the bus.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("order {order_id} has status {status}, only fills become signals")]
    NotAFill {
        order_id: String,
        status: &'static str,
    },

    #[error("no subscriber is listening")]
    NoSubscribers,
}

/// Failure of a command sent to an account worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("account worker {0} has stopped")]
    Stopped(String),

    #[error("no open position for {0}")]
    NoPosition(String),

    #[error("account {0} has not been reconciled with its exchange yet")]
    NotReconciled(String),

    #[error("close of {symbol} failed ({reason}), position needs operator attention")]
    ExitFailed { symbol: String, reason: String },

    #[error("order for {symbol} refused: {reason}")]
    OrderRefused { symbol: String, reason: String },
}

impl GateError {
    /// Whether a bounded retry may be attempted for this failure.
    pub fn is_retryable(&self, kind: CallKind) -> bool {
        match (self, kind) {
            (GateError::Exchange(ExchangeError::RateLimited(_)), _) => true,
            (GateError::Exchange(ExchangeError::Rejected(_)), CallKind::Order) => true,
            (GateError::Exchange(ExchangeError::Network(_)), CallKind::Read) => true,
            (GateError::Exchange(ExchangeError::Stale(_)), CallKind::Read) => true,
            _ => false,
        }
    }

    /// Whether this failure moves the account towards `UNAVAILABLE`.
    pub fn counts_against_health(&self) -> bool {
        !matches!(
            self,
            GateError::ShuttingDown
                | GateError::NoBalance(_)
                | GateError::Unavailable(_)
                | GateError::Exchange(ExchangeError::UnsupportedSymbol(_))
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, GateError::Exchange(ExchangeError::Auth(_)))
    }

    pub fn is_unsupported_symbol(&self) -> bool {
        matches!(self, GateError::Exchange(ExchangeError::UnsupportedSymbol(_)))
    }
}
