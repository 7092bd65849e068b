//! Audit record of one (signal, follower) replication attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, TradeSide};

/// Why a follower was skipped. Skips are normal outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    BelowMinimum,
    AccountUnavailable,
    MaxPositions,
    UnsupportedSymbol,
    NothingToReduce,
    NoBalance,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BelowMinimum => "BELOW_MINIMUM",
            SkipReason::AccountUnavailable => "ACCOUNT_UNAVAILABLE",
            SkipReason::MaxPositions => "MAX_POSITIONS",
            SkipReason::UnsupportedSymbol => "UNSUPPORTED_SYMBOL",
            SkipReason::NothingToReduce => "NOTHING_TO_REDUCE",
            SkipReason::NoBalance => "NO_BALANCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BELOW_MINIMUM" => Some(SkipReason::BelowMinimum),
            "ACCOUNT_UNAVAILABLE" => Some(SkipReason::AccountUnavailable),
            "MAX_POSITIONS" => Some(SkipReason::MaxPositions),
            "UNSUPPORTED_SYMBOL" => Some(SkipReason::UnsupportedSymbol),
            "NOTHING_TO_REDUCE" => Some(SkipReason::NothingToReduce),
            "NO_BALANCE" => Some(SkipReason::NoBalance),
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of replicating one signal to one follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationResult {
    Filled {
        exchange_order_id: String,
        quantity: Decimal,
        price: Decimal,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
    },
}

impl ReplicationResult {
    pub fn status_str(&self) -> &'static str {
        match self {
            ReplicationResult::Filled { .. } => "FILLED",
            ReplicationResult::Skipped { .. } => "SKIPPED",
            ReplicationResult::Failed { .. } => "FAILED",
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, ReplicationResult::Filled { .. })
    }
}

/// One per (signal, follower) pair; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationOutcome {
    pub id: String,

    /// Master order that produced the signal
    pub order_id: String,
    pub follower_id: AccountId,
    pub symbol: String,
    pub side: TradeSide,

    /// Size computed for the follower, in the signal's size representation
    pub follower_size: Decimal,

    pub result: ReplicationResult,
    pub created_at: DateTime<Utc>,
}

impl ReplicationOutcome {
    pub fn new(
        order_id: &str,
        follower_id: AccountId,
        symbol: &str,
        side: TradeSide,
        follower_size: Decimal,
        result: ReplicationResult,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            follower_id,
            symbol: symbol.to_string(),
            side,
            follower_size,
            result,
            created_at: Utc::now(),
        }
    }
}
