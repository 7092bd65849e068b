//! Account identity, role, health and the per-account call identifier.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Identifier of one exchange account as named in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an account originates signals or replicates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Master,
    Follower,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Master => "MASTER",
            AccountRole::Follower => "FOLLOWER",
        }
    }
}

/// Health as driven by the account call gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountHealth {
    Available,
    Degraded,
    Unavailable,
}

impl fmt::Display for AccountHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountHealth::Available => write!(f, "available"),
            AccountHealth::Degraded => write!(f, "degraded, using cached balance"),
            AccountHealth::Unavailable => write!(f, "unavailable, using cached balance"),
        }
    }
}

/// Strictly increasing per-account value attached to every authenticated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallIdentifier(pub u64);

impl CallIdentifier {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time view of an account's health and balance.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub id: AccountId,
    pub role: AccountRole,
    pub health: AccountHealth,
    pub consecutive_errors: u32,

    /// Set by an authentication failure; cleared only by an operator reset.
    pub auth_locked: bool,

    /// Most recent live balance read, if the last read succeeded
    pub balance: Option<Decimal>,

    /// Last balance that was read successfully; frozen while unavailable
    pub last_good_balance: Option<Decimal>,

    pub balance_observed_at: Option<DateTime<Utc>>,
}

impl AccountStatus {
    pub fn new(id: AccountId, role: AccountRole) -> Self {
        Self {
            id,
            role,
            health: AccountHealth::Available,
            consecutive_errors: 0,
            auth_locked: false,
            balance: None,
            last_good_balance: None,
            balance_observed_at: None,
        }
    }
}

/// A balance read, flagged stale when it came from the fail-static cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceReading {
    pub amount: Decimal,
    pub stale: bool,
}
