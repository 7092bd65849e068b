//! Data models for accounts, orders, signals, positions and replication outcomes.

mod account;
mod order;
mod outcome;
mod position;
mod signal;
mod tier;

pub use account::{AccountHealth, AccountId, AccountRole, AccountStatus, BalanceReading, CallIdentifier};
pub use order::{FillConfirmation, OrderRequest, OrderStatus, SizeType, TradeSide};
pub use outcome::{ReplicationOutcome, ReplicationResult, SkipReason};
pub use position::{
    Position, PositionSide, PositionState, ProfitTarget, ProtectiveLevels, DUST_QUANTITY,
};
pub use signal::TradeSignal;
pub use tier::{Tier, TierName};
