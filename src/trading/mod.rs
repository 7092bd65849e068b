//! Trading core: call gate, ledger, exits, signal bus, replication, sizing.

mod call_gate;
mod config;
mod exit_engine;
mod ledger;
mod replication;
mod risk_sizer;
mod signal_bus;
mod worker;

pub use call_gate::AccountGate;
pub use config::{ExitConfig, GateConfig, ReplicationConfig, TradingConfig, MAX_HOLD_SECS};
pub use replication::{ExchangeLimits, FollowerHandle, FollowerRegistry, ReplicationEngine};
pub use risk_sizer::RiskSizer;
pub use signal_bus::{SignalBus, SignalStream};
pub use worker::{AccountWorker, WorkerHandle, WorkerIntervals};
