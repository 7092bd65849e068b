//! Performance statistics feeding the risk sizer and status reports.

mod calculator;
mod tracker;

pub use calculator::PerformanceMetrics;
pub use tracker::{ClosedTrade, PerformanceTracker, Streak};
