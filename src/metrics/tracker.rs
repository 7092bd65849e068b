//! Rolling record of an account's closed trades.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::calculator::{MetricsCalculator, PerformanceMetrics};

/// A position that went flat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub pnl: Decimal,

    /// Realized P&L over the entry notional
    pub return_pct: Decimal,

    pub closed_at: DateTime<Utc>,
}

/// Current run of consecutive wins or losses. At most one side is non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Streak {
    pub wins: u32,
    pub losses: u32,
}

impl Streak {
    pub fn wins(n: u32) -> Self {
        Self { wins: n, losses: 0 }
    }

    pub fn losses(n: u32) -> Self {
        Self { wins: 0, losses: n }
    }
}

/// Tracks streak and return volatility for one account.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    window: usize,
    recent: VecDeque<ClosedTrade>,
    streak: Streak,
    total_pnl: Decimal,
}

impl PerformanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            recent: VecDeque::new(),
            streak: Streak::default(),
            total_pnl: Decimal::ZERO,
        }
    }

    pub fn record(&mut self, trade: ClosedTrade) {
        if trade.pnl > Decimal::ZERO {
            self.streak = Streak::wins(self.streak.wins + 1);
        } else if trade.pnl < Decimal::ZERO {
            self.streak = Streak::losses(self.streak.losses + 1);
        }
        // Break-even trades leave the streak alone.

        self.total_pnl += trade.pnl;
        self.recent.push_back(trade);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    pub fn streak(&self) -> Streak {
        self.streak
    }

    pub fn total_pnl(&self) -> Decimal {
        self.total_pnl
    }

    /// Standard deviation of recent per-trade returns.
    pub fn volatility(&self) -> Option<Decimal> {
        let returns: Vec<Decimal> = self.recent.iter().map(|t| t.return_pct).collect();
        MetricsCalculator::volatility(&returns).and_then(|v| Decimal::try_from(v).ok())
    }

    /// Metrics over the trades still in the window.
    pub fn metrics(&self) -> PerformanceMetrics {
        let pnls: Vec<Decimal> = self.recent.iter().map(|t| t.pnl).collect();
        let returns: Vec<Decimal> = self.recent.iter().map(|t| t.return_pct).collect();
        MetricsCalculator::calculate(&pnls, &returns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(pnl: Decimal) -> ClosedTrade {
        ClosedTrade {
            symbol: "BTC-USD".to_string(),
            pnl,
            return_pct: pnl / dec!(1000),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_streak_resets_on_opposite_result() {
        let mut tracker = PerformanceTracker::new(10);

        tracker.record(trade(dec!(10)));
        tracker.record(trade(dec!(5)));
        assert_eq!(tracker.streak(), Streak::wins(2));

        tracker.record(trade(dec!(-3)));
        assert_eq!(tracker.streak(), Streak::losses(1));

        tracker.record(trade(dec!(0)));
        assert_eq!(tracker.streak(), Streak::losses(1));
        assert_eq!(tracker.total_pnl(), dec!(12));
    }

    #[test]
    fn test_window_bounds_volatility_sample() {
        let mut tracker = PerformanceTracker::new(3);
        assert_eq!(tracker.volatility(), None);

        for pnl in [dec!(500), dec!(20), dec!(-20), dec!(20)] {
            tracker.record(trade(pnl));
        }

        assert_eq!(tracker.metrics().total_trades, 3);
        let vol = tracker.volatility().unwrap();
        assert!(vol > dec!(0.02) && vol < dec!(0.03));
    }
}
