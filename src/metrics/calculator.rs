//! Calculator for account performance metrics: win rate, drawdown, return volatility.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

/// Summary of an account's closed trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    pub total_pnl: Decimal,

    /// Largest peak-to-trough decline of cumulative realized P&L
    pub max_drawdown: Decimal,

    /// Sample standard deviation of per-trade returns
    pub return_volatility: Option<f64>,
}

/// Calculator for computing account performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate metrics from realized P&L and per-trade returns, oldest first.
    pub fn calculate(pnls: &[Decimal], returns: &[Decimal]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::default();

        if !pnls.is_empty() {
            Self::calculate_pnl_metrics(&mut metrics, pnls);
            Self::calculate_drawdown(&mut metrics, pnls);
        }
        metrics.return_volatility = Self::volatility(returns);

        metrics
    }

    fn calculate_pnl_metrics(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let wins = pnls.iter().filter(|p| **p > Decimal::ZERO).count();
        let losses = pnls.iter().filter(|p| **p < Decimal::ZERO).count();

        metrics.total_trades = pnls.len() as u32;
        metrics.winning_trades = wins as u32;
        metrics.losing_trades = losses as u32;
        metrics.total_pnl = pnls.iter().copied().sum();
        metrics.win_rate = wins as f64 / pnls.len() as f64;
    }

    fn calculate_drawdown(metrics: &mut PerformanceMetrics, pnls: &[Decimal]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for pnl in pnls {
            equity += *pnl;
            peak = peak.max(equity);
            max_dd = max_dd.max(peak - equity);
        }

        metrics.max_drawdown = max_dd;
    }

    /// Standard deviation of returns; needs at least two samples.
    pub fn volatility(returns: &[Decimal]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }

        let values: Vec<f64> = returns.iter().filter_map(|r| r.to_f64()).collect();
        if values.len() < 2 {
            return None;
        }

        let std_dev = values.std_dev();
        std_dev.is_finite().then_some(std_dev)
    }
}
