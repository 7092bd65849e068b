//! Trading, exit, gate and replication configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::{PositionSide, ProfitTarget, ProtectiveLevels, Tier, TierName};

/// The three named risk profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub conservative: Tier,
    pub standard: Tier,
    pub aggressive: Tier,

    /// Balance at or above which an account is `standard`
    pub standard_min_balance: Decimal,

    /// Balance at or above which an account is `aggressive`
    pub aggressive_min_balance: Decimal,
}

impl TierTable {
    pub fn get(&self, name: TierName) -> &Tier {
        match name {
            TierName::Conservative => &self.conservative,
            TierName::Standard => &self.standard,
            TierName::Aggressive => &self.aggressive,
        }
    }

    /// Resolve from balance unless an explicit override is configured.
    pub fn resolve(&self, balance: Decimal, override_tier: Option<TierName>) -> &Tier {
        if let Some(name) = override_tier {
            return self.get(name);
        }

        if balance >= self.aggressive_min_balance {
            &self.aggressive
        } else if balance >= self.standard_min_balance {
            &self.standard
        } else {
            &self.conservative
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            conservative: Tier {
                name: TierName::Conservative,
                max_position_fraction: dec!(0.02), // 2% per position
                max_concurrent_positions: 3,
                min_order_notional: dec!(10),
            },
            standard: Tier {
                name: TierName::Standard,
                max_position_fraction: dec!(0.05), // 5% per position
                max_concurrent_positions: 5,
                min_order_notional: dec!(10),
            },
            aggressive: Tier {
                name: TierName::Aggressive,
                max_position_fraction: dec!(0.10), // 10% per position
                max_concurrent_positions: 10,
                min_order_notional: dec!(25),
            },
            standard_min_balance: dec!(5000),
            aggressive_min_balance: dec!(50000),
        }
    }
}

/// Configuration for tiering and position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub tiers: TierTable,

    /// Hard ceiling on any single position as a fraction of balance
    pub max_position_fraction: Decimal,

    /// Size multiplier lost per consecutive loss (compounding)
    pub loss_streak_step: Decimal,

    /// Floor for the loss-streak multiplier
    pub min_streak_multiplier: Decimal,

    /// Size multiplier gained per consecutive win (linear)
    pub win_streak_step: Decimal,

    /// Cap for the win-streak multiplier
    pub max_streak_multiplier: Decimal,

    /// Per-trade return volatility considered normal
    pub target_volatility: Decimal,

    /// Floor for the volatility multiplier
    pub min_volatility_multiplier: Decimal,

    /// Closed trades kept for the volatility estimate
    pub volatility_window: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            max_position_fraction: dec!(0.10),     // Never more than 10% in one position
            loss_streak_step: dec!(0.25),          // -25% per loss
            min_streak_multiplier: dec!(0.25),
            win_streak_step: dec!(0.10),           // +10% per win
            max_streak_multiplier: dec!(1.5),
            target_volatility: dec!(0.05),         // 5% per-trade return std dev
            min_volatility_multiplier: dec!(0.5),
            volatility_window: 20,
        }
    }
}

/// One rung of the profit-target ladder, relative to entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetLevel {
    /// Favourable move from entry that triggers this rung
    pub gain_pct: Decimal,

    /// Fraction of the entry quantity closed at this rung
    pub fraction: Decimal,
}

/// Protective exit rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Adverse move from entry that triggers the hard stop
    pub stop_loss_pct: Decimal,

    pub profit_targets: Vec<TargetLevel>,

    /// Unrealized gain that arms the trailing stop
    pub trailing_activation_pct: Decimal,

    /// Distance of the trail behind the best price seen
    pub trailing_distance_pct: Decimal,

    /// Maximum hold for any position (seconds)
    pub max_hold_secs: u64,

    /// Shorter maximum hold for positions currently at a loss (seconds)
    pub loss_max_hold_secs: u64,

    /// Attempts per close before the position is marked exit-failed
    pub close_retries: u32,
}

impl ExitConfig {
    pub fn max_hold(&self) -> chrono::Duration {
        hold_duration(self.max_hold_secs)
    }

    pub fn loss_max_hold(&self) -> chrono::Duration {
        hold_duration(self.loss_max_hold_secs)
    }

    /// Stop and target prices for a position entered at `entry_price`.
    pub fn levels(&self, side: PositionSide, entry_price: Decimal) -> ProtectiveLevels {
        let sign = side.sign();

        let targets = self
            .profit_targets
            .iter()
            .map(|level| ProfitTarget {
                price: entry_price * (Decimal::ONE + sign * level.gain_pct),
                fraction: level.fraction,
                claimed: false,
            })
            .collect();

        ProtectiveLevels {
            stop_price: entry_price * (Decimal::ONE - sign * self.stop_loss_pct),
            targets,
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(0.05), // 5% hard stop
            profit_targets: vec![
                TargetLevel {
                    gain_pct: dec!(0.04),
                    fraction: dec!(0.25),
                },
                TargetLevel {
                    gain_pct: dec!(0.08),
                    fraction: dec!(0.25),
                },
                TargetLevel {
                    gain_pct: dec!(0.15),
                    fraction: dec!(0.25),
                },
            ],
            trailing_activation_pct: dec!(0.06),
            trailing_distance_pct: dec!(0.03),
            max_hold_secs: 72 * 3600,     // 3 days
            loss_max_hold_secs: 24 * 3600, // 1 day while losing
            close_retries: 3,
        }
    }
}

/// Longest hold a configuration may ask for (100 years).
pub const MAX_HOLD_SECS: u64 = 100 * 365 * 24 * 3600;

/// Saturates instead of overflowing the time range.
fn hold_duration(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Per-account call gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Consecutive errors that make an account unavailable
    pub max_consecutive_errors: u32,

    /// Attempts per call, including the first
    pub retry_attempts: u32,

    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Spacing between calls when an account does not set its own
    pub default_min_spacing_ms: u64,
}

impl GateConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            retry_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            default_min_spacing_ms: 200,
        }
    }
}

/// Signal fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Followers submitted concurrently per signal
    pub max_concurrency: usize,

    /// Signals buffered on the bus before the oldest is dropped
    pub bus_capacity: usize,

    /// Signal strength passed to the sizer when computing a follower's ceiling
    pub signal_strength: Decimal,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            bus_capacity: 1024,
            signal_strength: Decimal::ONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_resolution_by_balance_and_override() {
        let tiers = TierTable::default();

        assert_eq!(tiers.resolve(dec!(1000), None).name, TierName::Conservative);
        assert_eq!(tiers.resolve(dec!(5000), None).name, TierName::Standard);
        assert_eq!(tiers.resolve(dec!(75000), None).name, TierName::Aggressive);
        assert_eq!(
            tiers.resolve(dec!(75000), Some(TierName::Conservative)).name,
            TierName::Conservative
        );
    }

    #[test]
    fn test_levels_mirror_for_shorts() {
        let exit = ExitConfig::default();

        let long = exit.levels(PositionSide::Long, dec!(100));
        assert_eq!(long.stop_price, dec!(95));
        assert_eq!(long.targets[0].price, dec!(104));

        let short = exit.levels(PositionSide::Short, dec!(100));
        assert_eq!(short.stop_price, dec!(105));
        assert_eq!(short.targets[0].price, dec!(96));
    }

    #[test]
    fn test_out_of_range_hold_saturates() {
        let exit = ExitConfig {
            max_hold_secs: u64::MAX,
            loss_max_hold_secs: i64::MAX as u64,
            ..ExitConfig::default()
        };

        assert_eq!(exit.max_hold(), chrono::Duration::MAX);
        assert_eq!(exit.loss_max_hold(), chrono::Duration::MAX);
        assert_eq!(ExitConfig::default().max_hold(), chrono::Duration::hours(72));
    }
}
