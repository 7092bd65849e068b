//! Risk-adaptive position sizing.
//!
//! Pure and deterministic: the same context always yields the same size.
//!
//! notional = balance * tier fraction * strength * streak mult * volatility mult,
//! then capped at balance * global max fraction.

use rust_decimal::Decimal;

use super::config::TradingConfig;
use crate::metrics::Streak;
use crate::models::{Tier, TierName};

/// Inputs for one sizing decision.
#[derive(Debug, Clone, Copy)]
pub struct SizingContext<'a> {
    pub balance: Decimal,
    pub tier: &'a Tier,
    pub streak: Streak,

    /// Recent per-trade return volatility, if known
    pub volatility: Option<Decimal>,

    /// Price used to convert notional to base quantity
    pub price: Decimal,
}

/// Calculator for risk-bounded position sizes.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    config: TradingConfig,
}

impl RiskSizer {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    /// Tier for an account: explicit override, else by balance.
    pub fn tier(&self, balance: Decimal, override_tier: Option<TierName>) -> &Tier {
        self.config.tiers.resolve(balance, override_tier)
    }

    /// Shrinks after losses (compounding, floored), grows after wins (linear, capped).
    pub fn streak_multiplier(&self, streak: Streak) -> Decimal {
        if streak.losses > 0 {
            let step = Decimal::ONE - self.config.loss_streak_step;
            let mut multiplier = Decimal::ONE;
            for _ in 0..streak.losses {
                multiplier *= step;
                if multiplier <= self.config.min_streak_multiplier {
                    break;
                }
            }
            return multiplier.max(self.config.min_streak_multiplier);
        }

        let boost = Decimal::ONE + self.config.win_streak_step * Decimal::from(streak.wins);
        boost.min(self.config.max_streak_multiplier)
    }

    /// Scales down when recent returns are noisier than the target.
    pub fn volatility_multiplier(&self, volatility: Option<Decimal>) -> Decimal {
        match volatility {
            Some(vol) if vol > self.config.target_volatility => (self.config.target_volatility
                / vol)
                .max(self.config.min_volatility_multiplier),
            _ => Decimal::ONE,
        }
    }

    /// Position size in quote currency.
    pub fn notional(&self, ctx: &SizingContext<'_>, strength: Decimal) -> Decimal {
        if ctx.balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let strength = strength.max(Decimal::ZERO).min(Decimal::ONE);

        let sized = ctx.balance
            * ctx.tier.max_position_fraction
            * strength
            * self.streak_multiplier(ctx.streak)
            * self.volatility_multiplier(ctx.volatility);

        // Hard ceiling, whatever the multipliers say.
        let ceiling = ctx.balance * self.config.max_position_fraction;
        sized.min(ceiling)
    }

    /// Position size in base quantity.
    pub fn size(&self, ctx: &SizingContext<'_>, strength: Decimal) -> Decimal {
        if ctx.price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.notional(ctx, strength) / ctx.price
    }
}
