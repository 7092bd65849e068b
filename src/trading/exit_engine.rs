//! Position exit engine.
//!
//! Rules run in a fixed priority every cycle, first match wins:
//! 1. Hard stop-loss (always computed first, whatever the position's age)
//! 2. Profit-target ladder, one rung per cycle
//! 3. Trailing stop, once armed
//! 4. Maximum-hold timeout, shorter while the position is at a loss
//!
//! An emergency override sits between 1 and 2 so a simultaneous stop is still
//! recorded as a stop.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::config::ExitConfig;
use crate::models::{Position, DUST_QUANTITY};

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    /// 1-based rung of the profit-target ladder
    ProfitTarget(usize),
    TrailingStop,
    TimeExit,
    Emergency,
}

impl ExitReason {
    /// Full exits close everything that remains.
    pub fn is_full_exit(&self) -> bool {
        !matches!(self, ExitReason::ProfitTarget(_))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::ProfitTarget(n) => write!(f, "PROFIT_TARGET_{}", n),
            ExitReason::TrailingStop => write!(f, "TRAILING_STOP"),
            ExitReason::TimeExit => write!(f, "TIME_EXIT"),
            ExitReason::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// Operator-requested behaviour routed through the same rule chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOverride {
    /// Close everything now.
    Emergency,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    Close { reason: ExitReason, quantity: Decimal },
}

impl ExitDecision {
    pub fn reason(&self) -> Option<ExitReason> {
        match self {
            ExitDecision::Hold => None,
            ExitDecision::Close { reason, .. } => Some(*reason),
        }
    }
}

/// Stateless rule engine; the trailing stop state lives on the position.
#[derive(Debug, Clone)]
pub struct ExitEngine {
    config: ExitConfig,
}

impl ExitEngine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Decide whether to close part or all of `position` at `price`.
    ///
    /// Arms and ratchets the trailing stop as a side effect. Target rungs are
    /// only claimed once the close actually fills (see [`ExitEngine::claim`]).
    pub fn evaluate(
        &self,
        position: &mut Position,
        price: Decimal,
        now: DateTime<Utc>,
        override_exit: Option<ExitOverride>,
    ) -> ExitDecision {
        if position.is_closed() {
            return ExitDecision::Hold;
        }

        let remaining = position.quantity;

        // 1. Hard stop-loss: unconditional, before any timer is looked at.
        let stop_hit = position.is_adverse_through(price, position.stop_price);
        if stop_hit {
            warn!(
                account = %position.account_id,
                symbol = %position.symbol,
                price = %price,
                stop = %position.stop_price,
                "Stop loss triggered"
            );
            return Self::close(ExitReason::StopLoss, remaining);
        }

        if let Some(ExitOverride::Emergency) = override_exit {
            warn!(account = %position.account_id, symbol = %position.symbol, "Emergency close requested");
            return Self::close(ExitReason::Emergency, remaining);
        }

        self.update_trailing(position, price);

        // 2. Next unclaimed profit target.
        if let Some(index) = position.next_target() {
            let target = &position.targets[index];
            if position.is_favourable_through(price, target.price) {
                let mut quantity = (target.fraction * position.entry_quantity).min(remaining);
                if remaining - quantity < DUST_QUANTITY {
                    quantity = remaining;
                }

                info!(
                    account = %position.account_id,
                    symbol = %position.symbol,
                    rung = index + 1,
                    price = %price,
                    quantity = %quantity,
                    "Profit target reached"
                );
                return Self::close(ExitReason::ProfitTarget(index + 1), quantity);
            }
        }

        // 3. Trailing stop.
        if let (true, Some(trail)) = (position.trailing.armed, position.trailing.trail_price) {
            if position.is_adverse_through(price, trail) {
                info!(
                    account = %position.account_id,
                    symbol = %position.symbol,
                    price = %price,
                    trail = %trail,
                    "Trailing stop triggered"
                );
                return Self::close(ExitReason::TrailingStop, remaining);
            }
        }

        // 4. Maximum hold. Only reached when none of the above fired.
        let age = position.age(now);
        let at_loss = position.unrealized_pnl(price) < Decimal::ZERO;

        if age > self.config.max_hold() || (at_loss && age > self.config.loss_max_hold()) {
            info!(
                account = %position.account_id,
                symbol = %position.symbol,
                hours = age.num_hours(),
                at_loss,
                "Max holding period reached"
            );
            return Self::close(ExitReason::TimeExit, remaining);
        }

        ExitDecision::Hold
    }

    fn close(reason: ExitReason, quantity: Decimal) -> ExitDecision {
        ExitDecision::Close { reason, quantity }
    }

    /// Arm once the gain passes the activation threshold, then ratchet the
    /// trail behind the best price seen. The trail never loosens.
    fn update_trailing(&self, position: &mut Position, price: Decimal) {
        let sign = position.side.sign();

        if !position.trailing.armed {
            if position.return_pct(price) < self.config.trailing_activation_pct {
                return;
            }
            position.trailing.armed = true;
            debug!(account = %position.account_id, symbol = %position.symbol, price = %price, "Trailing stop armed");
        }

        let extreme = match position.trailing.extreme_price {
            Some(best) if (price - best) * sign <= Decimal::ZERO => best,
            _ => price,
        };
        position.trailing.extreme_price = Some(extreme);
        position.trailing.trail_price =
            Some(extreme * (Decimal::ONE - sign * self.config.trailing_distance_pct));
    }

    /// Take `filled` units off the profit-target rung behind `reason`. The
    /// rung is claimed once its whole fraction has filled; a partial fill
    /// leaves the rest of it for the next cycle.
    pub fn claim(position: &mut Position, reason: ExitReason, filled: Decimal) {
        let ExitReason::ProfitTarget(n) = reason else {
            return;
        };
        let entry_quantity = position.entry_quantity;
        let Some(target) = n.checked_sub(1).and_then(|i| position.targets.get_mut(i)) else {
            return;
        };

        let owed = target.fraction * entry_quantity;
        if entry_quantity <= Decimal::ZERO || owed - filled < DUST_QUANTITY {
            target.claimed = true;
        } else {
            target.fraction -= filled / entry_quantity;
            debug!(rung = n, remaining = %target.fraction, "Profit target partly filled");
        }
    }
}
