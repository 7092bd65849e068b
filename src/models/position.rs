//! Open position held by one account, with its protective exit levels.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, TradeSide};

/// Quantities below this are treated as closed.
pub const DUST_QUANTITY: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Direction of exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_entry(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => PositionSide::Long,
            TradeSide::Sell => PositionSide::Short,
        }
    }

    /// Order side that opens or adds to this exposure.
    pub fn entry_side(&self) -> TradeSide {
        match self {
            PositionSide::Long => TradeSide::Buy,
            PositionSide::Short => TradeSide::Sell,
        }
    }

    /// Order side that reduces this exposure.
    pub fn closing_side(&self) -> TradeSide {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Open,
    PartiallyClosed,
    Closed,
    /// A close order exhausted its retries; needs operator attention.
    ExitFailed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "OPEN",
            PositionState::PartiallyClosed => "PARTIALLY_CLOSED",
            PositionState::Closed => "CLOSED",
            PositionState::ExitFailed => "EXIT_FAILED",
        }
    }
}

/// One rung of the profit-target ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitTarget {
    pub price: Decimal,

    /// Fraction of the entry quantity closed at this level
    pub fraction: Decimal,

    pub claimed: bool,
}

/// Trailing stop state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    pub armed: bool,

    /// Best price seen since arming
    pub extreme_price: Option<Decimal>,

    pub trail_price: Option<Decimal>,
}

/// Stop and targets derived from an entry price.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_price: Decimal,
    pub targets: Vec<ProfitTarget>,
}

/// A position owned by exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: AccountId,
    pub symbol: String,
    pub side: PositionSide,

    /// Remaining quantity in base units
    pub quantity: Decimal,

    /// Total quantity ever entered; target fractions apply to this
    pub entry_quantity: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    pub opened_at: DateTime<Utc>,
    pub stop_price: Decimal,
    pub targets: Vec<ProfitTarget>,
    pub trailing: TrailingStop,
    pub state: PositionState,

    /// Why the last close attempt failed, when `state` is `ExitFailed`
    #[serde(default)]
    pub exit_failure: Option<String>,

    #[serde(default)]
    pub realized_pnl: Decimal,

    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a position from a confirmed entry fill.
    pub fn open(
        account_id: AccountId,
        symbol: String,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
        opened_at: DateTime<Utc>,
        levels: ProtectiveLevels,
    ) -> Self {
        Self {
            account_id,
            symbol,
            side,
            quantity,
            entry_quantity: quantity,
            entry_price: price,
            opened_at,
            stop_price: levels.stop_price,
            targets: levels.targets,
            trailing: TrailingStop::default(),
            state: PositionState::Open,
            exit_failure: None,
            realized_pnl: Decimal::ZERO,
            updated_at: opened_at,
        }
    }

    /// Add to the position (averaging in) and move the levels to the new entry.
    pub fn add(&mut self, quantity: Decimal, price: Decimal, levels: ProtectiveLevels) {
        let total_cost = self.quantity * self.entry_price + quantity * price;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.entry_price = total_cost / new_quantity;
        }

        self.quantity = new_quantity;
        self.entry_quantity += quantity;
        self.stop_price = levels.stop_price;

        // Keep claimed rungs claimed; reprice the ladder.
        let claimed: Vec<bool> = self.targets.iter().map(|t| t.claimed).collect();
        self.targets = levels.targets;
        for (target, was_claimed) in self.targets.iter_mut().zip(claimed) {
            target.claimed = was_claimed;
        }

        self.updated_at = Utc::now();
    }

    /// Reduce the position at `price`, returning the realized P&L.
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal) -> Decimal {
        let reduce_by = quantity.min(self.quantity);
        let realized = reduce_by * (price - self.entry_price) * self.side.sign();

        self.quantity -= reduce_by;
        self.realized_pnl += realized;
        self.state = if self.is_closed() {
            PositionState::Closed
        } else {
            PositionState::PartiallyClosed
        };
        self.exit_failure = None;
        self.updated_at = Utc::now();

        realized
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.quantity * (price - self.entry_price) * self.side.sign()
    }

    /// Signed return relative to entry (positive when in profit).
    pub fn return_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * self.side.sign()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Check if this position is closed (quantity is zero or negligible).
    pub fn is_closed(&self) -> bool {
        self.quantity < DUST_QUANTITY
    }

    /// Index of the first unclaimed profit target.
    pub fn next_target(&self) -> Option<usize> {
        self.targets.iter().position(|t| !t.claimed)
    }

    /// True when `price` is at or beyond `level` in the adverse direction.
    pub fn is_adverse_through(&self, price: Decimal, level: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price <= level,
            PositionSide::Short => price >= level,
        }
    }

    /// True when `price` is at or beyond `level` in the favourable direction.
    pub fn is_favourable_through(&self, price: Decimal, level: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price >= level,
            PositionSide::Short => price <= level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(stop: Decimal) -> ProtectiveLevels {
        ProtectiveLevels {
            stop_price: stop,
            targets: vec![ProfitTarget {
                price: dec!(110),
                fraction: dec!(0.5),
                claimed: false,
            }],
        }
    }

    fn long(quantity: Decimal, price: Decimal) -> Position {
        Position::open(
            AccountId::new("acct"),
            "BTC-USD".to_string(),
            PositionSide::Long,
            quantity,
            price,
            Utc::now(),
            levels(dec!(90)),
        )
    }

    #[test]
    fn test_position_averaging() {
        let mut pos = long(dec!(100), dec!(0.50));
        pos.targets[0].claimed = true;

        pos.add(dec!(100), dec!(0.60), levels(dec!(0.5)));

        assert_eq!(pos.quantity, dec!(200));
        assert_eq!(pos.entry_quantity, dec!(200));
        // Average: (50 + 60) / 200 = 0.55
        assert_eq!(pos.entry_price, dec!(0.55));
        assert!(pos.targets[0].claimed);
    }

    #[test]
    fn test_reduce_realizes_pnl_and_transitions_state() {
        let mut pos = long(dec!(10), dec!(100));

        let realized = pos.reduce(dec!(4), dec!(110));
        assert_eq!(realized, dec!(40));
        assert_eq!(pos.state, PositionState::PartiallyClosed);

        let realized = pos.reduce(dec!(100), dec!(95));
        assert_eq!(realized, dec!(-30));
        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.state, PositionState::Closed);
    }

    #[test]
    fn test_short_pnl_sign() {
        let pos = Position::open(
            AccountId::new("acct"),
            "ETH-USD".to_string(),
            PositionSide::Short,
            dec!(2),
            dec!(100),
            Utc::now(),
            levels(dec!(110)),
        );

        assert_eq!(pos.unrealized_pnl(dec!(90)), dec!(20));
        assert_eq!(pos.return_pct(dec!(110)), dec!(-0.1));
        assert!(pos.is_adverse_through(dec!(111), pos.stop_price));
    }
}
