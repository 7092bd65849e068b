//! Immutable record of a confirmed master fill.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, FillConfirmation, OrderRequest, OrderStatus, SizeType, TradeSide};

/// Appended to the order id of the opening leg of a flip.
pub const OPENING_LEG_SUFFIX: &str = ":open";

/// A master fill to be replicated to followers.
///
/// Built once per confirmed master fill and never mutated. The bus refuses to
/// deliver a signal whose `status` is not a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub order_id: String,
    pub master_account: AccountId,
    pub symbol: String,
    pub side: TradeSide,

    /// Executed base quantity on the master
    pub filled_quantity: Decimal,
    pub fill_price: Decimal,

    /// How the master expressed its order; followers use the same form
    pub size_type: SizeType,

    /// Master balance observed when the fill was confirmed
    pub master_balance: Decimal,

    pub status: OrderStatus,
    pub filled_at: DateTime<Utc>,

    /// The fill reduced (or closed) an existing master position
    #[serde(default)]
    pub reduces_position: bool,
}

impl TradeSignal {
    pub fn from_fill(
        master_account: AccountId,
        request: &OrderRequest,
        fill: &FillConfirmation,
        master_balance: Decimal,
        reduces_position: bool,
    ) -> Self {
        Self {
            order_id: fill.order_id.clone(),
            master_account,
            symbol: request.symbol.clone(),
            side: request.side,
            filled_quantity: fill.filled_quantity,
            fill_price: fill.fill_price,
            size_type: request.size_type,
            master_balance,
            status: fill.status,
            filled_at: fill.filled_at,
            reduces_position,
        }
    }

    /// Split a fill that closed `closed` units and opened the opposite side
    /// with the rest into a reducing leg and an opening leg. The opening leg
    /// carries its own order id so both legs replicate once each.
    pub fn split_flip(self, closed: Decimal) -> Vec<TradeSignal> {
        let remainder = self.filled_quantity - closed;
        if closed <= Decimal::ZERO || remainder <= Decimal::ZERO {
            return vec![self];
        }

        let opening = TradeSignal {
            order_id: format!("{}{}", self.order_id, OPENING_LEG_SUFFIX),
            filled_quantity: remainder,
            reduces_position: false,
            ..self.clone()
        };
        let reducing = TradeSignal {
            filled_quantity: closed,
            reduces_position: true,
            ..self
        };
        vec![reducing, opening]
    }

    pub fn notional(&self) -> Decimal {
        self.filled_quantity * self.fill_price
    }

    pub fn is_replicable(&self) -> bool {
        self.status.is_fill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sell(quantity: Decimal) -> TradeSignal {
        TradeSignal {
            order_id: "m-7".to_string(),
            master_account: AccountId::new("master"),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Sell,
            filled_quantity: quantity,
            fill_price: dec!(100),
            size_type: SizeType::Base,
            master_balance: dec!(10000),
            status: OrderStatus::Filled,
            filled_at: Utc::now(),
            reduces_position: true,
        }
    }

    #[test]
    fn test_flip_splits_into_close_and_entry() {
        let legs = sell(dec!(3)).split_flip(dec!(1));

        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].order_id, "m-7");
        assert_eq!(legs[0].filled_quantity, dec!(1));
        assert!(legs[0].reduces_position);

        assert_eq!(legs[1].order_id, "m-7:open");
        assert_eq!(legs[1].filled_quantity, dec!(2));
        assert!(!legs[1].reduces_position);
        assert_eq!(legs[1].side, TradeSide::Sell);
    }

    #[test]
    fn test_exact_close_is_not_split() {
        let signal = sell(dec!(3));
        assert_eq!(signal.clone().split_flip(dec!(3)), vec![signal]);
    }
}
