//! Named risk profiles bounding position size and concurrency.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    Conservative,
    Standard,
    Aggressive,
}

impl TierName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Conservative => "conservative",
            TierName::Standard => "standard",
            TierName::Aggressive => "aggressive",
        }
    }
}

/// Read-only risk profile resolved per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: TierName,

    /// Maximum fraction of balance committed to a single position
    pub max_position_fraction: Decimal,

    pub max_concurrent_positions: usize,

    /// Smallest order notional this tier will place
    pub min_order_notional: Decimal,
}
