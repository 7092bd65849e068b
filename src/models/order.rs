//! Order requests and fill confirmations exchanged with an account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

/// How an order size is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeType {
    /// Quantity of the base asset
    Base,
    /// Notional amount in the quote currency
    Quote,
}

/// Exchange-reported state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Only these statuses carry a confirmed execution.
    pub fn is_fill(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

/// An order to place on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub size: Decimal,
    pub size_type: SizeType,
}

impl OrderRequest {
    pub fn base(symbol: impl Into<String>, side: TradeSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size: quantity,
            size_type: SizeType::Base,
        }
    }
}

/// Exchange confirmation of an executed (or not executed) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillConfirmation {
    pub order_id: String,
    pub status: OrderStatus,

    /// Executed quantity in base units
    pub filled_quantity: Decimal,

    /// Average execution price
    pub fill_price: Decimal,

    #[serde(default = "Utc::now")]
    pub filled_at: DateTime<Utc>,
}

impl FillConfirmation {
    pub fn notional(&self) -> Decimal {
        self.filled_quantity * self.fill_price
    }
}
