//! Exchange adapter seam.
//!
//! One adapter instance is bound to one account. Every private call carries the
//! call identifier issued by that account's gate; the adapter never invents one.

mod paper;
mod rest;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::models::{CallIdentifier, FillConfirmation, OrderRequest, PositionSide, TradeSide};

pub use paper::{PaperExchange, PaperMarket};
pub use rest::{ApiCredentials, HttpExchange};

/// A position as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub average_price: Decimal,
}

/// Authenticated calls against one exchange account.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange name, used to look up per-exchange limits.
    fn name(&self) -> &str;

    async fn get_balance(&self, nonce: CallIdentifier) -> Result<Decimal, ExchangeError>;

    async fn submit_order(
        &self,
        nonce: CallIdentifier,
        order: &OrderRequest,
    ) -> Result<FillConfirmation, ExchangeError>;

    /// Reduce a held position by `quantity` with an order on `side`.
    async fn close_position(
        &self,
        nonce: CallIdentifier,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<FillConfirmation, ExchangeError>;

    async fn open_positions(&self, nonce: CallIdentifier)
        -> Result<Vec<HeldPosition>, ExchangeError>;
}

/// Last traded prices for the exit engine. Public data, no call identifier.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}
