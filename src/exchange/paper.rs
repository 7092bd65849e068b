//! Simulated exchange for dry runs and tests.
//!
//! Fills every order immediately at the shared market price, enforces strictly
//! increasing call identifiers the way a real venue does, and supports scripted
//! failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;

use super::{Exchange, HeldPosition, PriceFeed};
use crate::error::ExchangeError;
use crate::models::{
    CallIdentifier, FillConfirmation, OrderRequest, OrderStatus, PositionSide, SizeType, TradeSide,
    DUST_QUANTITY,
};

/// Price book shared by every paper account.
#[derive(Debug, Default)]
pub struct PaperMarket {
    prices: RwLock<HashMap<String, Decimal>>,
}

impl PaperMarket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol.to_string(), price);
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }
}

#[async_trait]
impl PriceFeed for PaperMarket {
    async fn last_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.price(symbol)
            .ok_or_else(|| ExchangeError::Stale(format!("no price for {}", symbol)))
    }
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    holdings: HashMap<String, HeldPosition>,
    unsupported: HashSet<String>,
    scripted: VecDeque<ExchangeError>,
    fill_status: OrderStatus,
    fill_ratio: Decimal,
    last_nonce: Option<u64>,
    nonces: Vec<u64>,
    orders: Vec<OrderRequest>,
}

/// One simulated account.
pub struct PaperExchange {
    name: String,
    market: Arc<PaperMarket>,
    state: Mutex<PaperState>,
    call_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, balance: Decimal, market: Arc<PaperMarket>) -> Self {
        Self {
            name: name.into(),
            market,
            state: Mutex::new(PaperState {
                balance,
                holdings: HashMap::new(),
                unsupported: HashSet::new(),
                scripted: VecDeque::new(),
                fill_status: OrderStatus::Filled,
                fill_ratio: Decimal::ONE,
                last_nonce: None,
                nonces: Vec::new(),
                orders: Vec::new(),
            }),
            call_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulated latency of every call.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    pub fn market(&self) -> &Arc<PaperMarket> {
        &self.market
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state().balance = balance;
    }

    /// Queue a failure returned by the next call (after identifier checks).
    pub fn fail_next(&self, error: ExchangeError) {
        self.state().scripted.push_back(error);
    }

    pub fn fail_next_n(&self, error: ExchangeError, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state.scripted.push_back(error.clone());
        }
    }

    pub fn mark_unsupported(&self, symbol: &str) {
        self.state().unsupported.insert(symbol.to_string());
    }

    /// Status reported for subsequent orders (non-fill statuses execute nothing).
    pub fn set_fill_status(&self, status: OrderStatus) {
        self.state().fill_status = status;
    }

    /// Execute only this fraction of each later order, reported as a partial fill.
    pub fn set_fill_ratio(&self, ratio: Decimal) {
        self.state().fill_ratio = ratio;
    }

    /// Seed an existing holding, as if opened before the process started.
    pub fn hold(&self, symbol: &str, side: PositionSide, quantity: Decimal, price: Decimal) {
        self.state().holdings.insert(
            symbol.to_string(),
            HeldPosition {
                symbol: symbol.to_string(),
                side,
                quantity,
                average_price: price,
            },
        );
    }

    pub fn holding(&self, symbol: &str) -> Option<HeldPosition> {
        self.state().holdings.get(symbol).cloned()
    }

    /// Every identifier this account has received, in arrival order.
    pub fn nonces(&self) -> Vec<u64> {
        self.state().nonces.clone()
    }

    /// Every order that executed.
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state().orders.clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, nonce: CallIdentifier) -> Result<InFlight<'_>, ExchangeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }

        let mut state = self.state();
        state.nonces.push(nonce.value());

        if let Some(last) = state.last_nonce {
            if nonce.value() <= last {
                return Err(ExchangeError::Auth(format!(
                    "invalid nonce {} (last accepted {})",
                    nonce, last
                )));
            }
        }
        state.last_nonce = Some(nonce.value());

        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }

        Ok(guard)
    }

    fn execute(
        &self,
        symbol: &str,
        side: TradeSide,
        size: Decimal,
        size_type: SizeType,
    ) -> Result<FillConfirmation, ExchangeError> {
        let mut state = self.state();

        if state.unsupported.contains(symbol) {
            return Err(ExchangeError::UnsupportedSymbol(symbol.to_string()));
        }

        let price = self
            .market
            .price(symbol)
            .ok_or_else(|| ExchangeError::Rejected(format!("no market for {}", symbol)))?;

        if size <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!("invalid size {}", size)));
        }

        let quantity = match size_type {
            SizeType::Base => size,
            SizeType::Quote => (size / price).round_dp(8),
        };

        let (status, filled_quantity) = match state.fill_status {
            status if !status.is_fill() => (status, Decimal::ZERO),
            _ if state.fill_ratio < Decimal::ONE => (
                OrderStatus::PartiallyFilled,
                (quantity * state.fill_ratio).round_dp(8),
            ),
            status => (status, quantity),
        };

        if filled_quantity > Decimal::ZERO {
            let realized = apply_fill(&mut state.holdings, symbol, side, filled_quantity, price);
            state.balance += realized;
            state.orders.push(OrderRequest {
                symbol: symbol.to_string(),
                side,
                size,
                size_type,
            });
        }

        debug!(
            account = %self.name,
            symbol = %symbol,
            side = side.as_str(),
            quantity = %filled_quantity,
            price = %price,
            "Paper order executed"
        );

        Ok(FillConfirmation {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            status,
            filled_quantity,
            fill_price: price,
            filled_at: Utc::now(),
        })
    }
}

/// Net a fill into the holdings map, returning realized P&L.
fn apply_fill(
    holdings: &mut HashMap<String, HeldPosition>,
    symbol: &str,
    side: TradeSide,
    quantity: Decimal,
    price: Decimal,
) -> Decimal {
    let Some(held) = holdings.get_mut(symbol) else {
        holdings.insert(
            symbol.to_string(),
            HeldPosition {
                symbol: symbol.to_string(),
                side: PositionSide::from_entry(side),
                quantity,
                average_price: price,
            },
        );
        return Decimal::ZERO;
    };

    if held.side.entry_side() == side {
        let cost = held.quantity * held.average_price + quantity * price;
        held.quantity += quantity;
        held.average_price = cost / held.quantity;
        return Decimal::ZERO;
    }

    let reduced = quantity.min(held.quantity);
    let realized = reduced * (price - held.average_price) * held.side.sign();
    held.quantity -= reduced;

    let remainder = quantity - reduced;
    if remainder > Decimal::ZERO {
        // Flipped through flat.
        held.side = PositionSide::from_entry(side);
        held.quantity = remainder;
        held.average_price = price;
    } else if held.quantity < DUST_QUANTITY {
        holdings.remove(symbol);
    }

    realized
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_balance(&self, nonce: CallIdentifier) -> Result<Decimal, ExchangeError> {
        let _guard = self.enter(nonce).await?;
        Ok(self.state().balance)
    }

    async fn submit_order(
        &self,
        nonce: CallIdentifier,
        order: &OrderRequest,
    ) -> Result<FillConfirmation, ExchangeError> {
        let _guard = self.enter(nonce).await?;
        self.execute(&order.symbol, order.side, order.size, order.size_type)
    }

    async fn close_position(
        &self,
        nonce: CallIdentifier,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<FillConfirmation, ExchangeError> {
        let _guard = self.enter(nonce).await?;
        self.execute(symbol, side, quantity, SizeType::Base)
    }

    async fn open_positions(
        &self,
        nonce: CallIdentifier,
    ) -> Result<Vec<HeldPosition>, ExchangeError> {
        let _guard = self.enter(nonce).await?;
        let mut held: Vec<HeldPosition> = self.state().holdings.values().cloned().collect();
        held.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn exchange() -> PaperExchange {
        let market = PaperMarket::new();
        market.set_price("BTC-USD", dec!(100));
        PaperExchange::new("paper", dec!(1000), market)
    }

    #[tokio::test]
    async fn test_rejects_non_increasing_nonce() {
        let ex = exchange();

        assert!(ex.get_balance(CallIdentifier(5)).await.is_ok());
        let err = ex.get_balance(CallIdentifier(5)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
        assert_eq!(ex.nonces(), vec![5, 5]);
    }

    #[tokio::test]
    async fn test_fills_net_into_holdings() {
        let ex = exchange();

        ex.submit_order(CallIdentifier(1), &OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();
        ex.market().set_price("BTC-USD", dec!(110));
        ex.close_position(CallIdentifier(2), "BTC-USD", TradeSide::Sell, dec!(2))
            .await
            .unwrap();

        assert!(ex.holding("BTC-USD").is_none());
        assert_eq!(ex.get_balance(CallIdentifier(3)).await.unwrap(), dec!(1020));
    }

    #[tokio::test]
    async fn test_non_fill_status_executes_nothing() {
        let ex = exchange();
        ex.set_fill_status(OrderStatus::Cancelled);

        let fill = ex
            .submit_order(CallIdentifier(1), &OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(1)))
            .await
            .unwrap();

        assert_eq!(fill.status, OrderStatus::Cancelled);
        assert_eq!(fill.filled_quantity, Decimal::ZERO);
        assert!(ex.orders().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_symbol_is_distinct() {
        let ex = exchange();
        ex.mark_unsupported("BTC-USD");

        let err = ex
            .submit_order(CallIdentifier(1), &OrderRequest::base("BTC-USD", TradeSide::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnsupportedSymbol(_)));
    }
}
