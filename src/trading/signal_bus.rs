//! Trade signal bus: decouples master fill detection from replication.
//!
//! Backed by a bounded broadcast channel. Publishing never blocks; when a
//! subscriber falls behind by more than the capacity, its oldest signals are
//! dropped and it is told how many it missed.

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::error::PublishError;
use crate::models::TradeSignal;

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<TradeSignal>,
}

impl SignalBus {
    #[instrument]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        debug!(capacity, "SignalBus initialized");
        Self { tx }
    }

    /// Publish a confirmed master fill. Any other order status is refused.
    #[instrument(skip(self, signal), fields(order_id = %signal.order_id))]
    pub fn publish(&self, signal: TradeSignal) -> Result<usize, PublishError> {
        if !signal.is_replicable() {
            warn!(
                status = signal.status.as_str(),
                symbol = %signal.symbol,
                "Refusing to publish a signal that is not a fill"
            );
            return Err(PublishError::NotAFill {
                order_id: signal.order_id,
                status: signal.status.as_str(),
            });
        }

        let symbol = signal.symbol.clone();
        let side = signal.side;
        let quantity = signal.filled_quantity;

        match self.tx.send(signal) {
            Ok(subscriber_count) => {
                info!(
                    symbol = %symbol,
                    side = side.as_str(),
                    quantity = %quantity,
                    subscriber_count,
                    "Published signal to signal bus"
                );
                Ok(subscriber_count)
            }
            Err(_) => {
                warn!(symbol = %symbol, "No subscriber on signal bus, signal stays journaled");
                Err(PublishError::NoSubscribers)
            }
        }
    }

    #[instrument(skip(self))]
    pub fn subscribe(&self) -> SignalStream {
        debug!("New subscriber added to signal bus");
        SignalStream {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One consumer's view of the bus, in publish order.
pub struct SignalStream {
    rx: broadcast::Receiver<TradeSignal>,
    lagged: u64,
}

impl SignalStream {
    /// Next signal, or `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<TradeSignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    warn!(skipped, "Signal consumer fell behind, oldest signals dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Signals dropped since the last call, resetting the count.
    pub fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }

    pub fn into_stream(self) -> impl Stream<Item = TradeSignal> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|signal| (signal, stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, OrderStatus, SizeType, TradeSide};
    use chrono::Utc;
    use futures::StreamExt;
    use rust_decimal_macros::dec;

    fn signal(order_id: &str, status: OrderStatus) -> TradeSignal {
        TradeSignal {
            order_id: order_id.to_string(),
            master_account: AccountId::new("master"),
            symbol: "BTC-USD".to_string(),
            side: TradeSide::Buy,
            filled_quantity: dec!(1),
            fill_price: dec!(100),
            size_type: SizeType::Base,
            master_balance: dec!(10000),
            status,
            filled_at: Utc::now(),
            reduces_position: false,
        }
    }

    #[tokio::test]
    async fn test_only_fills_are_delivered() {
        let bus = SignalBus::new(16);
        let mut stream = bus.subscribe();

        assert!(matches!(
            bus.publish(signal("pending", OrderStatus::Pending)),
            Err(PublishError::NotAFill { .. })
        ));
        assert!(bus.publish(signal("cancelled", OrderStatus::Cancelled)).is_err());
        assert!(bus.publish(signal("open", OrderStatus::Open)).is_err());
        assert_eq!(bus.publish(signal("filled", OrderStatus::Filled)).unwrap(), 1);
        bus.publish(signal("partial", OrderStatus::PartiallyFilled)).unwrap();
        drop(bus);

        let delivered: Vec<String> = stream_ids(&mut stream).await;
        assert_eq!(delivered, vec!["filled", "partial"]);
    }

    async fn stream_ids(stream: &mut SignalStream) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(signal) = stream.next().await {
            ids.push(signal.order_id);
        }
        ids
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = SignalBus::new(2);
        let mut stream = bus.subscribe();

        for id in ["a", "b", "c"] {
            bus.publish(signal(id, OrderStatus::Filled)).unwrap();
        }
        drop(bus);

        assert_eq!(stream_ids(&mut stream).await, vec!["b", "c"]);
        assert_eq!(stream.take_lagged(), 1);
        assert_eq!(stream.take_lagged(), 0);
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_every_signal() {
        let bus = SignalBus::new(8);
        let first = bus.subscribe().into_stream();
        let second = bus.subscribe().into_stream();

        bus.publish(signal("x", OrderStatus::Filled)).unwrap();
        bus.publish(signal("y", OrderStatus::Filled)).unwrap();
        drop(bus);

        let a: Vec<_> = first.map(|s| s.order_id).collect().await;
        let b: Vec<_> = second.map(|s| s.order_id).collect().await;
        assert_eq!(a, vec!["x", "y"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_publish_without_subscriber_reports_it() {
        let bus = SignalBus::new(4);
        assert!(matches!(
            bus.publish(signal("lonely", OrderStatus::Filled)),
            Err(PublishError::NoSubscribers)
        ));
    }
}
