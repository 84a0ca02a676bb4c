// =============================================================================
// Fan-out Bus — one 1s candle stream, N bounded subscribers
// =============================================================================
//
// Every input candle is offered to every subscriber. A subscriber whose
// queue is full at offer time is skipped and its drop counter incremented;
// nothing ever blocks the bus. When the input closes (or the pipeline is
// cancelled) the subscriber senders are dropped, which closes every
// downstream receiver.
//
// Subscription happens at wiring time; the subscriber list is behind an
// RwLock only because the admin surface reads channel stats concurrently.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::Candle1s;

struct SubscriberSlot {
    label: String,
    tx: mpsc::Sender<Candle1s>,
    dropped: AtomicU64,
}

/// Per-subscriber saturation and drop stats for gauges.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStat {
    pub label: String,
    pub len: usize,
    pub capacity: usize,
    pub dropped: u64,
}

#[derive(Default)]
pub struct FanoutBus {
    subscribers: RwLock<Vec<SubscriberSlot>>,
}

impl FanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new bounded subscriber and return its receiving end.
    pub fn subscribe(&self, label: impl Into<String>, capacity: usize) -> mpsc::Receiver<Candle1s> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().push(SubscriberSlot {
            label: label.into(),
            tx,
            dropped: AtomicU64::new(0),
        });
        rx
    }

    /// Offer a candle to every subscriber; full subscribers are skipped.
    pub fn publish(&self, candle: &Candle1s) {
        let subs = self.subscribers.read();
        for slot in subs.iter() {
            match slot.tx.try_send(candle.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %slot.label, "fan-out drop: subscriber full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver went away; stats keep the slot visible, the
                    // sends just become no-ops.
                }
            }
        }
    }

    /// (len, capacity, dropped) per subscriber for saturation gauges.
    pub fn channel_stats(&self) -> Vec<ChannelStat> {
        self.subscribers
            .read()
            .iter()
            .map(|slot| {
                let capacity = slot.tx.max_capacity();
                ChannelStat {
                    label: slot.label.clone(),
                    len: capacity - slot.tx.capacity(),
                    capacity,
                    dropped: slot.dropped.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Drop every subscriber sender, closing all downstream receivers.
    fn close(&self) {
        self.subscribers.write().clear();
    }
}

/// Pump candles from the aggregator output into the bus until the input
/// closes or the pipeline is cancelled, then propagate the close downstream.
pub async fn run_fanout(
    bus: Arc<FanoutBus>,
    mut input: mpsc::Receiver<Candle1s>,
    cancel: CancellationToken,
) {
    info!("fan-out bus started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Deliver anything already queued before closing downstream.
                while let Ok(candle) = input.try_recv() {
                    bus.publish(&candle);
                }
                break;
            }
            maybe = input.recv() => {
                match maybe {
                    Some(candle) => bus.publish(&candle),
                    None => break,
                }
            }
        }
    }
    bus.close();
    info!("fan-out bus stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle1s {
        Candle1s {
            token: "3045".into(),
            exchange: "NSE".into(),
            ts,
            open: 100_00,
            high: 100_50,
            low: 99_50,
            close: 100_25,
            volume: 10,
            ticks_count: 4,
        }
    }

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus = FanoutBus::new();
        let mut a = bus.subscribe("a", 8);
        let mut b = bus.subscribe("b", 8);

        for ts in 0..3 {
            bus.publish(&candle(ts));
        }

        for ts in 0..3 {
            assert_eq!(a.try_recv().unwrap().ts, ts);
            assert_eq!(b.try_recv().unwrap().ts, ts);
        }
    }

    #[test]
    fn full_subscriber_is_skipped_not_blocked() {
        let bus = FanoutBus::new();
        let mut small = bus.subscribe("small", 1);
        let mut big = bus.subscribe("big", 8);

        bus.publish(&candle(0));
        bus.publish(&candle(1)); // small is full here
        bus.publish(&candle(2)); // and here

        let stats = bus.channel_stats();
        assert_eq!(stats[0].dropped, 2);
        assert_eq!(stats[1].dropped, 0);

        // The slow subscriber still sees its delivered candle, in order.
        assert_eq!(small.try_recv().unwrap().ts, 0);
        assert!(small.try_recv().is_err());
        for ts in 0..3 {
            assert_eq!(big.try_recv().unwrap().ts, ts);
        }
    }

    #[test]
    fn channel_stats_report_saturation() {
        let bus = FanoutBus::new();
        let _rx = bus.subscribe("tf", 4);

        bus.publish(&candle(0));
        bus.publish(&candle(1));

        let stats = bus.channel_stats();
        assert_eq!(stats[0].label, "tf");
        assert_eq!(stats[0].len, 2);
        assert_eq!(stats[0].capacity, 4);
    }

    #[tokio::test]
    async fn input_close_propagates_to_subscribers() {
        let bus = Arc::new(FanoutBus::new());
        let mut sub = bus.subscribe("s", 8);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_fanout(bus.clone(), rx, cancel));

        tx.send(candle(7)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(sub.recv().await.unwrap().ts, 7);
        assert!(sub.recv().await.is_none(), "subscriber must see close");
    }
}
