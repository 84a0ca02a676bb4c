// =============================================================================
// Event-Time Aggregator — ticks to finalized 1-second candles
// =============================================================================
//
// Single-owner state machine. Tracks the maximum canonical event time across
// all instruments and derives a monotone watermark from it; a tick whose
// bucket falls behind the watermark is rejected as late. Ticks for an older
// bucket that is still inside the reorder window go into a transient
// out-of-order slot keyed by (instrument, bucket) instead of reopening the
// primary forming candle; the 100 ms timer pass flushes those slots once the
// watermark crosses them.
//
// A finalized bucket is never reopened: each instrument remembers its highest
// finalized bucket and anything at or below it counts as late.
//
// Emission never blocks. A full output queue drops the candle and bumps a
// counter.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::PipelineMetrics;
use crate::ring;
use crate::types::{Candle1s, InstrumentKey, Tick};

/// Timer-driven flush cadence.
const FLUSH_INTERVAL_MS: u64 = 100;

pub struct Aggregator {
    /// Event-time reorder window, milliseconds.
    reorder_buffer_ms: i64,
    /// Max canonical tick timestamp observed, milliseconds.
    max_event_ms: i64,
    /// Monotone watermark, whole seconds. Buckets strictly below are closed.
    watermark_sec: i64,
    /// Primary forming candle per instrument.
    forming: HashMap<InstrumentKey, Candle1s>,
    /// Transient out-of-order slots inside the reorder window.
    reorder: HashMap<(InstrumentKey, i64), Candle1s>,
    /// Highest finalized bucket per instrument; at-or-below is late.
    finalized_floor: HashMap<InstrumentKey, i64>,
    out: mpsc::Sender<Candle1s>,
    metrics: Arc<PipelineMetrics>,
}

impl Aggregator {
    pub fn new(
        reorder_buffer_ms: u64,
        out: mpsc::Sender<Candle1s>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            reorder_buffer_ms: reorder_buffer_ms as i64,
            max_event_ms: i64::MIN,
            watermark_sec: i64::MIN,
            forming: HashMap::new(),
            reorder: HashMap::new(),
            finalized_floor: HashMap::new(),
            out,
            metrics,
        }
    }

    pub fn watermark_sec(&self) -> i64 {
        self.watermark_sec
    }

    // ── Tick path ───────────────────────────────────────────────────────

    pub fn on_tick(&mut self, tick: &Tick) {
        self.metrics.record_tick();

        let event_ms = tick.canonical_ts().timestamp_millis();
        let bucket = tick.bucket_sec();

        if event_ms > self.max_event_ms {
            self.max_event_ms = event_ms;
            // Watermark only ever advances.
            let candidate = (self.max_event_ms - self.reorder_buffer_ms).div_euclid(1000);
            if candidate > self.watermark_sec {
                self.watermark_sec = candidate;
            }
        }

        if bucket < self.watermark_sec {
            self.metrics.late_ticks.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = tick.instrument_key();
        if let Some(&floor) = self.finalized_floor.get(&key) {
            if bucket <= floor {
                // Inside the reorder window but the bucket was already
                // finalized; re-opening it would break finalized
                // immutability.
                self.metrics.late_ticks.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let forming_ts = self.forming.get(&key).map(|c| c.ts);
        match forming_ts {
            None => {
                self.forming.insert(key, Candle1s::open_from_tick(tick, bucket));
            }
            Some(ts) if ts == bucket => {
                if let Some(candle) = self.forming.get_mut(&key) {
                    candle.merge_tick(tick);
                }
            }
            Some(ts) if ts < bucket => {
                // Bucket rollover: finalize, then start the new bucket.
                if let Some(done) = self
                    .forming
                    .insert(key, Candle1s::open_from_tick(tick, bucket))
                {
                    self.finalize(done);
                }
            }
            Some(_) => {
                // Older bucket still inside the reorder window: keep it in a
                // transient slot until the watermark crosses it.
                self.reorder
                    .entry((key, bucket))
                    .and_modify(|c| c.merge_tick(tick))
                    .or_insert_with(|| Candle1s::open_from_tick(tick, bucket));
                self.metrics
                    .reorder_slots
                    .store(self.reorder.len(), Ordering::Relaxed);
            }
        }
    }

    // ── Timer flush ─────────────────────────────────────────────────────

    /// Finalize every bucket whose end has passed the watermark, or — while
    /// the watermark still trails it — the wall clock. Runs on the 100 ms
    /// timer.
    pub fn flush_due(&mut self, wall_clock_sec: i64) {
        let horizon = self.watermark_sec.max(wall_clock_sec);

        let mut due: Vec<Candle1s> = Vec::new();

        let expired: Vec<(InstrumentKey, i64)> = self
            .reorder
            .keys()
            .filter(|(_, bucket)| bucket + 1 < horizon)
            .cloned()
            .collect();
        for k in expired {
            if let Some(c) = self.reorder.remove(&k) {
                due.push(c);
            }
        }

        let done_keys: Vec<InstrumentKey> = self
            .forming
            .iter()
            .filter(|(_, c)| c.ts + 1 < horizon)
            .map(|(k, _)| k.clone())
            .collect();
        for k in done_keys {
            if let Some(c) = self.forming.remove(&k) {
                due.push(c);
            }
        }

        // Per-instrument emission order stays non-decreasing in ts.
        due.sort_by(|a, b| (a.ts, &a.exchange, &a.token).cmp(&(b.ts, &b.exchange, &b.token)));
        for c in due {
            self.finalize(c);
        }

        self.metrics
            .reorder_slots
            .store(self.reorder.len(), Ordering::Relaxed);
        if self.max_event_ms != i64::MIN {
            let now_ms = Utc::now().timestamp_millis();
            self.metrics
                .watermark_delay_ms
                .store(now_ms - self.watermark_sec * 1000, Ordering::Relaxed);
        }
    }

    // ── Session flush ───────────────────────────────────────────────────

    /// Emit every forming candle regardless of bucket and clear all state.
    /// Invoked at feed termination and on shutdown.
    pub fn flush_session(&mut self) {
        let mut due: Vec<Candle1s> = self.reorder.drain().map(|(_, c)| c).collect();
        due.extend(self.forming.drain().map(|(_, c)| c));
        due.sort_by(|a, b| (a.ts, &a.exchange, &a.token).cmp(&(b.ts, &b.exchange, &b.token)));

        let count = due.len();
        for c in due {
            self.finalize(c);
        }
        self.finalized_floor.clear();
        self.metrics.reorder_slots.store(0, Ordering::Relaxed);
        if count > 0 {
            info!(candles = count, "session flush emitted forming candles");
        }
    }

    // ── Emission ────────────────────────────────────────────────────────

    fn finalize(&mut self, candle: Candle1s) {
        let key = candle.instrument_key();
        let floor = self.finalized_floor.entry(key).or_insert(i64::MIN);
        if candle.ts > *floor {
            *floor = candle.ts;
        }

        match self.out.try_send(candle) {
            Ok(()) => {
                self.metrics.candles_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(c)) => {
                self.metrics.dropped_candles.fetch_add(1, Ordering::Relaxed);
                debug!(instrument = %c.instrument_key(), ts = c.ts, "1s candle dropped: queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("1s candle output closed");
            }
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Drive the aggregator from the ingress ring until cancelled. The session
/// controller signals `session_flush` at feed termination; cancellation also
/// flushes on the way out.
pub async fn run_aggregator(
    mut agg: Aggregator,
    ticks: ring::Consumer<Tick>,
    mut session_flush: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    info!("aggregator started");
    let mut flush = interval(Duration::from_millis(FLUSH_INTERVAL_MS));
    let mut flush_closed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Some(tick) = ticks.pop() {
                    agg.on_tick(&tick);
                }
                agg.flush_session();
                info!("aggregator stopped");
                return;
            }
            signal = session_flush.recv(), if !flush_closed => {
                match signal {
                    Some(()) => {
                        while let Some(tick) = ticks.pop() {
                            agg.on_tick(&tick);
                        }
                        agg.flush_session();
                    }
                    None => flush_closed = true,
                }
            }
            _ = flush.tick() => {
                while let Some(tick) = ticks.pop() {
                    agg.on_tick(&tick);
                }
                agg.flush_due(Utc::now().timestamp());
            }
            _ = tokio::time::sleep(Duration::from_millis(1)) => {
                while let Some(tick) = ticks.pop() {
                    agg.on_tick(&tick);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const T: i64 = 1_700_000_000;

    fn tick_at(price: i64, qty: i64, sec: i64, millis: u32) -> Tick {
        Tick {
            token: "3045".into(),
            exchange: "NSE".into(),
            price,
            qty,
            tick_ts: Utc.timestamp_opt(sec, millis * 1_000_000).unwrap(),
            event_ts: None,
        }
    }

    fn setup(capacity: usize) -> (Aggregator, mpsc::Receiver<Candle1s>, Arc<PipelineMetrics>) {
        let (tx, rx) = mpsc::channel(capacity);
        let metrics = Arc::new(PipelineMetrics::new());
        (Aggregator::new(300, tx, metrics.clone()), rx, metrics)
    }

    #[test]
    fn single_bucket_ohlc() {
        let (mut agg, mut rx, _m) = setup(16);

        // Four ticks inside bucket T, then one at T+1 triggers rollover.
        agg.on_tick(&tick_at(50_000, 10, T, 0));
        agg.on_tick(&tick_at(50_500, 20, T, 200));
        agg.on_tick(&tick_at(49_800, 5, T, 500));
        agg.on_tick(&tick_at(50_100, 7, T, 900));
        agg.on_tick(&tick_at(50_200, 1, T + 1, 0));

        let c = rx.try_recv().expect("finalized candle");
        assert_eq!(c.ts, T);
        assert_eq!(c.open, 50_000);
        assert_eq!(c.high, 50_500);
        assert_eq!(c.low, 49_800);
        assert_eq!(c.close, 50_100);
        assert_eq!(c.volume, 42);
        assert_eq!(c.ticks_count, 4);
        assert!(rx.try_recv().is_err(), "T+1 still forming");
    }

    #[test]
    fn late_tick_behind_watermark_is_rejected() {
        let (mut agg, mut rx, m) = setup(16);

        agg.on_tick(&tick_at(100_00, 1, T + 10, 500));
        // Watermark is now (T+10.5s - 0.3s) floored = T+10.
        assert_eq!(agg.watermark_sec(), T + 10);

        agg.on_tick(&tick_at(100_00, 1, T + 5, 0));
        assert_eq!(m.late_ticks.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn watermark_is_monotone() {
        let (mut agg, _rx, _m) = setup(16);

        agg.on_tick(&tick_at(100_00, 1, T + 10, 500));
        let w1 = agg.watermark_sec();
        // An older (but admissible) tick must not pull the watermark back.
        agg.on_tick(&tick_at(100_00, 1, T + 9, 900));
        assert!(agg.watermark_sec() >= w1);
        agg.on_tick(&tick_at(100_00, 1, T + 20, 0));
        assert!(agg.watermark_sec() > w1);
    }

    #[test]
    fn out_of_order_bucket_gets_transient_slot() {
        let (mut agg, mut rx, m) = setup(16);

        // Establish forming bucket T+2; watermark trails at T+1.
        agg.on_tick(&tick_at(100_00, 1, T + 2, 100));
        assert_eq!(agg.watermark_sec(), T + 1);

        // A tick for bucket T+1 (>= watermark, < forming) goes into a
        // reorder slot without touching the forming candle.
        agg.on_tick(&tick_at(99_00, 2, T + 1, 950));
        assert_eq!(m.reorder_slots.load(Ordering::Relaxed), 1);
        assert!(rx.try_recv().is_err());

        // Advance the watermark via another instrument; the timer pass then
        // flushes the slot (and the now-closed forming bucket) in ts order.
        let mut other = tick_at(101_00, 1, T + 5, 0);
        other.token = "11536".into();
        agg.on_tick(&other);
        agg.flush_due(T + 5);

        let c = rx.try_recv().expect("reorder slot flushed");
        assert_eq!(c.ts, T + 1);
        assert_eq!(c.close, 99_00);
        let c2 = rx.try_recv().expect("forming bucket flushed after slot");
        assert_eq!(c2.ts, T + 2);
        assert_eq!(m.reorder_slots.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn finalized_bucket_is_never_reopened() {
        let (mut agg, mut rx, m) = setup(16);

        agg.on_tick(&tick_at(100_00, 1, T, 0));
        agg.on_tick(&tick_at(100_50, 1, T + 1, 0)); // finalizes T
        let c = rx.try_recv().unwrap();
        assert_eq!(c.ts, T);

        // Same bucket again, still within the reorder window.
        agg.on_tick(&tick_at(200_00, 1, T, 900));
        assert_eq!(m.late_ticks.load(Ordering::Relaxed), 1);
        agg.flush_due(T + 10);
        // Only the forming T+1 candle may come out, never a second T.
        if let Ok(c2) = rx.try_recv() {
            assert_eq!(c2.ts, T + 1);
        }
    }

    #[test]
    fn timer_flush_uses_wall_clock_when_feed_is_quiet() {
        let (mut agg, mut rx, _m) = setup(16);

        agg.on_tick(&tick_at(100_00, 3, T, 100));
        // No further ticks: event-time watermark stalls, but the wall clock
        // has moved on.
        agg.flush_due(T + 5);

        let c = rx.try_recv().expect("quiet-feed flush");
        assert_eq!(c.ts, T);
        assert_eq!(c.volume, 3);
    }

    #[test]
    fn session_flush_emits_everything_in_order() {
        let (mut agg, mut rx, _m) = setup(16);

        agg.on_tick(&tick_at(100_00, 1, T + 2, 100));
        agg.on_tick(&tick_at(99_00, 1, T + 1, 900)); // reorder slot

        agg.flush_session();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.ts, T + 1);
        assert_eq!(second.ts, T + 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_output_drops_and_counts() {
        let (mut agg, _rx, m) = setup(1);

        // Three rollovers against a capacity-1 queue: 2 drops.
        agg.on_tick(&tick_at(100_00, 1, T, 0));
        agg.on_tick(&tick_at(100_00, 1, T + 1, 0));
        agg.on_tick(&tick_at(100_00, 1, T + 2, 0));
        agg.on_tick(&tick_at(100_00, 1, T + 3, 0));

        assert_eq!(m.candles_emitted.load(Ordering::Relaxed), 1);
        assert_eq!(m.dropped_candles.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn event_ts_takes_precedence_for_bucketing() {
        let (mut agg, mut rx, _m) = setup(16);

        let mut t = tick_at(100_00, 1, T + 30, 0);
        t.event_ts = Some(Utc.timestamp_opt(T, 0).unwrap());
        agg.on_tick(&t);
        agg.on_tick(&tick_at(101_00, 1, T + 31, 0));

        // Rollover finalizes the event-time bucket T, not T+30.
        let c = rx.try_recv().unwrap();
        assert_eq!(c.ts, T);
    }
}
