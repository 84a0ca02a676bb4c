// =============================================================================
// Timeframe Builder — 1s candles resampled into configured timeframes
// =============================================================================
//
// Maintains one forming candle per (instrument, timeframe). Every input emits
// a forming snapshot for each timeframe; crossing a bucket boundary emits the
// completed candle with `forming == false` first. Inputs older than the
// forming bucket by more than the staleness tolerance are dropped and
// counted — a finalized timeframe bucket is never amended.
//
// Timeframes can be swapped at runtime: removed ones are finalized on the
// spot, surviving ones keep their forming state, new ones start cold.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::PipelineMetrics;
use crate::types::{Candle1s, InstrumentKey, TfCandle};

/// Optional hook invoked with every finalized candle before emission.
pub type FinalizeHook = Box<dyn Fn(&TfCandle) + Send + Sync>;

pub struct TfBuilder {
    tfs: Vec<u32>,
    /// Forming state per timeframe, parallel to `tfs`.
    state: Vec<HashMap<InstrumentKey, TfCandle>>,
    /// Inputs older than the forming bucket by more than this many seconds
    /// are rejected.
    stale_tolerance_secs: i64,
    out: mpsc::Sender<TfCandle>,
    metrics: Arc<PipelineMetrics>,
    on_finalize: Option<FinalizeHook>,
}

impl TfBuilder {
    pub fn new(
        tfs: Vec<u32>,
        stale_tolerance_secs: u64,
        out: mpsc::Sender<TfCandle>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let state = tfs.iter().map(|_| HashMap::new()).collect();
        Self {
            tfs,
            state,
            stale_tolerance_secs: stale_tolerance_secs as i64,
            out,
            metrics,
            on_finalize: None,
        }
    }

    pub fn with_finalize_hook(mut self, hook: FinalizeHook) -> Self {
        self.on_finalize = Some(hook);
        self
    }

    pub fn tfs(&self) -> &[u32] {
        &self.tfs
    }

    // ── Input path ──────────────────────────────────────────────────────

    pub fn on_candle(&mut self, c: &Candle1s) {
        let started = std::time::Instant::now();
        let key = c.instrument_key();

        for idx in 0..self.tfs.len() {
            let tf = self.tfs[idx];
            let bucket = c.ts - c.ts.rem_euclid(tf as i64);
            let forming_ts = self.state[idx].get(&key).map(|f| f.ts);

            match forming_ts {
                Some(ts) if ts > bucket && ts - bucket > self.stale_tolerance_secs => {
                    self.metrics.stale_tf_candles.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        instrument = %key,
                        tf,
                        forming_ts = ts,
                        input_ts = c.ts,
                        "stale 1s candle rejected"
                    );
                }
                Some(ts) if bucket > ts => {
                    // Rollover: close the old bucket, open the new one.
                    if let Some(done) = self.state[idx]
                        .insert(key.clone(), TfCandle::open_from_1s(c, tf, bucket))
                    {
                        self.finalize(done);
                    }
                    self.emit_forming(idx, &key);
                }
                Some(_) => {
                    if let Some(forming) = self.state[idx].get_mut(&key) {
                        forming.merge_1s(c);
                    }
                    self.emit_forming(idx, &key);
                }
                None => {
                    self.state[idx]
                        .insert(key.clone(), TfCandle::open_from_1s(c, tf, bucket));
                    self.emit_forming(idx, &key);
                }
            }
        }

        self.metrics
            .tf_build
            .record_ms(started.elapsed().as_secs_f64() * 1000.0);
    }

    // ── Dynamic timeframe update ────────────────────────────────────────

    /// Swap the timeframe set: finalize forming candles of removed
    /// timeframes, keep state for surviving ones, start new ones cold.
    pub fn update_tfs(&mut self, new_tfs: Vec<u32>) {
        let mut old: HashMap<u32, HashMap<InstrumentKey, TfCandle>> = self
            .tfs
            .drain(..)
            .zip(self.state.drain(..))
            .collect();

        let mut state = Vec::with_capacity(new_tfs.len());
        for tf in &new_tfs {
            state.push(old.remove(tf).unwrap_or_default());
        }

        // Whatever was not carried over is finalized now.
        for (tf, map) in old {
            info!(tf, instruments = map.len(), "timeframe removed, finalizing");
            let mut done: Vec<TfCandle> = map.into_values().collect();
            done.sort_by_key(|c| c.ts);
            for c in done {
                self.finalize(c);
            }
        }

        info!(tfs = ?new_tfs, "timeframe set updated");
        self.tfs = new_tfs;
        self.state = state;
    }

    // ── Session flush ───────────────────────────────────────────────────

    /// Finalize every forming candle across all timeframes.
    pub fn flush_session(&mut self) {
        let mut count = 0;
        for idx in 0..self.tfs.len() {
            let mut done: Vec<TfCandle> = self.state[idx].drain().map(|(_, c)| c).collect();
            done.sort_by(|a, b| (a.ts, &a.exchange, &a.token).cmp(&(b.ts, &b.exchange, &b.token)));
            count += done.len();
            for c in done {
                self.finalize(c);
            }
        }
        if count > 0 {
            info!(candles = count, "session flush finalized forming TF candles");
        }
    }

    // ── Emission ────────────────────────────────────────────────────────

    fn finalize(&mut self, mut candle: TfCandle) {
        candle.forming = false;
        if let Some(hook) = &self.on_finalize {
            hook(&candle);
        }
        self.emit(candle);
    }

    fn emit_forming(&mut self, idx: usize, key: &InstrumentKey) {
        let snapshot = self.state[idx].get(key).cloned();
        if let Some(forming) = snapshot {
            self.emit(forming);
        }
    }

    fn emit(&mut self, candle: TfCandle) {
        match self.out.try_send(candle) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(c)) => {
                self.metrics
                    .dropped_tf_candles
                    .fetch_add(1, Ordering::Relaxed);
                debug!(
                    instrument = %c.instrument_key(),
                    tf = c.tf,
                    ts = c.ts,
                    forming = c.forming,
                    "TF candle dropped: queue full"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("TF candle output closed");
            }
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Consume 1s candles until the input closes or the pipeline is cancelled,
/// then finalize all forming state. The session controller signals
/// `session_flush` at feed termination.
pub async fn run_tf_builder(
    mut builder: TfBuilder,
    mut input: mpsc::Receiver<Candle1s>,
    mut session_flush: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    info!(tfs = ?builder.tfs(), "TF builder started");
    let mut flush_closed = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(c) = input.try_recv() {
                    builder.on_candle(&c);
                }
                break;
            }
            signal = session_flush.recv(), if !flush_closed => {
                match signal {
                    Some(()) => builder.flush_session(),
                    None => flush_closed = true,
                }
            }
            maybe = input.recv() => {
                match maybe {
                    Some(c) => builder.on_candle(&c),
                    None => break,
                }
            }
        }
    }
    builder.flush_session();
    info!("TF builder stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_100; // multiple of 300

    fn candle_1s(ts: i64, close: i64) -> Candle1s {
        Candle1s {
            token: "3045".into(),
            exchange: "NSE".into(),
            ts,
            open: close,
            high: close + 10,
            low: close - 10,
            close,
            volume: 5,
            ticks_count: 2,
        }
    }

    fn setup(tfs: &[u32], capacity: usize) -> (TfBuilder, mpsc::Receiver<TfCandle>, Arc<PipelineMetrics>) {
        let (tx, rx) = mpsc::channel(capacity);
        let metrics = Arc::new(PipelineMetrics::new());
        (
            TfBuilder::new(tfs.to_vec(), 2, tx, metrics.clone()),
            rx,
            metrics,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<TfCandle>) -> Vec<TfCandle> {
        let mut all = Vec::new();
        while let Ok(c) = rx.try_recv() {
            all.push(c);
        }
        all
    }

    #[test]
    fn resamples_into_60s_and_300s_buckets() {
        let (mut builder, mut rx, _m) = setup(&[60, 300], 4096);

        // 300 consecutive seconds, close = k, then one candle in the next
        // 5-minute bucket.
        for k in 0..300 {
            builder.on_candle(&candle_1s(T0 + k, 100_00 + k));
        }
        builder.on_candle(&candle_1s(T0 + 300, 200_00));

        let all = drain(&mut rx);
        let finalized_60: Vec<_> = all.iter().filter(|c| !c.forming && c.tf == 60).collect();
        let finalized_300: Vec<_> = all.iter().filter(|c| !c.forming && c.tf == 300).collect();

        assert_eq!(finalized_60.len(), 5);
        assert_eq!(finalized_300.len(), 1);

        let five_min = finalized_300[0];
        assert_eq!(five_min.ts, T0);
        assert_eq!(five_min.count, 300);
        assert_eq!(five_min.close, 100_00 + 299);
        assert_eq!(five_min.open, 100_00);
        assert_eq!(five_min.ts % 300, 0);

        // 60s buckets are aligned and strictly increasing.
        for (i, c) in finalized_60.iter().enumerate() {
            assert_eq!(c.ts, T0 + i as i64 * 60);
            assert_eq!(c.ts % 60, 0);
            assert_eq!(c.count, 60);
        }
    }

    #[test]
    fn forming_snapshot_on_every_input() {
        let (mut builder, mut rx, _m) = setup(&[60], 64);

        builder.on_candle(&candle_1s(T0, 100_00));
        builder.on_candle(&candle_1s(T0 + 1, 101_00));

        let all = drain(&mut rx);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.forming));
        assert_eq!(all[0].count, 1);
        assert_eq!(all[1].count, 2);
        assert_eq!(all[1].close, 101_00);
    }

    #[test]
    fn finalized_emitted_before_next_forming() {
        let (mut builder, mut rx, _m) = setup(&[60], 64);

        builder.on_candle(&candle_1s(T0 + 59, 100_00));
        builder.on_candle(&candle_1s(T0 + 60, 101_00));

        let all = drain(&mut rx);
        assert_eq!(all.len(), 3);
        assert!(all[0].forming);
        assert!(!all[1].forming, "rollover emits finalized first");
        assert_eq!(all[1].ts, T0);
        assert!(all[2].forming);
        assert_eq!(all[2].ts, T0 + 60);
    }

    #[test]
    fn stale_input_is_rejected_and_counted() {
        let (mut builder, mut rx, m) = setup(&[60], 256);

        // Advance the forming bucket to T0 + 120.
        builder.on_candle(&candle_1s(T0, 100_00));
        builder.on_candle(&candle_1s(T0 + 60, 101_00));
        builder.on_candle(&candle_1s(T0 + 120, 102_00));
        let _ = drain(&mut rx);

        // An input 120 s older than the forming bucket: beyond the 2 s
        // tolerance, so it must be dropped without touching state.
        builder.on_candle(&candle_1s(T0, 999_00));
        assert_eq!(m.stale_tf_candles.load(Ordering::Relaxed), 1);
        assert!(drain(&mut rx).is_empty());

        // Forming state is unchanged: next input merges as count 2.
        builder.on_candle(&candle_1s(T0 + 121, 103_00));
        let all = drain(&mut rx);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].count, 2);
        assert_eq!(all[0].close, 103_00);
    }

    #[test]
    fn update_tfs_finalizes_removed_and_keeps_surviving() {
        let (mut builder, mut rx, _m) = setup(&[60, 120], 256);

        builder.on_candle(&candle_1s(T0, 100_00));
        builder.on_candle(&candle_1s(T0 + 1, 101_00));
        let _ = drain(&mut rx);

        // Drop 120, keep 60, add 300.
        builder.update_tfs(vec![60, 300]);

        let all = drain(&mut rx);
        assert_eq!(all.len(), 1, "removed timeframe finalizes its forming candle");
        assert!(!all[0].forming);
        assert_eq!(all[0].tf, 120);

        // Surviving 60s state kept its count.
        builder.on_candle(&candle_1s(T0 + 2, 102_00));
        let all = drain(&mut rx);
        let sixty = all.iter().find(|c| c.tf == 60).unwrap();
        assert_eq!(sixty.count, 3);
        // The new timeframe starts cold.
        let three_hundred = all.iter().find(|c| c.tf == 300).unwrap();
        assert_eq!(three_hundred.count, 1);
    }

    #[test]
    fn session_flush_finalizes_everything() {
        let (mut builder, mut rx, _m) = setup(&[60, 300], 256);

        builder.on_candle(&candle_1s(T0, 100_00));
        let _ = drain(&mut rx);

        builder.flush_session();
        let all = drain(&mut rx);
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| !c.forming));
    }

    #[test]
    fn finalize_hook_fires_before_emission() {
        use std::sync::atomic::AtomicU32;

        let (tx, mut rx) = mpsc::channel(64);
        let metrics = Arc::new(PipelineMetrics::new());
        let hook_count = Arc::new(AtomicU32::new(0));
        let hc = hook_count.clone();

        let mut builder = TfBuilder::new(vec![60], 2, tx, metrics).with_finalize_hook(Box::new(
            move |c: &TfCandle| {
                assert!(!c.forming);
                hc.fetch_add(1, Ordering::Relaxed);
            },
        ));

        builder.on_candle(&candle_1s(T0, 100_00));
        builder.on_candle(&candle_1s(T0 + 60, 101_00));
        let _ = drain(&mut rx);

        assert_eq!(hook_count.load(Ordering::Relaxed), 1);
    }
}
