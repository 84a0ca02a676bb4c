// =============================================================================
// Pipeline Metrics & Health — counters, gauges, latency percentiles
// =============================================================================
//
// One process-wide registry shared by every subsystem via `Arc`. Counters and
// gauges are plain atomics so the hot paths never take a lock; the latency
// trackers keep a bounded circular sample window behind a mutex that is only
// touched on store/compute boundaries, not per tick.
//
// The admin API serves `snapshot()` as JSON and `build_health()` as the
// three-level health document.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

/// Samples retained per latency tracker.
const LATENCY_WINDOW: usize = 2048;

// =============================================================================
// Latency tracker
// =============================================================================

/// Interpolated percentiles over the current sample window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

/// Bounded circular window of duration samples (milliseconds) exposing
/// linearly interpolated percentiles.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    samples: Mutex<VecDeque<f64>>,
}

impl LatencyTracker {
    pub fn record_ms(&self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        let mut samples = self.samples.lock();
        if samples.len() >= LATENCY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    pub fn percentiles(&self) -> Percentiles {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return Percentiles::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("finite samples"));

        let pick = |q: f64| -> f64 {
            let rank = q * (sorted.len() - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(sorted.len() - 1);
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        };

        Percentiles {
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
            count: sorted.len(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Circuit breaker state gauge encoding.
pub const BREAKER_CLOSED: u8 = 0;
pub const BREAKER_OPEN: u8 = 1;
pub const BREAKER_HALF_OPEN: u8 = 2;

/// Process-wide metrics registry.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // ── Counters ────────────────────────────────────────────────────────
    pub ticks_ingested: AtomicU64,
    pub candles_emitted: AtomicU64,
    pub ws_reconnects: AtomicU64,
    /// Ticks rejected behind the watermark.
    pub late_ticks: AtomicU64,
    /// Ticks dropped because the ingress ring was full.
    pub dropped_ticks: AtomicU64,
    /// 1s candles dropped on a full output queue.
    pub dropped_candles: AtomicU64,
    /// TF candles dropped on a full output queue.
    pub dropped_tf_candles: AtomicU64,
    pub stale_tf_candles: AtomicU64,
    pub pel_reclaimed: AtomicU64,
    pub breaker_trips: AtomicU64,
    pub buffered_writes: AtomicU64,
    /// Stream payloads that failed to parse (acked and discarded).
    pub bad_payloads: AtomicU64,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub candle_lag_ms: AtomicI64,
    pub watermark_delay_ms: AtomicI64,
    /// Transient out-of-order forming slots currently held by the aggregator.
    pub reorder_slots: AtomicUsize,
    pub breaker_state: AtomicU8,
    pub market_open: AtomicBool,
    /// Smoothed indicator step latency, microseconds (EWMA).
    pub indicator_latency_ewma_us: AtomicU64,

    // ── Health facts ────────────────────────────────────────────────────
    pub ws_connected: AtomicBool,
    pub last_tick_unix_ms: AtomicI64,
    pub redis_ok: AtomicBool,
    pub redis_ping_ms: AtomicU64,
    pub sqlite_ok: AtomicBool,
    pub sqlite_ping_ms: AtomicU64,
    pub tf_builder_ok: AtomicBool,
    pub indicator_ok: AtomicBool,

    // ── Histograms ──────────────────────────────────────────────────────
    pub redis_write: LatencyTracker,
    pub sqlite_commit: LatencyTracker,
    pub tf_build: LatencyTracker,
    pub indicator_compute: LatencyTracker,
    pub end_to_end: LatencyTracker,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks_ingested.fetch_add(1, Ordering::Relaxed);
        self.last_tick_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_f64(gauge: &AtomicU64, value: f64) {
        gauge.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get_f64(gauge: &AtomicU64) -> f64 {
        f64::from_bits(gauge.load(Ordering::Relaxed))
    }

    /// Serializable dump of every counter, gauge and latency percentile.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: CounterSnapshot {
                ticks_ingested: self.ticks_ingested.load(Ordering::Relaxed),
                candles_emitted: self.candles_emitted.load(Ordering::Relaxed),
                ws_reconnects: self.ws_reconnects.load(Ordering::Relaxed),
                late_ticks: self.late_ticks.load(Ordering::Relaxed),
                dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
                dropped_candles: self.dropped_candles.load(Ordering::Relaxed),
                dropped_tf_candles: self.dropped_tf_candles.load(Ordering::Relaxed),
                stale_tf_candles: self.stale_tf_candles.load(Ordering::Relaxed),
                pel_reclaimed: self.pel_reclaimed.load(Ordering::Relaxed),
                breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
                buffered_writes: self.buffered_writes.load(Ordering::Relaxed),
                bad_payloads: self.bad_payloads.load(Ordering::Relaxed),
            },
            gauges: GaugeSnapshot {
                candle_lag_ms: self.candle_lag_ms.load(Ordering::Relaxed),
                watermark_delay_ms: self.watermark_delay_ms.load(Ordering::Relaxed),
                reorder_slots: self.reorder_slots.load(Ordering::Relaxed),
                breaker_state: self.breaker_state.load(Ordering::Relaxed),
                market_open: self.market_open.load(Ordering::Relaxed),
                indicator_latency_ewma_us: Self::get_f64(&self.indicator_latency_ewma_us),
            },
            latency: LatencySnapshot {
                redis_write_ms: self.redis_write.percentiles(),
                sqlite_commit_ms: self.sqlite_commit.percentiles(),
                tf_build_ms: self.tf_build.percentiles(),
                indicator_compute_ms: self.indicator_compute.percentiles(),
                end_to_end_ms: self.end_to_end.percentiles(),
            },
        }
    }

    // ── Health ──────────────────────────────────────────────────────────

    /// Build the three-level health document.
    ///
    /// unhealthy — primary store unreachable or the indicator loop is down.
    /// degraded  — embedded DB unreachable, feed disconnected while the
    ///             market is open, or no tick for 60 s while open.
    pub fn build_health(&self, enabled_tfs: &[u32]) -> HealthReport {
        let now_ms = Utc::now().timestamp_millis();
        let last_tick = self.last_tick_unix_ms.load(Ordering::Relaxed);
        let last_tick_age_ms = (last_tick > 0).then(|| (now_ms - last_tick).max(0));

        let redis_ok = self.redis_ok.load(Ordering::Relaxed);
        let sqlite_ok = self.sqlite_ok.load(Ordering::Relaxed);
        let ws_connected = self.ws_connected.load(Ordering::Relaxed);
        let market_open = self.market_open.load(Ordering::Relaxed);
        let tf_builder_ok = self.tf_builder_ok.load(Ordering::Relaxed);
        let indicator_ok = self.indicator_ok.load(Ordering::Relaxed);

        let feed_stale =
            market_open && last_tick_age_ms.map(|age| age > 60_000).unwrap_or(true);

        let status = if !redis_ok || !indicator_ok || !tf_builder_ok {
            HealthStatus::Unhealthy
        } else if !sqlite_ok || (market_open && !ws_connected) || feed_stale {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            ws_connected,
            market_open,
            last_tick_age_ms,
            redis: StoreHealth {
                ok: redis_ok,
                ping_ms: Self::get_f64(&self.redis_ping_ms),
            },
            sqlite: StoreHealth {
                ok: sqlite_ok,
                ping_ms: Self::get_f64(&self.sqlite_ping_ms),
            },
            tf_builder_ok,
            indicator_ok,
            enabled_tfs: enabled_tfs.to_vec(),
        }
    }
}

// =============================================================================
// Serializable snapshots
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: CounterSnapshot,
    pub gauges: GaugeSnapshot,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub ticks_ingested: u64,
    pub candles_emitted: u64,
    pub ws_reconnects: u64,
    pub late_ticks: u64,
    pub dropped_ticks: u64,
    pub dropped_candles: u64,
    pub dropped_tf_candles: u64,
    pub stale_tf_candles: u64,
    pub pel_reclaimed: u64,
    pub breaker_trips: u64,
    pub buffered_writes: u64,
    pub bad_payloads: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GaugeSnapshot {
    pub candle_lag_ms: i64,
    pub watermark_delay_ms: i64,
    pub reorder_slots: usize,
    pub breaker_state: u8,
    pub market_open: bool,
    pub indicator_latency_ewma_us: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub redis_write_ms: Percentiles,
    pub sqlite_commit_ms: Percentiles,
    pub tf_build_ms: Percentiles,
    pub indicator_compute_ms: Percentiles,
    pub end_to_end_ms: Percentiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub ok: bool,
    pub ping_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub ws_connected: bool,
    pub market_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tick_age_ms: Option<i64>,
    pub redis: StoreHealth,
    pub sqlite: StoreHealth,
    pub tf_builder_ok: bool,
    pub indicator_ok: bool,
    pub enabled_tfs: Vec<u32>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_interpolate_linearly() {
        let tracker = LatencyTracker::default();
        for v in 1..=100 {
            tracker.record_ms(v as f64);
        }
        let p = tracker.percentiles();
        assert_eq!(p.count, 100);
        // rank(p50) = 0.5 * 99 = 49.5 -> halfway between 50 and 51.
        assert!((p.p50 - 50.5).abs() < 1e-9);
        assert!((p.p95 - 95.05).abs() < 1e-9);
        assert!((p.p99 - 99.01).abs() < 1e-9);
    }

    #[test]
    fn percentiles_empty_window() {
        let tracker = LatencyTracker::default();
        let p = tracker.percentiles();
        assert_eq!(p.count, 0);
        assert_eq!(p.p50, 0.0);
    }

    #[test]
    fn window_is_bounded() {
        let tracker = LatencyTracker::default();
        for v in 0..(LATENCY_WINDOW + 500) {
            tracker.record_ms(v as f64);
        }
        assert_eq!(tracker.percentiles().count, LATENCY_WINDOW);
        // Oldest samples were evicted, so the minimum has moved up.
        assert!(tracker.percentiles().p50 >= 500.0);
    }

    #[test]
    fn rejects_garbage_samples() {
        let tracker = LatencyTracker::default();
        tracker.record_ms(f64::NAN);
        tracker.record_ms(-1.0);
        tracker.record_ms(f64::INFINITY);
        assert_eq!(tracker.percentiles().count, 0);
    }

    #[test]
    fn health_levels() {
        let m = PipelineMetrics::new();
        m.redis_ok.store(true, Ordering::Relaxed);
        m.sqlite_ok.store(true, Ordering::Relaxed);
        m.tf_builder_ok.store(true, Ordering::Relaxed);
        m.indicator_ok.store(true, Ordering::Relaxed);

        // Market closed, everything up: healthy even with no ticks.
        assert_eq!(m.build_health(&[60]).status, HealthStatus::Healthy);

        // Market open with no feed: degraded.
        m.market_open.store(true, Ordering::Relaxed);
        assert_eq!(m.build_health(&[60]).status, HealthStatus::Degraded);

        // Fresh tick + connected feed: healthy again.
        m.ws_connected.store(true, Ordering::Relaxed);
        m.record_tick();
        assert_eq!(m.build_health(&[60]).status, HealthStatus::Healthy);

        // Primary store down: unhealthy regardless of the rest.
        m.redis_ok.store(false, Ordering::Relaxed);
        assert_eq!(m.build_health(&[60]).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn f64_gauges_round_trip() {
        let m = PipelineMetrics::new();
        PipelineMetrics::set_f64(&m.indicator_latency_ewma_us, 123.45);
        assert!((PipelineMetrics::get_f64(&m.indicator_latency_ewma_us) - 123.45).abs() < 1e-12);
    }
}
