// =============================================================================
// Durable storage layer — Redis hot path, SQLite sibling, snapshots
// =============================================================================

pub mod circuit_breaker;
pub mod keys;
pub mod redis_consumer;
pub mod redis_writer;
pub mod snapshot;
pub mod sqlite;

pub use circuit_breaker::{Admission, BreakerState, CircuitBreaker};
pub use redis_consumer::{StreamConsumer, StreamEntry};
pub use redis_writer::{CandleWriter, StoreError, WriteOp};
pub use snapshot::{RedisSnapshotStore, SnapshotStore, SqliteSnapshotStore};
pub use sqlite::SqliteStore;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::time::{interval, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::PipelineMetrics;

/// Liveness probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Per-ping deadline.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodically ping both stores and publish connectivity + latency facts
/// into the metrics registry. Feeds the health document.
pub async fn run_store_prober(
    conn: ConnectionManager,
    sqlite: SqliteStore,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    info!("store liveness prober started");
    let mut ticker = interval(PROBE_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("store liveness prober stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        // Redis PING.
        let started = Instant::now();
        let mut c = conn.clone();
        let pong = timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async::<_, String>(&mut c),
        )
        .await;
        match pong {
            Ok(Ok(_)) => {
                metrics.redis_ok.store(true, Ordering::Relaxed);
                PipelineMetrics::set_f64(
                    &metrics.redis_ping_ms,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
            Ok(Err(e)) => {
                metrics.redis_ok.store(false, Ordering::Relaxed);
                warn!(error = %e, "redis ping failed");
            }
            Err(_) => {
                metrics.redis_ok.store(false, Ordering::Relaxed);
                warn!("redis ping timed out");
            }
        }

        // SQLite SELECT 1.
        let started = Instant::now();
        match timeout(PING_TIMEOUT, sqlite.ping()).await {
            Ok(Ok(())) => {
                metrics.sqlite_ok.store(true, Ordering::Relaxed);
                PipelineMetrics::set_f64(
                    &metrics.sqlite_ping_ms,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
            Ok(Err(e)) => {
                metrics.sqlite_ok.store(false, Ordering::Relaxed);
                warn!(error = %e, "sqlite ping failed");
            }
            Err(_) => {
                metrics.sqlite_ok.store(false, Ordering::Relaxed);
                warn!("sqlite ping timed out");
            }
        }
    }
}
