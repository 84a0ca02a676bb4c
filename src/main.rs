// =============================================================================
// Aurora Market Data Core — Main Entry Point
// =============================================================================
//
// Wires the real-time pipeline:
//
//   ticks -> aggregator -> 1s candles -> fan-out -> { persist, TF builder }
//   TF candles -> { persist + publish } -> durable streams -> indicator
//   service -> indicator results -> persist + publish
//
// The primary store (Redis) and the embedded database must be reachable at
// startup; anything else degrades gracefully. A single cancellation token
// tears everything down on Ctrl+C, flushing forming candles and writing a
// final engine snapshot on the way out.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod config;
mod feed;
mod indicators;
mod metrics;
mod pipeline;
mod ring;
mod service;
mod session;
mod store;
mod types;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{AdminState, ReloadTarget};
use crate::config::{Config, CANDLE_QUEUE_CAPACITY, TF_QUEUE_CAPACITY, TICK_QUEUE_CAPACITY};
use crate::feed::LoginClient;
use crate::indicators::{IndicatorEngine, TfIndicatorConfig};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{aggregator, fanout, tf_builder, Aggregator, FanoutBus, TfBuilder};
use crate::service::IndicatorService;
use crate::session::SessionController;
use crate::store::redis_writer::StoreError;
use crate::store::{
    CandleWriter, CircuitBreaker, RedisSnapshotStore, SqliteSnapshotStore, SqliteStore,
    StreamConsumer,
};
use crate::types::Tick;

/// Consecutive write failures before the store circuit opens.
const BREAKER_MAX_FAILURES: u32 = 5;
/// Open-state hold before the half-open probe.
const BREAKER_RESET: Duration = Duration::from_secs(10);
/// Consumer group owning the TF candle streams.
const CONSUMER_GROUP: &str = "indicator-service";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Market Data Core — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::from_env().context("configuration error")?;
    config.log_effective();
    if config.instruments.is_empty() {
        warn!("SUBSCRIBE_TOKENS is empty — no instruments will be processed");
    }

    let metrics = Arc::new(PipelineMetrics::new());

    // ── 2. Stores (fatal when unreachable) ───────────────────────────────
    let sqlite = SqliteStore::open(&config.sqlite_path, metrics.clone())
        .context("fatal: opening embedded database")?;
    metrics.sqlite_ok.store(true, Ordering::Relaxed);

    let redis_client = redis::Client::open(config.redis_url.as_str())
        .context("fatal: invalid redis URL")?;
    let conn = ConnectionManager::new(redis_client.clone())
        .await
        .context("fatal: connecting to primary store")?;
    metrics.redis_ok.store(true, Ordering::Relaxed);
    info!(url = %config.redis_url, "primary store connected");

    let cancel = CancellationToken::new();

    // ── 3. Durable writer behind the circuit breaker ─────────────────────
    let breaker = Arc::new(CircuitBreaker::new(
        BREAKER_MAX_FAILURES,
        BREAKER_RESET,
        metrics.clone(),
    ));
    let writer = CandleWriter::new(conn.clone(), breaker, sqlite.clone(), metrics.clone());

    // ── 4. Tick -> 1s candle pipeline ────────────────────────────────────
    let (tick_tx, tick_rx) = ring::spsc::<Tick>(TICK_QUEUE_CAPACITY);
    let (candle_tx, candle_rx) = mpsc::channel(CANDLE_QUEUE_CAPACITY);
    let (flush_agg_tx, flush_agg_rx) = mpsc::channel(1);
    let (flush_tf_tx, flush_tf_rx) = mpsc::channel(1);

    let agg = Aggregator::new(config.reorder_buffer_ms, candle_tx, metrics.clone());
    tokio::spawn(aggregator::run_aggregator(
        agg,
        tick_rx,
        flush_agg_rx,
        cancel.clone(),
    ));

    // ── 5. Fan-out: persistence + TF building ────────────────────────────
    let bus = Arc::new(FanoutBus::new());
    let mut persist_rx = bus.subscribe("persist-1s", CANDLE_QUEUE_CAPACITY);
    let tf_input_rx = bus.subscribe("tf-builder", CANDLE_QUEUE_CAPACITY);
    tokio::spawn(fanout::run_fanout(bus.clone(), candle_rx, cancel.clone()));

    let persist_writer = writer.clone();
    tokio::spawn(async move {
        while let Some(candle) = persist_rx.recv().await {
            match persist_writer.write_candle_1s(candle).await {
                Ok(()) => {}
                Err(StoreError::CircuitOpen) => debug!("1s candle buffered: circuit open"),
                Err(e) => warn!(error = %e, "1s candle write failed"),
            }
        }
    });

    let (tf_out_tx, mut tf_out_rx) = mpsc::channel(TF_QUEUE_CAPACITY);
    let builder = TfBuilder::new(
        config.enabled_tfs.clone(),
        config.stale_tolerance_secs,
        tf_out_tx,
        metrics.clone(),
    );
    tokio::spawn(tf_builder::run_tf_builder(
        builder,
        tf_input_rx,
        flush_tf_rx,
        cancel.clone(),
    ));
    metrics.tf_builder_ok.store(true, Ordering::Relaxed);

    let tf_writer = writer.clone();
    tokio::spawn(async move {
        while let Some(candle) = tf_out_rx.recv().await {
            match tf_writer.write_tf_candle(candle).await {
                Ok(()) => {}
                Err(StoreError::CircuitOpen) => debug!("TF candle buffered: circuit open"),
                Err(e) => warn!(error = %e, "TF candle write failed"),
            }
        }
    });

    // ── 6. Store liveness prober ─────────────────────────────────────────
    tokio::spawn(store::run_store_prober(
        conn.clone(),
        sqlite.clone(),
        metrics.clone(),
        cancel.clone(),
    ));

    // ── 7. Indicator service ─────────────────────────────────────────────
    let engine_configs: Vec<TfIndicatorConfig> = config
        .enabled_tfs
        .iter()
        .map(|&tf| TfIndicatorConfig {
            tf,
            indicators: config.indicator_configs.clone(),
        })
        .collect();
    let engine = IndicatorEngine::new(engine_configs).context("indicator configuration")?;
    let consumer = StreamConsumer::new(conn.clone(), CONSUMER_GROUP, metrics.clone());

    let indicator_service = Arc::new(IndicatorService::new(
        engine,
        writer.clone(),
        consumer,
        redis_client.clone(),
        Box::new(RedisSnapshotStore::new(conn.clone(), config.snapshot_key.clone())),
        Box::new(SqliteSnapshotStore::new(sqlite.clone())),
        config.instruments.clone(),
        Duration::from_secs(config.snapshot_interval_secs),
        Duration::from_secs(config.pel_reclaim_interval_secs),
        config.pel_min_idle_ms,
        metrics.clone(),
    ));
    let service_handle = {
        let svc = indicator_service.clone();
        let svc_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.run(svc_cancel).await {
                error!(error = %e, "indicator service failed");
            }
        })
    };

    // ── 8. Admin API ─────────────────────────────────────────────────────
    let admin_state = Arc::new(AdminState {
        target: Arc::new(indicator_service.clone()) as Arc<dyn ReloadTarget>,
        metrics: metrics.clone(),
        fanout: bus.clone(),
    });
    let admin_cancel = cancel.clone();
    let admin_bind = config.metrics_bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::admin::run_admin_server(admin_bind, admin_state, admin_cancel).await {
            error!(error = %e, "admin API failed");
        }
    });

    // ── 9. Feed ingress: session-gated live, or staging simulator ────────
    if config.staging_mode {
        if config.simulator_url.is_empty() {
            warn!("STAGING_MODE set but SIMULATOR_URL is empty — no feed");
        } else {
            // The simulator runs around the clock; mark the market open so
            // health treats a silent feed as a problem.
            metrics.market_open.store(true, Ordering::Relaxed);
            let url = config.simulator_url.clone();
            let sim_metrics = metrics.clone();
            let sim_cancel = cancel.clone();
            tokio::spawn(async move {
                let producer = tick_tx;
                feed::run_feed_loop(&url, &producer, &sim_metrics, None, sim_cancel).await;
            });
            info!(url = %config.simulator_url, "staging mode: simulator feed attached");
        }
    } else {
        let controller = SessionController::new(
            config.session.clone(),
            LoginClient::new(config.upstream.clone()),
            metrics.clone(),
        );
        let ctrl_cancel = cancel.clone();
        let (ctrl_flush_agg, ctrl_flush_tf) = (flush_agg_tx.clone(), flush_tf_tx.clone());
        tokio::spawn(async move {
            controller
                .run(tick_tx, ctrl_flush_agg, ctrl_flush_tf, ctrl_cancel)
                .await;
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    cancel.cancel();

    // The indicator service writes its final snapshot under its own
    // deadline; give the teardown a bounded window overall.
    if tokio::time::timeout(Duration::from_secs(8), service_handle)
        .await
        .is_err()
    {
        warn!("indicator service did not stop in time");
    }

    info!("Aurora Market Data Core shut down complete.");
    Ok(())
}
