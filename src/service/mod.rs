// =============================================================================
// Indicator Service — restore, backfill, live compute, checkpoint, reconfigure
// =============================================================================
//
// Startup protocol, in order:
//   1. Restore the latest engine snapshot (Redis KV first, then the embedded
//      table; cold start when neither parses).
//   2. Compute the stream set from the engine's timeframes x instruments.
//   3. Warmup backfill: replay each stream from the snapshot's stored
//      position (or from the beginning when unknown), processing every
//      finalized candle and writing the results. This both hydrates cold
//      indicators and catches the post-snapshot delta without
//      double-processing anything already reflected in the snapshot.
//   4. Position the consumer group exactly where the replay ended, then
//      surface any still-pending entries.
//   5. Start the background loops: live group consume, PEL reclaimer, live
//      1s pub/sub -> forming synthesis for peeks, reconfigure listener, and
//      the periodic dual-store checkpointer.
//
// Shutdown takes a final snapshot and writes it to both stores under a
// short deadline before returning.
// =============================================================================

pub mod forming;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TF_QUEUE_CAPACITY;
use crate::indicators::{EngineSnapshot, IndicatorEngine, ReloadStats, TfIndicatorConfig};
use crate::metrics::PipelineMetrics;
use crate::store::keys;
use crate::store::redis_writer::StoreError;
use crate::store::snapshot::SnapshotStore;
use crate::store::{CandleWriter, StreamConsumer, StreamEntry};
use crate::types::{Candle1s, InstrumentKey, TfCandle};

use forming::FormingSynth;

/// EWMA smoothing factor for the compute-latency gauge.
const LATENCY_EWMA_ALPHA: f64 = 0.2;
/// Minimum interval between gauge publications.
const LATENCY_PUBLISH_EVERY: Duration = Duration::from_secs(2);
/// Aggregate deadline for the shutdown snapshot writes.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// One unit of work for the processing loop.
enum ProcessItem {
    /// A finalized candle delivered (or reclaimed/recovered) from a durable
    /// stream; carries its stream position for checkpointing.
    Durable(StreamEntry),
    /// A synthesized forming candle for a non-mutating peek.
    Forming(TfCandle),
}

pub struct IndicatorService {
    engine: Mutex<IndicatorEngine>,
    writer: CandleWriter,
    consumer: StreamConsumer,
    redis_client: redis::Client,
    kv_snapshots: Box<dyn SnapshotStore>,
    table_snapshots: Box<dyn SnapshotStore>,
    instruments: Vec<InstrumentKey>,
    snapshot_interval: Duration,
    pel_reclaim_interval: Duration,
    pel_min_idle_ms: u64,
    metrics: Arc<PipelineMetrics>,
    /// Last processed stream id per stream, persisted inside each snapshot.
    stream_ids: Mutex<HashMap<String, String>>,
}

impl IndicatorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: IndicatorEngine,
        writer: CandleWriter,
        consumer: StreamConsumer,
        redis_client: redis::Client,
        kv_snapshots: Box<dyn SnapshotStore>,
        table_snapshots: Box<dyn SnapshotStore>,
        instruments: Vec<InstrumentKey>,
        snapshot_interval: Duration,
        pel_reclaim_interval: Duration,
        pel_min_idle_ms: u64,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            writer,
            consumer,
            redis_client,
            kv_snapshots,
            table_snapshots,
            instruments,
            snapshot_interval,
            pel_reclaim_interval,
            pel_min_idle_ms,
            metrics,
            stream_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled_tfs(&self) -> Vec<u32> {
        self.engine.lock().enabled_tfs()
    }

    /// Expected durable stream names for the current (tfs x instruments).
    fn streams(&self) -> Vec<String> {
        let tfs = self.enabled_tfs();
        let mut names = Vec::with_capacity(tfs.len() * self.instruments.len());
        for tf in tfs {
            for inst in &self.instruments {
                names.push(keys::stream_tf(tf, inst));
            }
        }
        names
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        // 1. Restore.
        self.restore_from_snapshot().await;

        // 2–3. Backfill / delta replay.
        if let Err(e) = self.warmup_backfill().await {
            warn!(error = %e, "warmup backfill incomplete");
        }

        // 4. Group positioning + pending recovery.
        let streams = self.streams();
        for stream in &streams {
            let start = self
                .stream_ids
                .lock()
                .get(stream)
                .cloned()
                .unwrap_or_else(|| "0".to_string());
            if let Err(e) = self.consumer.ensure_group_from(stream, &start).await {
                warn!(stream = %stream, error = %e, "group positioning failed");
            }
        }

        let (proc_tx, proc_rx) = mpsc::channel::<ProcessItem>(TF_QUEUE_CAPACITY);

        let loop_svc = self.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move { loop_svc.process_loop(proc_rx, loop_cancel).await });

        let (entry_tx, mut entry_rx) = mpsc::channel::<StreamEntry>(TF_QUEUE_CAPACITY);
        let bridge_tx = proc_tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = entry_rx.recv().await {
                if bridge_tx.send(ProcessItem::Durable(entry)).await.is_err() {
                    return;
                }
            }
        });

        if let Err(e) = self.consumer.recover_pending(&streams, &entry_tx).await {
            warn!(error = %e, "pending recovery failed");
        }

        // 5. Background loops.
        tokio::spawn(self.consumer.clone().run_pel_reclaimer(
            streams.clone(),
            self.pel_reclaim_interval,
            self.pel_min_idle_ms,
            entry_tx.clone(),
            None,
            cancel.clone(),
        ));

        let live_consumer = self.consumer.clone();
        let live_cancel = cancel.clone();
        let live_streams = streams.clone();
        tokio::spawn(async move {
            if let Err(e) = live_consumer
                .consume(live_streams, entry_tx, live_cancel)
                .await
            {
                warn!(error = %e, "live stream consumer exited");
            }
        });

        let synth_svc = self.clone();
        let synth_tx = proc_tx.clone();
        let synth_cancel = cancel.clone();
        tokio::spawn(async move { synth_svc.run_forming_synth(synth_tx, synth_cancel).await });

        let cfg_svc = self.clone();
        let cfg_cancel = cancel.clone();
        tokio::spawn(async move { cfg_svc.run_config_listener(cfg_cancel).await });

        self.metrics.indicator_ok.store(true, Ordering::Relaxed);
        info!(streams = streams.len(), "indicator service live");

        // Checkpoint loop on this task.
        let mut ticker = interval(self.snapshot_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.checkpoint().await,
            }
        }

        // Final shutdown snapshot under a bounded deadline.
        match timeout(SHUTDOWN_DEADLINE, self.checkpoint()).await {
            Ok(()) => info!("shutdown snapshot written"),
            Err(_) => warn!("shutdown snapshot timed out"),
        }
        Ok(())
    }

    // ── Restore / backfill ──────────────────────────────────────────────

    async fn restore_from_snapshot(&self) {
        let sources: [(&str, &dyn SnapshotStore); 2] = [
            ("redis", self.kv_snapshots.as_ref()),
            ("sqlite", self.table_snapshots.as_ref()),
        ];

        for (name, store) in sources {
            let json = match store.read_latest_snapshot_json().await {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    warn!(source = name, error = %e, "snapshot source unavailable");
                    continue;
                }
            };
            match serde_json::from_str::<EngineSnapshot>(&json) {
                Ok(snap) => {
                    let restored = self.engine.lock().restore(&snap);
                    *self.stream_ids.lock() = snap.stream_id.clone();
                    info!(
                        source = name,
                        restored,
                        tokens = snap.tokens.len(),
                        "engine snapshot restored"
                    );
                    return;
                }
                Err(e) => {
                    warn!(source = name, error = %e, "snapshot corrupt, trying next source");
                }
            }
        }
        info!("no usable snapshot, cold start");
    }

    /// Replay every stream from its last known position (or the beginning)
    /// and fold the candles through the engine, persisting results.
    async fn warmup_backfill(&self) -> Result<()> {
        let streams = self.streams();
        let mut total = 0usize;

        for stream in &streams {
            let start = self
                .stream_ids
                .lock()
                .get(stream)
                .cloned()
                .unwrap_or_else(|| "0".to_string());

            let mut entries = Vec::new();
            match self
                .consumer
                .replay_from(stream, &start, |e| entries.push(e))
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    warn!(stream = %stream, error = %e, "backfill replay failed");
                    continue;
                }
            }

            for entry in entries {
                if entry.candle.forming {
                    continue;
                }
                let results = { self.engine.lock().process(&entry.candle) };
                self.stream_ids
                    .lock()
                    .insert(entry.stream.clone(), entry.id.clone());
                total += 1;
                self.write_results(results).await;
            }
        }

        info!(candles = total, "warmup backfill complete");
        Ok(())
    }

    // ── Processing ──────────────────────────────────────────────────────

    async fn process_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ProcessItem>, cancel: CancellationToken) {
        let mut ewma_us = 0.0f64;
        let mut last_publish = Instant::now();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let started = Instant::now();
            let results = match item {
                ProcessItem::Durable(entry) => {
                    let results = { self.engine.lock().process(&entry.candle) };
                    self.stream_ids
                        .lock()
                        .insert(entry.stream.clone(), entry.id.clone());

                    // End-to-end lag: bucket close to processed-now.
                    let bucket_end_ms = (entry.candle.ts + entry.candle.tf as i64) * 1000;
                    let lag_ms = chrono::Utc::now().timestamp_millis() - bucket_end_ms;
                    self.metrics.candle_lag_ms.store(lag_ms, Ordering::Relaxed);
                    self.metrics.end_to_end.record_ms(lag_ms.max(0) as f64);
                    results
                }
                ProcessItem::Forming(candle) => self.engine.lock().process_peek(&candle),
            };

            let elapsed_us = started.elapsed().as_secs_f64() * 1_000_000.0;
            self.metrics.indicator_compute.record_ms(elapsed_us / 1000.0);
            ewma_us = if ewma_us == 0.0 {
                elapsed_us
            } else {
                elapsed_us * LATENCY_EWMA_ALPHA + ewma_us * (1.0 - LATENCY_EWMA_ALPHA)
            };
            if last_publish.elapsed() >= LATENCY_PUBLISH_EVERY {
                PipelineMetrics::set_f64(&self.metrics.indicator_latency_ewma_us, ewma_us);
                last_publish = Instant::now();
            }

            self.write_results(results).await;
        }

        self.metrics.indicator_ok.store(false, Ordering::Relaxed);
        info!("indicator process loop stopped");
    }

    async fn write_results(&self, results: Vec<crate::types::IndicatorResult>) {
        if results.is_empty() {
            return;
        }
        match self.writer.write_indicators(results).await {
            Ok(()) => {}
            Err(StoreError::CircuitOpen) => {
                debug!("indicator batch buffered: circuit open");
            }
            Err(e) => warn!(error = %e, "indicator batch write failed"),
        }
    }

    // ── Hot reconfigure ─────────────────────────────────────────────────

    /// Validate and apply a new per-timeframe configuration. When new
    /// indicator instances were created, a warmup backfill brings them to
    /// ready-state in the background.
    pub fn reload(self: &Arc<Self>, configs: Vec<TfIndicatorConfig>) -> Result<ReloadStats> {
        IndicatorEngine::validate(&configs)?;
        let stats = self.engine.lock().reload_configs(configs)?;

        if stats.created > 0 {
            let svc = self.clone();
            tokio::spawn(async move {
                if let Err(e) = svc.warmup_backfill().await {
                    warn!(error = %e, "post-reload warmup backfill failed");
                }
            });
        }
        Ok(stats)
    }

    /// Pub/sub reconfigure listener: flat `TYPE:PERIOD,…` payloads applied
    /// across every currently enabled timeframe.
    async fn run_config_listener(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let pubsub = match self.redis_client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(e) => {
                    warn!(error = %e, "config listener connect failed, retrying in 5s");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };
            let mut pubsub = pubsub;
            if let Err(e) = pubsub.subscribe(keys::CONFIG_CHANNEL).await {
                warn!(error = %e, "config channel subscribe failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            info!(channel = keys::CONFIG_CHANNEL, "config listener subscribed");

            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break, // connection dropped; reconnect
                    },
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "unreadable config payload");
                        continue;
                    }
                };
                Self::apply_broadcast(&self, &payload);
            }
        }
    }

    fn apply_broadcast(self: &Arc<Self>, payload: &str) {
        let specs = match crate::indicators::parse_spec_list(payload) {
            Ok(specs) if !specs.is_empty() => specs,
            Ok(_) => {
                warn!("config broadcast was empty, ignoring");
                return;
            }
            Err(e) => {
                warn!(error = %e, payload, "invalid config broadcast rejected");
                return;
            }
        };

        let configs: Vec<TfIndicatorConfig> = self
            .enabled_tfs()
            .into_iter()
            .map(|tf| TfIndicatorConfig {
                tf,
                indicators: specs.clone(),
            })
            .collect();

        // Same path as the HTTP surface, including the post-reload warmup.
        match self.reload(configs) {
            Ok(stats) => info!(
                preserved = stats.preserved,
                created = stats.created,
                "broadcast reconfigure applied"
            ),
            Err(e) => warn!(error = %e, "broadcast reconfigure rejected"),
        }
    }

    // ── Live peek synthesis ─────────────────────────────────────────────

    /// Subscribe to the live 1s candle channels and synthesize transient
    /// forming TF candles for `ProcessPeek`.
    async fn run_forming_synth(
        self: Arc<Self>,
        proc_tx: mpsc::Sender<ProcessItem>,
        cancel: CancellationToken,
    ) {
        let mut synth = FormingSynth::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let pubsub = match self.redis_client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(e) => {
                    warn!(error = %e, "1s pub/sub connect failed, retrying in 5s");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };
            let mut pubsub = pubsub;
            if let Err(e) = pubsub.psubscribe(keys::channel_1s_pattern()).await {
                warn!(error = %e, "1s channel psubscribe failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            info!(pattern = keys::channel_1s_pattern(), "live 1s subscriber started");

            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let candle: Candle1s = match serde_json::from_str(&payload) {
                    Ok(c) => c,
                    Err(_) => {
                        self.metrics.bad_payloads.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                let tfs = self.enabled_tfs();
                for forming in synth.on_1s(&candle, &tfs) {
                    // Previews are droppable under pressure.
                    let _ = proc_tx.try_send(ProcessItem::Forming(forming));
                }
            }
        }
    }

    // ── Checkpointing ───────────────────────────────────────────────────

    pub async fn checkpoint(&self) {
        let snapshot = {
            let ids = self.stream_ids.lock().clone();
            self.engine.lock().snapshot(ids)
        };
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "snapshot serialization failed");
                return;
            }
        };

        if let Err(e) = self.kv_snapshots.save_snapshot_json(&json).await {
            warn!(error = %e, "KV snapshot write failed");
        }
        if let Err(e) = self.table_snapshots.save_snapshot_json(&json).await {
            warn!(error = %e, "table snapshot write failed");
        }
        debug!(tokens = snapshot.tokens.len(), "engine checkpoint written");
    }
}

impl crate::api::ReloadTarget for Arc<IndicatorService> {
    fn reload(&self, configs: Vec<TfIndicatorConfig>) -> Result<ReloadStats> {
        IndicatorService::reload(self, configs)
    }

    fn enabled_tfs(&self) -> Vec<u32> {
        IndicatorService::enabled_tfs(self)
    }
}
