// =============================================================================
// Durable Store Writer — Redis streams, latest keys, pub/sub + SQLite sibling
// =============================================================================
//
// Persistence rules per record kind:
//
//   Candle1s           XADD (MAXLEN ~ 3h) + SET latest EX 30m + PUBLISH
//   TfCandle final     XADD (MAXLEN ~ proportional) + SET latest + PUBLISH
//   TfCandle forming   PUBLISH only
//   IndicatorResult    ready && !live -> XADD + SET latest + PUBLISH
//                      live           -> PUBLISH only
//                      (whole processing-step batch in one pipeline)
//
// Every Redis round-trip goes through the circuit breaker. While the circuit
// is open, operations are parked and the caller sees `CircuitOpen`; the
// close transition replays the parked queue through this same writer in the
// background. Finalized candles are also mirrored into the embedded SQLite
// tables; a SQLite failure is logged but never blocks the hot path.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::{debug, warn};

use super::circuit_breaker::{Admission, CircuitBreaker};
use super::keys;
use super::sqlite::SqliteStore;
use crate::metrics::PipelineMetrics;
use crate::types::{Candle1s, IndicatorResult, TfCandle};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The circuit is open; the operation was parked for replay.
    #[error("circuit open, write buffered")]
    CircuitOpen,
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// One parked or executing write operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Candle1s(Candle1s),
    TfFinalized(TfCandle),
    TfForming(TfCandle),
    Indicators(Vec<IndicatorResult>),
}

#[derive(Clone)]
pub struct CandleWriter {
    conn: ConnectionManager,
    breaker: Arc<CircuitBreaker<WriteOp>>,
    sqlite: SqliteStore,
    metrics: Arc<PipelineMetrics>,
}

impl CandleWriter {
    pub fn new(
        conn: ConnectionManager,
        breaker: Arc<CircuitBreaker<WriteOp>>,
        sqlite: SqliteStore,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            conn,
            breaker,
            sqlite,
            metrics,
        }
    }

    // ── Public write surface ────────────────────────────────────────────

    pub async fn write_candle_1s(&self, candle: Candle1s) -> Result<(), StoreError> {
        if let Err(e) = self.sqlite.insert_candle_1s(&candle).await {
            warn!(error = %e, "sqlite 1s candle insert failed");
        }
        self.submit(WriteOp::Candle1s(candle)).await
    }

    pub async fn write_tf_candle(&self, candle: TfCandle) -> Result<(), StoreError> {
        if candle.forming {
            return self.submit(WriteOp::TfForming(candle)).await;
        }
        if let Err(e) = self.sqlite.insert_tf_candle(&candle).await {
            warn!(error = %e, "sqlite TF candle insert failed");
        }
        self.submit(WriteOp::TfFinalized(candle)).await
    }

    /// Persist one processing step's results as a single pipelined
    /// round-trip.
    pub async fn write_indicators(&self, batch: Vec<IndicatorResult>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.submit(WriteOp::Indicators(batch)).await
    }

    // ── Breaker-mediated execution ──────────────────────────────────────

    fn submit(&self, op: WriteOp) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            match self.breaker.admit(op) {
                Admission::Execute(op) => {
                    let started = std::time::Instant::now();
                    match self.execute(&op).await {
                        Ok(()) => {
                            self.metrics
                                .redis_write
                                .record_ms(started.elapsed().as_secs_f64() * 1000.0);
                            let drained = self.breaker.on_success();
                            if !drained.is_empty() {
                                let writer = self.clone();
                                tokio::spawn(async move { writer.replay(drained).await });
                            }
                            Ok(())
                        }
                        Err(e) => {
                            self.breaker.on_failure();
                            Err(e)
                        }
                    }
                }
                Admission::Buffered => {
                    self.metrics.buffered_writes.fetch_add(1, Ordering::Relaxed);
                    Err(StoreError::CircuitOpen)
                }
            }
        })
    }

    /// Drain parked writes through the normal submit path so renewed
    /// failures re-park them instead of being lost.
    async fn replay(&self, ops: Vec<WriteOp>) {
        let total = ops.len();
        let mut replayed = 0usize;
        for op in ops {
            match self.submit(op).await {
                Ok(()) => replayed += 1,
                Err(StoreError::CircuitOpen) => {}
                Err(e) => warn!(error = %e, "buffered write replay failed"),
            }
        }
        debug!(replayed, total, "buffered write replay finished");
    }

    async fn execute(&self, op: &WriteOp) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        append_op(&mut pipe, op)?;
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

// =============================================================================
// Pipeline assembly
// =============================================================================

/// Append the Redis commands for one write operation to a pipeline.
fn append_op(pipe: &mut redis::Pipeline, op: &WriteOp) -> Result<(), serde_json::Error> {
    match op {
        WriteOp::Candle1s(c) => {
            let key = c.instrument_key();
            let json = serde_json::to_string(c)?;
            pipe.cmd("XADD")
                .arg(keys::stream_1s(&key))
                .arg("MAXLEN")
                .arg("~")
                .arg(keys::STREAM_1S_MAXLEN)
                .arg("*")
                .arg(keys::PAYLOAD_FIELD)
                .arg(&json)
                .ignore();
            pipe.cmd("SET")
                .arg(keys::latest_1s(&key))
                .arg(&json)
                .arg("EX")
                .arg(keys::LATEST_TTL_SECS)
                .ignore();
            pipe.cmd("PUBLISH")
                .arg(keys::channel_1s(&key))
                .arg(&json)
                .ignore();
        }
        WriteOp::TfFinalized(c) => {
            let key = c.instrument_key();
            let json = serde_json::to_string(c)?;
            pipe.cmd("XADD")
                .arg(keys::stream_tf(c.tf, &key))
                .arg("MAXLEN")
                .arg("~")
                .arg(keys::tf_stream_maxlen(c.tf))
                .arg("*")
                .arg(keys::PAYLOAD_FIELD)
                .arg(&json)
                .ignore();
            pipe.cmd("SET")
                .arg(keys::latest_tf(c.tf, &key))
                .arg(&json)
                .arg("EX")
                .arg(keys::LATEST_TTL_SECS)
                .ignore();
            pipe.cmd("PUBLISH")
                .arg(keys::channel_tf(c.tf, &key))
                .arg(&json)
                .ignore();
        }
        WriteOp::TfForming(c) => {
            let key = c.instrument_key();
            let json = serde_json::to_string(c)?;
            pipe.cmd("PUBLISH")
                .arg(keys::channel_tf(c.tf, &key))
                .arg(&json)
                .ignore();
        }
        WriteOp::Indicators(batch) => {
            for r in batch {
                let key = r.instrument_key();
                let json = serde_json::to_string(r)?;
                if r.live {
                    pipe.cmd("PUBLISH")
                        .arg(keys::channel_indicator(&r.name, r.tf, &key))
                        .arg(&json)
                        .ignore();
                } else if r.ready {
                    pipe.cmd("XADD")
                        .arg(keys::stream_indicator(&r.name, r.tf, &key))
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(keys::tf_stream_maxlen(r.tf))
                        .arg("*")
                        .arg(keys::PAYLOAD_FIELD)
                        .arg(&json)
                        .ignore();
                    pipe.cmd("SET")
                        .arg(keys::latest_indicator(&r.name, r.tf, &key))
                        .arg(&json)
                        .arg("EX")
                        .arg(keys::LATEST_TTL_SECS)
                        .ignore();
                    pipe.cmd("PUBLISH")
                        .arg(keys::channel_indicator(&r.name, r.tf, &key))
                        .arg(&json)
                        .ignore();
                }
                // Not ready and not live: nothing worth persisting yet.
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle_1s() -> Candle1s {
        Candle1s {
            token: "3045".into(),
            exchange: "NSE".into(),
            ts: 1_700_000_000,
            open: 100_00,
            high: 100_50,
            low: 99_50,
            close: 100_25,
            volume: 42,
            ticks_count: 4,
        }
    }

    fn result(ready: bool, live: bool) -> IndicatorResult {
        IndicatorResult {
            name: "SMA_20".into(),
            token: "3045".into(),
            exchange: "NSE".into(),
            tf: 60,
            value: 101.25,
            ts: 1_700_000_040,
            ready,
            live,
        }
    }

    fn command_count(op: &WriteOp) -> usize {
        let mut pipe = redis::pipe();
        append_op(&mut pipe, op).unwrap();
        pipe.cmd_iter().count()
    }

    #[test]
    fn candle_1s_writes_stream_latest_publish() {
        assert_eq!(command_count(&WriteOp::Candle1s(candle_1s())), 3);
    }

    #[test]
    fn finalized_tf_writes_stream_latest_publish() {
        let tf = TfCandle::open_from_1s(&candle_1s(), 60, 1_699_999_980);
        let mut done = tf.clone();
        done.forming = false;
        assert_eq!(command_count(&WriteOp::TfFinalized(done)), 3);
    }

    #[test]
    fn forming_tf_publishes_only() {
        let tf = TfCandle::open_from_1s(&candle_1s(), 60, 1_699_999_980);
        assert_eq!(command_count(&WriteOp::TfForming(tf)), 1);
    }

    #[test]
    fn indicator_batch_routes_by_flags() {
        // ready history row: stream + latest + publish = 3
        assert_eq!(
            command_count(&WriteOp::Indicators(vec![result(true, false)])),
            3
        );
        // live preview: publish only = 1
        assert_eq!(
            command_count(&WriteOp::Indicators(vec![result(true, true)])),
            1
        );
        // warming up: nothing
        assert_eq!(
            command_count(&WriteOp::Indicators(vec![result(false, false)])),
            0
        );
        // one batch, one pipeline
        assert_eq!(
            command_count(&WriteOp::Indicators(vec![
                result(true, false),
                result(true, true),
                result(false, false),
            ])),
            4
        );
    }
}
