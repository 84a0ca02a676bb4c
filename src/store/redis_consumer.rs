// =============================================================================
// Durable Stream Consumer — consumer groups, PEL recovery, range replay
// =============================================================================
//
// At-least-once consumption of finalized TF candle streams:
//
//   * `ensure_group` creates the named group at `$` (new messages only) on
//     every stream, idempotently.
//   * `consume` reads batches of up to 100 entries with a 2 s block and acks
//     an entry only after it has been handed to the processing channel.
//     Unparseable payloads are acked and dropped — no poison pills.
//   * `recover_pending` replays this consumer's own pending entries (the
//     ones delivered before a crash but never acked).
//   * `reclaim_stale` claims other consumers' pending entries once they have
//     been idle long enough; the periodic reclaimer reinjects them.
//   * `replay_from` walks a stream strictly after a known id for backfill.
//
// Consumer identity is unique per process so a restarted instance claims its
// predecessor's pending entries via the reclaim path rather than colliding.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::keys;
use crate::metrics::PipelineMetrics;
use crate::types::TfCandle;

/// Entries read per stream per round-trip.
const READ_BATCH: usize = 100;
/// Blocking read timeout, milliseconds.
const READ_BLOCK_MS: usize = 2_000;
/// Entries claimed per reclaim round-trip.
const RECLAIM_BATCH: usize = 100;

/// One delivered stream entry, parsed and still pending until acked.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub candle: TfCandle,
}

/// Callback invoked with the number of entries reclaimed in one pass.
pub type ReclaimHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Clone)]
pub struct StreamConsumer {
    conn: ConnectionManager,
    group: String,
    consumer: String,
    metrics: Arc<PipelineMetrics>,
}

impl StreamConsumer {
    pub fn new(conn: ConnectionManager, group: impl Into<String>, metrics: Arc<PipelineMetrics>) -> Self {
        let consumer = format!("amc-{}", uuid::Uuid::new_v4());
        Self {
            conn,
            group: group.into(),
            consumer,
            metrics,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    // ── Group management ────────────────────────────────────────────────

    /// Idempotently create the consumer group at `$` on every stream.
    pub async fn ensure_group(&self, streams: &[String]) -> Result<()> {
        let mut conn = self.conn.clone();
        for stream in streams {
            let created: redis::RedisResult<()> = conn
                .xgroup_create_mkstream(stream, &self.group, "$")
                .await;
            match created {
                Ok(()) => debug!(stream = %stream, group = %self.group, "consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(e).with_context(|| format!("creating group on {stream}")),
            }
        }
        Ok(())
    }

    /// Position the group's last-delivered marker on one stream (used after
    /// snapshot restore so live delivery starts where the snapshot left
    /// off).
    pub async fn ensure_group_from(&self, stream: &str, start_id: &str) -> Result<()> {
        self.ensure_group(&[stream.to_string()]).await?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("XGROUP")
            .arg("SETID")
            .arg(stream)
            .arg(&self.group)
            .arg(start_id)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("XGROUP SETID on {stream}"))?;
        info!(stream = %stream, start_id = %start_id, "group position set");
        Ok(())
    }

    // ── Live consumption ────────────────────────────────────────────────

    /// Blocking consume loop: read, parse, hand off, then ack. Returns when
    /// cancelled or when the processing channel closes.
    pub async fn consume(
        &self,
        streams: Vec<String>,
        out: mpsc::Sender<StreamEntry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if streams.is_empty() {
            cancel.cancelled().await;
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH)
            .block(READ_BLOCK_MS);

        info!(streams = streams.len(), consumer = %self.consumer, "live stream consume started");
        loop {
            let reply: StreamReadReply = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = conn.xread_options(&streams, &ids, &opts) => match r {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(error = %e, "stream read failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            for key in reply.keys {
                for entry in key.ids {
                    self.deliver(&key.key, entry, &out, &cancel).await?;
                }
            }
        }
    }

    /// Replay this consumer's own pending entries (delivered but unacked in
    /// a previous life of this consumer name, or re-read after a hand-off
    /// failure). Returns the number of entries surfaced.
    pub async fn recover_pending(
        &self,
        streams: &[String],
        out: &mpsc::Sender<StreamEntry>,
    ) -> Result<usize> {
        if streams.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let cancel = CancellationToken::new();
        let mut recovered = 0usize;

        loop {
            let ids: Vec<&str> = streams.iter().map(|_| "0").collect();
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(READ_BATCH);
            let reply: StreamReadReply = conn
                .xread_options(streams, &ids, &opts)
                .await
                .context("reading own pending entries")?;

            let mut batch = 0usize;
            for key in reply.keys {
                for entry in key.ids {
                    batch += 1;
                    self.deliver(&key.key, entry, out, &cancel).await?;
                }
            }
            recovered += batch;
            if batch == 0 {
                break;
            }
        }

        if recovered > 0 {
            info!(recovered, "pending entries recovered");
        }
        Ok(recovered)
    }

    async fn deliver(
        &self,
        stream: &str,
        entry: StreamId,
        out: &mpsc::Sender<StreamEntry>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = entry.id.clone();
        match parse_entry(stream, &entry) {
            Some(parsed) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = out.send(parsed) => {
                        if sent.is_err() {
                            anyhow::bail!("processing channel closed");
                        }
                    }
                }
                // Ack strictly after the hand-off so a crash in between
                // leaves the entry pending for recovery.
                self.ack(stream, &id).await;
            }
            None => {
                self.metrics.bad_payloads.fetch_add(1, Ordering::Relaxed);
                warn!(stream = %stream, id = %id, "bad stream payload acked and dropped");
                self.ack(stream, &id).await;
            }
        }
        Ok(())
    }

    pub async fn ack(&self, stream: &str, id: &str) {
        let mut conn = self.conn.clone();
        let acked: redis::RedisResult<i64> = conn.xack(stream, &self.group, &[id]).await;
        if let Err(e) = acked {
            warn!(stream = %stream, id = %id, error = %e, "ack failed");
        }
    }

    // ── Stale-PEL reclaim ───────────────────────────────────────────────

    /// Claim entries pending on other consumers for at least `min_idle_ms`.
    /// Returned entries are owned by this consumer and still unacked.
    pub async fn reclaim_stale(
        &self,
        stream: &str,
        min_idle_ms: u64,
        batch: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();

        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(stream, &self.group, "-", "+", batch)
            .await
            .with_context(|| format!("XPENDING on {stream}"))?;

        let stale_ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.consumer != self.consumer && p.last_delivered_ms >= min_idle_ms as usize)
            .map(|p| p.id.clone())
            .collect();
        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: redis::streams::StreamClaimReply = conn
            .xclaim(stream, &self.group, &self.consumer, min_idle_ms as usize, &stale_ids)
            .await
            .with_context(|| format!("XCLAIM on {stream}"))?;

        let entries: Vec<StreamEntry> = claimed
            .ids
            .iter()
            .filter_map(|e| parse_entry(stream, e))
            .collect();

        self.metrics
            .pel_reclaimed
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(entries)
    }

    /// Periodic reclaim pass over every stream, reinjecting claimed entries
    /// into the processing channel.
    pub async fn run_pel_reclaimer(
        self,
        streams: Vec<String>,
        every: Duration,
        min_idle_ms: u64,
        out: mpsc::Sender<StreamEntry>,
        on_reclaim: Option<ReclaimHook>,
        cancel: CancellationToken,
    ) {
        info!(
            interval_secs = every.as_secs(),
            min_idle_ms, "PEL reclaimer started"
        );
        let mut ticker = interval(every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("PEL reclaimer stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let mut claimed_total = 0usize;
            for stream in &streams {
                let entries = match self.reclaim_stale(stream, min_idle_ms, RECLAIM_BATCH).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(stream = %stream, error = %e, "reclaim pass failed");
                        continue;
                    }
                };
                for entry in entries {
                    claimed_total += 1;
                    let (stream_name, id) = (entry.stream.clone(), entry.id.clone());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = out.send(entry) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    self.ack(&stream_name, &id).await;
                }
            }

            if claimed_total > 0 {
                info!(claimed = claimed_total, "reclaimed stale pending entries");
                if let Some(hook) = &on_reclaim {
                    hook(claimed_total);
                }
            }
        }
    }

    // ── Historical replay ───────────────────────────────────────────────

    /// Walk all entries strictly after `start_id` ("0" replays the whole
    /// stream), invoking `handler` in order. Returns the entry count.
    pub async fn replay_from(
        &self,
        stream: &str,
        start_id: &str,
        mut handler: impl FnMut(StreamEntry),
    ) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut start = if start_id == "0" {
            "-".to_string()
        } else {
            format!("({start_id}")
        };
        let mut total = 0usize;

        loop {
            let reply: redis::streams::StreamRangeReply = conn
                .xrange_count(stream, &start, "+", READ_BATCH)
                .await
                .with_context(|| format!("XRANGE on {stream}"))?;
            let batch = reply.ids.len();
            if batch == 0 {
                break;
            }

            for entry in &reply.ids {
                match parse_entry(stream, entry) {
                    Some(parsed) => handler(parsed),
                    None => {
                        self.metrics.bad_payloads.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            total += batch;
            start = format!(
                "({}",
                reply.ids.last().expect("non-empty batch checked").id
            );
            if batch < READ_BATCH {
                break;
            }
        }
        Ok(total)
    }

    /// Filter a candidate stream name set down to the ones that exist.
    pub async fn discover_streams(&self, candidates: Vec<String>) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut present = Vec::new();
        for name in candidates {
            let exists: bool = conn
                .exists(&name)
                .await
                .with_context(|| format!("EXISTS on {name}"))?;
            if exists {
                present.push(name);
            }
        }
        Ok(present)
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

/// Extract and parse the JSON `data` field of one stream entry.
fn parse_entry(stream: &str, entry: &StreamId) -> Option<StreamEntry> {
    let raw = entry.map.get(keys::PAYLOAD_FIELD)?;
    let json: String = redis::from_redis_value(raw).ok()?;
    let candle: TfCandle = serde_json::from_str(&json).ok()?;
    Some(StreamEntry {
        stream: stream.to_string(),
        id: entry.id.clone(),
        candle,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw_entry(id: &str, field: &str, payload: &str) -> StreamId {
        let mut map = HashMap::new();
        map.insert(field.to_string(), redis::Value::Data(payload.as_bytes().to_vec()));
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn parses_well_formed_payload() {
        let json = r#"{"token":"3045","exchange":"NSE","ts":1700000040,"open":10000,
            "high":10050,"low":9950,"close":10025,"volume":42,"ticks_count":4,
            "tf":60,"count":60,"forming":false}"#;
        let entry = raw_entry("1700000040000-0", keys::PAYLOAD_FIELD, json);
        let parsed = parse_entry("candle:60s:NSE:3045", &entry).expect("parse");

        assert_eq!(parsed.stream, "candle:60s:NSE:3045");
        assert_eq!(parsed.id, "1700000040000-0");
        assert_eq!(parsed.candle.tf, 60);
        assert_eq!(parsed.candle.close, 10025);
        assert!(!parsed.candle.forming);
    }

    #[test]
    fn rejects_malformed_payload() {
        let entry = raw_entry("1-0", keys::PAYLOAD_FIELD, "{not json");
        assert!(parse_entry("candle:60s:NSE:3045", &entry).is_none());
    }

    #[test]
    fn rejects_missing_data_field() {
        let entry = raw_entry("1-0", "other", "{}");
        assert!(parse_entry("candle:60s:NSE:3045", &entry).is_none());
    }

    #[test]
    fn consumer_names_are_unique_per_instance() {
        // Uniqueness is what lets a restarted process reclaim its
        // predecessor's pending entries instead of silently sharing them.
        let a = format!("amc-{}", uuid::Uuid::new_v4());
        let b = format!("amc-{}", uuid::Uuid::new_v4());
        assert_ne!(a, b);
    }
}
