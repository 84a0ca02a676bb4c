// =============================================================================
// WebSocket Tick Ingress — upstream feed into the SPSC ring
// =============================================================================
//
// One connection at a time pushes parsed ticks into the aggregator's ring.
// A full ring drops the tick and bumps a counter — the feed never blocks on
// a slow consumer. Malformed messages are dropped silently (debug-logged);
// ping/pong/binary frames are ignored.
//
// `run_feed_loop` wraps a single connection with the reconnect-after-5s
// pattern used for every long-lived stream in this codebase; the session
// controller instead drives `run_feed_connection` directly under its own
// deadline.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::PipelineMetrics;
use crate::ring::Producer;
use crate::types::Tick;

/// Callback observing every admitted tick (close detection).
pub type TickObserver = Arc<dyn Fn(&Tick) + Send + Sync>;

/// Wire shape of an upstream tick message. `tick_ts` is optional on the
/// wire; the ingress stamps receipt time when it is absent.
#[derive(Debug, Deserialize)]
struct RawTick {
    token: String,
    exchange: String,
    price: i64,
    qty: i64,
    #[serde(default)]
    tick_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    event_ts: Option<DateTime<Utc>>,
}

fn parse_tick(text: &str) -> Option<Tick> {
    let raw: RawTick = serde_json::from_str(text).ok()?;
    Some(Tick {
        token: raw.token,
        exchange: raw.exchange,
        price: raw.price,
        qty: raw.qty,
        tick_ts: raw.tick_ts.unwrap_or_else(Utc::now),
        event_ts: raw.event_ts,
    })
}

/// Run a single WebSocket connection until it ends, errors, or is
/// cancelled.
pub async fn run_feed_connection(
    url: &str,
    producer: &Producer<Tick>,
    metrics: &Arc<PipelineMetrics>,
    observer: Option<&TickObserver>,
    cancel: &CancellationToken,
) -> Result<()> {
    info!(url = %redact_token(url), "connecting tick WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect tick WebSocket")?;
    info!("tick WebSocket connected");
    metrics.ws_connected.store(true, Ordering::Relaxed);

    let (_write, mut read) = ws_stream.split();

    let result = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = read.next() => msg,
        };

        match message {
            Some(Ok(Message::Text(text))) => match parse_tick(&text) {
                Some(tick) => {
                    if let Some(obs) = observer {
                        obs(&tick);
                    }
                    if producer.push(tick).is_err() {
                        metrics.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    debug!("malformed tick dropped");
                }
            },
            Some(Ok(_)) => {
                // Ping/pong/binary/close frames: tungstenite answers pings
                // itself.
            }
            Some(Err(e)) => {
                error!(error = %e, "tick WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!("tick WebSocket stream ended");
                break Ok(());
            }
        }
    };

    metrics.ws_connected.store(false, Ordering::Relaxed);
    result
}

/// Reconnecting ingress loop: used directly for the staging simulator and
/// by any caller that wants the feed up for as long as the token lives.
pub async fn run_feed_loop(
    url: &str,
    producer: &Producer<Tick>,
    metrics: &Arc<PipelineMetrics>,
    observer: Option<TickObserver>,
    cancel: CancellationToken,
) {
    let mut first = true;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if !first {
            metrics.ws_reconnects.fetch_add(1, Ordering::Relaxed);
        }
        first = false;

        if let Err(e) =
            run_feed_connection(url, producer, metrics, observer.as_ref(), &cancel).await
        {
            error!(error = %e, "tick feed error — reconnecting in 5s");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
        }
    }
}

/// Strip query parameters (session tokens) before logging a feed URL.
fn redact_token(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_tick() {
        let json = r#"{"token":"3045","exchange":"NSE","price":50000,"qty":10,
            "tick_ts":"2026-02-02T04:30:01.250Z","event_ts":"2026-02-02T04:30:01.100Z"}"#;
        let tick = parse_tick(json).expect("parse");
        assert_eq!(tick.token, "3045");
        assert_eq!(tick.price, 50_000);
        assert!(tick.event_ts.is_some());
        assert_eq!(tick.canonical_ts(), tick.event_ts.unwrap());
    }

    #[test]
    fn stamps_receipt_time_when_tick_ts_missing() {
        let json = r#"{"token":"3045","exchange":"NSE","price":50000,"qty":10}"#;
        let before = Utc::now();
        let tick = parse_tick(json).expect("parse");
        assert!(tick.tick_ts >= before);
        assert!(tick.event_ts.is_none());
    }

    #[test]
    fn malformed_tick_is_dropped() {
        assert!(parse_tick("{oops").is_none());
        assert!(parse_tick(r#"{"token":"3045"}"#).is_none());
        assert!(parse_tick(r#"{"token":"3045","exchange":"NSE","price":"high","qty":1}"#).is_none());
    }

    #[test]
    fn redacts_session_token_from_urls() {
        assert_eq!(
            redact_token("wss://feed.example.com/ticks?token=secret"),
            "wss://feed.example.com/ticks"
        );
        assert_eq!(redact_token("wss://feed.example.com/ticks"), "wss://feed.example.com/ticks");
    }
}
