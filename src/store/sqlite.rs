// =============================================================================
// Embedded SQLite store — durable sibling of the Redis hot path
// =============================================================================
//
// Three tables: `candles_1s`, `candles_tf` (keyed by instrument/ts and
// instrument/tf/ts) and `indicator_snapshots` (pruned to the latest 10 rows
// after each insert). The connection runs in WAL mode and is owned by a
// mutex; every call crosses the async boundary through `spawn_blocking` so
// commits never stall the pipeline tasks.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::info;

use crate::metrics::PipelineMetrics;
use crate::types::{Candle1s, TfCandle};

/// Snapshot rows retained after pruning.
const SNAPSHOT_KEEP_ROWS: u32 = 10;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    metrics: Arc<PipelineMetrics>,
}

impl SqliteStore {
    /// Open (or create) the database. Failure here is fatal to startup.
    pub fn open(path: &str, metrics: Arc<PipelineMetrics>) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite database at `{path}`"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting synchronous pragma")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS candles_1s (
                exchange    TEXT NOT NULL,
                token       TEXT NOT NULL,
                ts          INTEGER NOT NULL,
                open        INTEGER NOT NULL,
                high        INTEGER NOT NULL,
                low         INTEGER NOT NULL,
                close       INTEGER NOT NULL,
                volume      INTEGER NOT NULL,
                ticks_count INTEGER NOT NULL,
                PRIMARY KEY (exchange, token, ts)
            );

            CREATE TABLE IF NOT EXISTS candles_tf (
                exchange    TEXT NOT NULL,
                token       TEXT NOT NULL,
                tf          INTEGER NOT NULL,
                ts          INTEGER NOT NULL,
                open        INTEGER NOT NULL,
                high        INTEGER NOT NULL,
                low         INTEGER NOT NULL,
                close       INTEGER NOT NULL,
                volume      INTEGER NOT NULL,
                ticks_count INTEGER NOT NULL,
                count_1s    INTEGER NOT NULL,
                PRIMARY KEY (exchange, token, tf, ts)
            );

            CREATE TABLE IF NOT EXISTS indicator_snapshots (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                data_json  TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .context("creating sqlite schema")?;

        info!(path, "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            metrics,
        })
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let metrics = self.metrics.clone();
        tokio::task::spawn_blocking(move || {
            let started = std::time::Instant::now();
            let guard = conn.lock();
            let out = f(&guard);
            metrics
                .sqlite_commit
                .record_ms(started.elapsed().as_secs_f64() * 1000.0);
            out
        })
        .await
        .context("sqlite task join")?
    }

    // ── Candles ─────────────────────────────────────────────────────────

    pub async fn insert_candle_1s(&self, candle: &Candle1s) -> Result<()> {
        let c = candle.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO candles_1s
                 (exchange, token, ts, open, high, low, close, volume, ticks_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![c.exchange, c.token, c.ts, c.open, c.high, c.low, c.close, c.volume, c.ticks_count],
            )
            .context("inserting 1s candle")?;
            Ok(())
        })
        .await
    }

    pub async fn insert_tf_candle(&self, candle: &TfCandle) -> Result<()> {
        let c = candle.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO candles_tf
                 (exchange, token, tf, ts, open, high, low, close, volume, ticks_count, count_1s)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    c.exchange, c.token, c.tf, c.ts, c.open, c.high, c.low, c.close, c.volume,
                    c.ticks_count, c.count
                ],
            )
            .context("inserting TF candle")?;
            Ok(())
        })
        .await
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Insert a snapshot row and prune the table to the latest rows.
    pub async fn save_snapshot(&self, data_json: String) -> Result<()> {
        let created_at = Utc::now().timestamp();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO indicator_snapshots (data_json, created_at) VALUES (?1, ?2)",
                params![data_json, created_at],
            )
            .context("inserting snapshot")?;
            conn.execute(
                "DELETE FROM indicator_snapshots WHERE id NOT IN
                 (SELECT id FROM indicator_snapshots ORDER BY id DESC LIMIT ?1)",
                params![SNAPSHOT_KEEP_ROWS],
            )
            .context("pruning snapshots")?;
            Ok(())
        })
        .await
    }

    pub async fn read_latest_snapshot(&self) -> Result<Option<String>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT data_json FROM indicator_snapshots ORDER BY id DESC LIMIT 1")
                .context("preparing snapshot read")?;
            let mut rows = stmt.query([]).context("querying snapshot")?;
            match rows.next().context("reading snapshot row")? {
                Some(row) => Ok(Some(row.get(0).context("snapshot column")?)),
                None => Ok(None),
            }
        })
        .await
    }

    // ── Liveness ────────────────────────────────────────────────────────

    pub async fn ping(&self) -> Result<()> {
        self.run_blocking(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .context("sqlite ping")
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(
            path.to_str().unwrap(),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();
        (store, dir)
    }

    fn candle(ts: i64) -> Candle1s {
        Candle1s {
            token: "3045".into(),
            exchange: "NSE".into(),
            ts,
            open: 100_00,
            high: 100_50,
            low: 99_50,
            close: 100_25,
            volume: 42,
            ticks_count: 4,
        }
    }

    #[tokio::test]
    async fn candle_insert_is_idempotent() {
        let (store, _dir) = open_temp();
        let c = candle(1_700_000_000);

        store.insert_candle_1s(&c).await.unwrap();
        store.insert_candle_1s(&c).await.unwrap();

        let count: i64 = {
            let conn = store.conn.lock();
            conn.query_row("SELECT COUNT(*) FROM candles_1s", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn tf_candle_keyed_by_timeframe() {
        let (store, _dir) = open_temp();
        let base = candle(1_700_000_100);
        let mut tf60 = TfCandle::open_from_1s(&base, 60, 1_700_000_100);
        store.insert_tf_candle(&tf60).await.unwrap();
        tf60.tf = 300;
        store.insert_tf_candle(&tf60).await.unwrap();

        let count: i64 = {
            let conn = store.conn.lock();
            conn.query_row("SELECT COUNT(*) FROM candles_tf", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count, 2, "same bucket under two timeframes is two rows");
    }

    #[tokio::test]
    async fn snapshots_prune_to_latest_ten() {
        let (store, _dir) = open_temp();

        for i in 0..15 {
            store.save_snapshot(format!("{{\"n\":{i}}}")).await.unwrap();
        }

        let count: i64 = {
            let conn = store.conn.lock();
            conn.query_row("SELECT COUNT(*) FROM indicator_snapshots", [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count, 10);

        let latest = store.read_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest, "{\"n\":14}");
    }

    #[tokio::test]
    async fn empty_snapshot_table_reads_none() {
        let (store, _dir) = open_temp();
        assert!(store.read_latest_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_database() {
        let (store, _dir) = open_temp();
        store.ping().await.unwrap();
    }
}
