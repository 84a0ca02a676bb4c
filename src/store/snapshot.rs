// =============================================================================
// Snapshot Store — dual-backed engine snapshot persistence
// =============================================================================
//
// Two independent backings hold the latest engine snapshot so either can be
// authoritative on recovery: the Redis KV key (24 h TTL) and the embedded
// `indicator_snapshots` table (latest 10 rows). The checkpointer writes to
// both; restore tries Redis first, then SQLite, then cold-starts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::keys::SNAPSHOT_TTL_SECS;
use super::sqlite::SqliteStore;

/// Capability set shared by every snapshot backing.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot_json(&self, json: &str) -> Result<()>;
    async fn read_latest_snapshot_json(&self) -> Result<Option<String>>;
}

// =============================================================================
// Redis KV backing
// =============================================================================

pub struct RedisSnapshotStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisSnapshotStore {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save_snapshot_json(&self, json: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(&self.key, json, SNAPSHOT_TTL_SECS as u64)
            .await
            .with_context(|| format!("SET {} EX {SNAPSHOT_TTL_SECS}", self.key))?;
        Ok(())
    }

    async fn read_latest_snapshot_json(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(&self.key)
            .await
            .with_context(|| format!("GET {}", self.key))?;
        Ok(value)
    }
}

// =============================================================================
// SQLite backing
// =============================================================================

pub struct SqliteSnapshotStore {
    store: SqliteStore,
}

impl SqliteSnapshotStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save_snapshot_json(&self, json: &str) -> Result<()> {
        self.store.save_snapshot(json.to_string()).await
    }

    async fn read_latest_snapshot_json(&self) -> Result<Option<String>> {
        self.store.read_latest_snapshot().await
    }
}

// =============================================================================
// Recovery helper
// =============================================================================

/// Read the newest snapshot available across the backings, in priority
/// order. A corrupt or unreachable backing falls through to the next.
pub async fn read_first_available(stores: &[&dyn SnapshotStore]) -> Option<String> {
    for store in stores {
        match store.read_latest_snapshot_json().await {
            Ok(Some(json)) => return Some(json),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "snapshot backing unavailable, trying next"),
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineMetrics;
    use std::sync::Arc;

    #[tokio::test]
    async fn sqlite_backing_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.db");
        let sqlite = SqliteStore::open(
            path.to_str().unwrap(),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();
        let backing = SqliteSnapshotStore::new(sqlite);

        assert!(backing.read_latest_snapshot_json().await.unwrap().is_none());
        backing.save_snapshot_json("{\"version\":1}").await.unwrap();
        assert_eq!(
            backing.read_latest_snapshot_json().await.unwrap().unwrap(),
            "{\"version\":1}"
        );
    }

    #[tokio::test]
    async fn fallback_skips_empty_backing() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(PipelineMetrics::new());

        let empty = SqliteSnapshotStore::new(
            SqliteStore::open(dir.path().join("a.db").to_str().unwrap(), metrics.clone())
                .unwrap(),
        );
        let filled = SqliteSnapshotStore::new(
            SqliteStore::open(dir.path().join("b.db").to_str().unwrap(), metrics).unwrap(),
        );
        filled.save_snapshot_json("{\"version\":1}").await.unwrap();

        let found = read_first_available(&[&empty, &filled]).await;
        assert_eq!(found.unwrap(), "{\"version\":1}");
    }
}
