//! C2 — block store (spec §4.1).
//!
//! Persists immutable content-addressed blocks, serves byte ranges for
//! fountain encoding, accepts inbound combinations and decodes them via
//! per-digest [`crate::fountain::FountainSink`]s, and exposes the `map`
//! key/value relation used by the DHT and caches (spec §3 "store_value").

pub mod cache;
pub mod db;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::crypto;
use crate::fountain::{Combination, FountainSink, FountainSource};
use crate::ident::Identifier;

pub use db::ValueKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] db::DbError),
    #[error("cache io error: {0}")]
    Cache(#[from] cache::CacheError),
    #[error("fountain error: {0}")]
    Fountain(#[from] crate::fountain::FountainError),
    #[error("block not found: {0}")]
    NotFound(Identifier),
    #[error("digest mismatch after decode: expected {expected}, computed {computed}")]
    DigestMismatch { expected: Identifier, computed: Identifier },
    #[error("timed out waiting for block {0}")]
    Timeout(Identifier),
}

pub struct BlockStore {
    pool: sqlx::SqlitePool,
    cache: cache::Cache,
    sinks: Mutex<HashMap<Identifier, FountainSink>>,
    waiters: RwLock<HashMap<Identifier, Arc<Notify>>>,
    store_max_age: Duration,
}

impl BlockStore {
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        cache_max_size: u64,
        cache_max_file_size: u64,
        store_max_age: Duration,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await.map_err(cache::CacheError::Io)?;
        let pool = db::open(&data_dir.join("store.db")).await?;
        let cache = cache::Cache::new(data_dir.join("cache"), cache_max_size, cache_max_file_size);
        cache.ensure_dir().await?;
        Ok(BlockStore {
            pool,
            cache,
            sinks: Mutex::new(HashMap::new()),
            waiters: RwLock::new(HashMap::new()),
            store_max_age,
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory_for_tests() -> Result<Self, StoreError> {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir.into_path(), 64 * 1024 * 1024, 16 * 1024 * 1024, Duration::from_secs(3600)).await
    }

    // ─── Block push / pull ────────────────────────────────────────────────

    /// Apply `combination` to `digest`'s sink. Returns `true` once the block
    /// becomes fully decoded and is durably stored (spec §4.1 `push`).
    pub async fn push(&self, digest: Identifier, combination: &Combination) -> Result<bool, StoreError> {
        if self.has_block(&digest).await? {
            return Ok(true);
        }

        let decoded_bytes = {
            let mut sinks = self.sinks.lock().await;
            let sink = sinks.entry(digest).or_insert_with(FountainSink::new);
            let decoded = sink.push(combination)?;
            if !decoded {
                None
            } else {
                let bytes = sink.dump()?;
                Some(bytes)
            }
        };

        let Some(bytes) = decoded_bytes else { return Ok(false) };

        let computed = crypto::system_hash(&bytes);
        if computed != digest {
            log::warn!("store: digest mismatch decoding {digest}, discarding sink");
            self.sinks.lock().await.remove(&digest);
            return Err(StoreError::DigestMismatch { expected: digest, computed });
        }

        self.cache.write_block(&digest, &bytes).await?;
        db::insert_block(&self.pool, &digest.to_hex(), &digest.to_hex(), 0, bytes.len() as i64).await?;
        self.sinks.lock().await.remove(&digest);
        self.notify_waiters(&digest).await;
        Ok(true)
    }

    /// Directly store an already-verified block (used when content is
    /// produced locally, e.g. by the resource layer on publish).
    pub async fn put_verified(&self, bytes: &[u8]) -> Result<Identifier, StoreError> {
        let digest = crypto::system_hash(bytes);
        if !self.has_block(&digest).await? {
            self.cache.write_block(&digest, bytes).await?;
            db::insert_block(&self.pool, &digest.to_hex(), &digest.to_hex(), 0, bytes.len() as i64).await?;
            self.notify_waiters(&digest).await;
        }
        Ok(digest)
    }

    /// Generate a fresh coded combination over `digest`'s bytes. Returns
    /// `(combination, rank)` where `rank` is the source's component count
    /// (spec §4.1 `pull`).
    pub async fn pull(&self, digest: &Identifier) -> Result<(Combination, u32), StoreError> {
        let bytes = self.cache.read_block(digest).await.map_err(|_| StoreError::NotFound(*digest))?;
        let source = FountainSource::new(bytes)?;
        let combo = source.generate()?;
        Ok((combo, source.rank()))
    }

    /// Number of linearly independent symbols still required to decode
    /// `digest`, or `u32::MAX` if no sink is active and the block is not
    /// locally available (spec's "∞ if no sink exists").
    pub async fn missing(&self, digest: &Identifier) -> u32 {
        if self.has_block(digest).await.unwrap_or(false) {
            return 0;
        }
        match self.sinks.lock().await.get(digest) {
            Some(sink) => sink.missing().unwrap_or(u32::MAX),
            None => u32::MAX,
        }
    }

    pub async fn has_block(&self, digest: &Identifier) -> Result<bool, StoreError> {
        Ok(db::lookup_block(&self.pool, &digest.to_hex()).await?.is_some())
    }

    /// Suspend the caller until `push` decodes `digest` or `timeout` elapses
    /// (spec §5 "Suspension points"). `hint` is advisory and forwarded to
    /// callers of the direct-call fast path elsewhere; it is not otherwise
    /// interpreted here.
    pub async fn wait_block(
        &self,
        digest: &Identifier,
        timeout: Duration,
        _hint: Option<Identifier>,
    ) -> Result<(), StoreError> {
        if self.has_block(digest).await? {
            return Ok(());
        }
        let notify = {
            let mut waiters = self.waiters.write().await;
            waiters.entry(*digest).or_insert_with(|| Arc::new(Notify::new())).clone()
        };
        tokio::select! {
            _ = notify.notified() => Ok(()),
            _ = tokio::time::sleep(timeout) => {
                if self.has_block(digest).await? { Ok(()) } else { Err(StoreError::Timeout(*digest)) }
            }
        }
    }

    async fn notify_waiters(&self, digest: &Identifier) {
        if let Some(notify) = self.waiters.write().await.remove(digest) {
            notify.notify_waiters();
        }
    }

    pub async fn get_block(&self, digest: &Identifier) -> Result<Vec<u8>, StoreError> {
        Ok(self.cache.read_block(digest).await.map_err(|_| StoreError::NotFound(*digest))?)
    }

    // ─── Hints ────────────────────────────────────────────────────────────

    pub async fn add_hint(&self, digest: &Identifier, hint: &Identifier) -> Result<(), StoreError> {
        Ok(db::add_hint(&self.pool, &digest.to_hex(), &hint.to_hex()).await?)
    }

    pub async fn hints_for(&self, digest: &Identifier) -> Result<Vec<Identifier>, StoreError> {
        let hex = db::hints_for(&self.pool, &digest.to_hex()).await?;
        Ok(hex.into_iter().filter_map(|h| Identifier::from_hex(&h).ok()).collect())
    }

    // ─── map(key, value, time, type) ───────────────────────────────────────

    pub async fn store_value(&self, key: &Identifier, value: &Identifier, kind: ValueKind) -> Result<(), StoreError> {
        let now = now_secs();
        Ok(db::store_value(&self.pool, &key.to_hex(), &value.to_hex(), kind, now).await?)
    }

    pub async fn retrieve_value(&self, key: &Identifier) -> Result<Vec<Identifier>, StoreError> {
        let rows = db::retrieve_values(&self.pool, &key.to_hex()).await?;
        Ok(rows.into_iter().filter_map(|(v, _, _)| Identifier::from_hex(&v).ok()).collect())
    }

    pub async fn retrieve_value_with_kind(&self, key: &Identifier) -> Result<Vec<(Identifier, ValueKind, i64)>, StoreError> {
        let rows = db::retrieve_values(&self.pool, &key.to_hex()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(v, k, t)| Identifier::from_hex(&v).ok().map(|v| (v, k, t)))
            .collect())
    }

    /// One pass of the background purge: delete non-permanent `map` rows
    /// older than `store_max_age`, then evict cached blocks over budget
    /// (spec §4.1, §7 "Exhaustion").
    pub async fn purge_once(&self) -> Result<(), StoreError> {
        let removed = db::purge_expired(&self.pool, now_secs(), self.store_max_age.as_secs() as i64).await?;
        if removed > 0 {
            log::debug!("store: purged {removed} expired map entries");
        }
        let evicted = self.cache.free_space(&self.pool).await?;
        if !evicted.is_empty() {
            log::debug!("store: evicted {} blocks over cache budget", evicted.len());
        }
        Ok(())
    }

    /// Spawn the background purge loop (spec §4.1). Runs until the returned
    /// handle is aborted or dropped along with the runtime.
    pub fn spawn_purge_loop(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = this.purge_once().await {
                    log::warn!("store: purge pass failed: {e}");
                }
            }
        })
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fountain::FountainSource;

    #[tokio::test]
    async fn put_verified_then_has_block() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let digest = store.put_verified(b"hello world").await.unwrap();
        assert!(store.has_block(&digest).await.unwrap());
        assert_eq!(store.get_block(&digest).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn push_decodes_and_verifies_digest() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let data = b"the quick brown fox jumps".repeat(50);
        let digest = crypto::system_hash(&data);
        let source = FountainSource::new(data.clone()).unwrap();

        let mut decoded = false;
        for _ in 0..10_000 {
            let combo = source.generate().unwrap();
            decoded = store.push(digest, &combo).await.unwrap();
            if decoded {
                break;
            }
        }
        assert!(decoded);
        assert_eq!(store.get_block(&digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn pull_then_push_roundtrips_between_two_stores() {
        let server = BlockStore::open_in_memory_for_tests().await.unwrap();
        let client = BlockStore::open_in_memory_for_tests().await.unwrap();
        let data = b"roundtrip payload across stores".repeat(20);
        let digest = server.put_verified(&data).await.unwrap();

        let mut decoded = false;
        for _ in 0..10_000 {
            let (combo, _rank) = server.pull(&digest).await.unwrap();
            decoded = client.push(digest, &combo).await.unwrap();
            if decoded {
                break;
            }
        }
        assert!(decoded);
        assert_eq!(client.get_block(&digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn missing_is_max_for_unknown_digest() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let digest = crypto::system_hash(b"nope");
        assert_eq!(store.missing(&digest).await, u32::MAX);
    }

    #[tokio::test]
    async fn missing_is_zero_once_decoded() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let digest = store.put_verified(b"abc").await.unwrap();
        assert_eq!(store.missing(&digest).await, 0);
    }

    #[tokio::test]
    async fn store_value_and_retrieve_value_roundtrip() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let key = crypto::system_hash(b"key");
        let value = crypto::system_hash(b"value");
        store.store_value(&key, &value, ValueKind::Distributed).await.unwrap();
        let values = store.retrieve_value(&key).await.unwrap();
        assert_eq!(values, vec![value]);
    }

    #[tokio::test]
    async fn wait_block_unblocks_on_push() {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let digest = crypto::system_hash(b"waited-for");
        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            waiter_store.wait_block(&digest, Duration::from_secs(5), None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.put_verified(b"waited-for").await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_block_times_out_when_never_pushed() {
        let store = BlockStore::open_in_memory_for_tests().await.unwrap();
        let digest = crypto::system_hash(b"never-arrives");
        let result = store.wait_block(&digest, Duration::from_millis(30), None).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }
}
