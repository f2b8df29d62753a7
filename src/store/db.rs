//! `store.db` relational schema (spec §6 "On-disk"): `blocks`, `files`,
//! `map`. Matches the teacher's `sqlx`-over-SQLite pattern (`db.rs` in the
//! teacher crate), adapted from an async read model to the block store's
//! single write path / many readers shape (spec §5 "Shared-resource
//! policy").

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

pub async fn open(path: &std::path::Path) -> Result<SqlitePool, DbError> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(DbError::Sqlx)?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn open_in_memory() -> Result<SqlitePool, DbError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS files (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS blocks (
            digest  TEXT PRIMARY KEY,
            file_id INTEGER NOT NULL REFERENCES files(id),
            offset  INTEGER NOT NULL,
            size    INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS block_hints (
            digest      TEXT NOT NULL,
            hint_digest TEXT NOT NULL,
            PRIMARY KEY (digest, hint_digest)
        );

        CREATE TABLE IF NOT EXISTS map (
            key   TEXT NOT NULL,
            value TEXT NOT NULL,
            time  INTEGER NOT NULL,
            type  INTEGER NOT NULL,
            PRIMARY KEY (key, value)
        );
        CREATE INDEX IF NOT EXISTS map_time_idx ON map(type, time);
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub struct BlockRow {
    pub file_name: String,
    pub offset: i64,
    pub size: i64,
}

pub async fn insert_block(
    pool: &SqlitePool,
    digest_hex: &str,
    file_name: &str,
    offset: i64,
    size: i64,
) -> Result<(), DbError> {
    sqlx::query("INSERT OR IGNORE INTO files (name) VALUES (?)")
        .bind(file_name)
        .execute(pool)
        .await?;
    let file_id: i64 = sqlx::query("SELECT id FROM files WHERE name = ?")
        .bind(file_name)
        .fetch_one(pool)
        .await?
        .get(0);
    sqlx::query("INSERT OR REPLACE INTO blocks (digest, file_id, offset, size) VALUES (?, ?, ?, ?)")
        .bind(digest_hex)
        .bind(file_id)
        .bind(offset)
        .bind(size)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn lookup_block(pool: &SqlitePool, digest_hex: &str) -> Result<Option<BlockRow>, DbError> {
    let row = sqlx::query(
        "SELECT files.name, blocks.offset, blocks.size FROM blocks \
         JOIN files ON files.id = blocks.file_id WHERE blocks.digest = ?",
    )
    .bind(digest_hex)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| BlockRow {
        file_name: r.get(0),
        offset: r.get(1),
        size: r.get(2),
    }))
}

pub async fn delete_block(pool: &SqlitePool, digest_hex: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM blocks WHERE digest = ?")
        .bind(digest_hex)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn all_blocks_oldest_first(pool: &SqlitePool) -> Result<Vec<(String, String, i64)>, DbError> {
    // (digest, file_name, size) ordered by rowid, a cheap LRU-ish proxy for
    // insertion order (spec §4.1 cache eviction is "by LRU").
    let rows = sqlx::query(
        "SELECT blocks.digest, files.name, blocks.size FROM blocks \
         JOIN files ON files.id = blocks.file_id ORDER BY blocks.rowid ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| (r.get(0), r.get(1), r.get(2))).collect())
}

pub async fn add_hint(pool: &SqlitePool, digest_hex: &str, hint_digest_hex: &str) -> Result<(), DbError> {
    sqlx::query("INSERT OR IGNORE INTO block_hints (digest, hint_digest) VALUES (?, ?)")
        .bind(digest_hex)
        .bind(hint_digest_hex)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn hints_for(pool: &SqlitePool, digest_hex: &str) -> Result<Vec<String>, DbError> {
    let rows = sqlx::query("SELECT hint_digest FROM block_hints WHERE digest = ?")
        .bind(digest_hex)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

// ─── map(key, value, time, type) — store_value / retrieve_value ──────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Permanent = 0,
    Temporary = 1,
    Distributed = 2,
}

impl ValueKind {
    fn as_i64(self) -> i64 {
        self as i64
    }
    fn from_i64(v: i64) -> Self {
        match v {
            0 => ValueKind::Permanent,
            2 => ValueKind::Distributed,
            _ => ValueKind::Temporary,
        }
    }
}

pub async fn store_value(
    pool: &SqlitePool,
    key_hex: &str,
    value_hex: &str,
    kind: ValueKind,
    now_secs: i64,
) -> Result<(), DbError> {
    sqlx::query("INSERT OR REPLACE INTO map (key, value, time, type) VALUES (?, ?, ?, ?)")
        .bind(key_hex)
        .bind(value_hex)
        .bind(now_secs)
        .bind(kind.as_i64())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn retrieve_values(pool: &SqlitePool, key_hex: &str) -> Result<Vec<(String, ValueKind, i64)>, DbError> {
    let rows = sqlx::query("SELECT value, type, time FROM map WHERE key = ?")
        .bind(key_hex)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| {
            let value: String = r.get(0);
            let kind: i64 = r.get(1);
            let time: i64 = r.get(2);
            (value, ValueKind::from_i64(kind), time)
        })
        .collect())
}

/// Delete non-permanent `map` rows older than `max_age_secs` (spec §4.1
/// "background purge deletes non-permanent entries older than
/// `store_max_age`").
pub async fn purge_expired(pool: &SqlitePool, now_secs: i64, max_age_secs: i64) -> Result<u64, DbError> {
    let cutoff = now_secs - max_age_secs;
    let result = sqlx::query("DELETE FROM map WHERE type <> 0 AND time < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
