//! Block payload file layout and LRU eviction (spec §6 "Block payload files
//! live under the cache directory; filenames are opaque", supplemented by
//! `original_source/tpn/cache.hpp`'s `freeSpace`).

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::db;
use crate::ident::Identifier;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block exceeds cache_max_file_size")]
    TooLarge,
}

pub struct Cache {
    directory: PathBuf,
    max_size: u64,
    max_file_size: u64,
}

impl Cache {
    pub fn new(directory: impl Into<PathBuf>, max_size: u64, max_file_size: u64) -> Self {
        Cache { directory: directory.into(), max_size, max_file_size }
    }

    pub async fn ensure_dir(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    /// Opaque filename for a block's payload file: the hex digest itself,
    /// which is already an opaque, collision-resistant name.
    pub fn path_for(&self, digest: &Identifier) -> PathBuf {
        self.directory.join(digest.to_hex())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write `bytes` to this digest's payload file, rejecting blocks over
    /// `cache_max_file_size` (spec §7 "Exhaustion").
    pub async fn write_block(&self, digest: &Identifier, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        if bytes.len() as u64 > self.max_file_size {
            return Err(CacheError::TooLarge);
        }
        self.ensure_dir().await?;
        let path = self.path_for(digest);
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn read_block(&self, digest: &Identifier) -> Result<Vec<u8>, CacheError> {
        Ok(tokio::fs::read(self.path_for(digest)).await?)
    }

    pub async fn remove_block(&self, digest: &Identifier) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Evict oldest blocks (insertion order, a cheap LRU proxy — see
    /// `db::all_blocks_oldest_first`) until total size is back under
    /// `max_size`. Returns the digests evicted.
    pub async fn free_space(&self, pool: &sqlx::SqlitePool) -> Result<Vec<String>, CacheError> {
        let rows = db::all_blocks_oldest_first(pool).await.map_err(|e| {
            CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })?;
        let mut total: u64 = rows.iter().map(|(_, _, size)| *size as u64).sum();
        let mut evicted = Vec::new();
        for (digest_hex, _file_name, size) in rows {
            if total <= self.max_size {
                break;
            }
            if let Ok(digest) = Identifier::from_hex(&digest_hex) {
                let _ = self.remove_block(&digest).await;
            }
            db::delete_block(pool, &digest_hex).await.map_err(|e| {
                CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            total = total.saturating_sub(size as u64);
            evicted.push(digest_hex);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1024 * 1024, 1024 * 1024);
        let digest = crate::crypto::system_hash(b"payload");
        cache.write_block(&digest, b"payload").await.unwrap();
        let read = cache.read_block(&digest).await.unwrap();
        assert_eq!(read, b"payload");
    }

    #[tokio::test]
    async fn oversized_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1024, 4);
        let digest = crate::crypto::system_hash(b"too big");
        let err = cache.write_block(&digest, b"too big").await.unwrap_err();
        assert!(matches!(err, CacheError::TooLarge));
    }
}
