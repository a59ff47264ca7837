//! # Durable Store Module
//!
//! ## Purpose
//! Generic async byte store used as the slower, durable tier of the result
//! cache. The engine only requires `get`/`set`/`delete`/`clear` over opaque
//! bytes; the default implementation is an embedded sled database that
//! survives process restarts.
//!
//! ## Input/Output Specification
//! - **Input**: Cache keys and serialized cache entries (bytes)
//! - **Output**: Persisted entries, retrieval, sweep support
//! - **Storage**: Sled embedded database, one tree for cache entries

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{EngineError, Result};

/// Generic async byte store consumed by the cache's durable tier.
///
/// TTLs are advisory at this layer: expiry is enforced lazily by the cache
/// on read, so a store may ignore the hint entirely.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    /// All keys currently present, for the optional startup sweep
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Sled-backed durable store
pub struct SledStore {
    db: Arc<sled::Db>,
    entries: Arc<sled::Tree>,
}

impl SledStore {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = sled::open(path).map_err(|e| EngineError::CacheUnavailable {
            details: format!("failed to open store at {:?}: {}", path, e),
        })?;
        let entries = db
            .open_tree("sorted_results")
            .map_err(|e| EngineError::CacheUnavailable {
                details: format!("failed to open entries tree: {}", e),
            })?;

        tracing::info!("durable store opened at {:?} ({} entries)", path, entries.len());
        Ok(Self {
            db: Arc::new(db),
            entries: Arc::new(entries),
        })
    }

    /// Health check: exercises one write/read/delete cycle
    pub async fn health_check(&self) -> Result<()> {
        let test_key = b"__health_check__";
        self.entries.insert(test_key, b"ok".as_ref())?;
        let read = self.entries.get(test_key)?;
        if read.is_none() {
            return Err(EngineError::CacheUnavailable {
                details: "health check value not found after write".to_string(),
            });
        }
        self.entries.remove(test_key)?;
        Ok(())
    }

    /// Size of the backing database on disk
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.entries.get(key.as_bytes())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, _ttl_seconds: u64) -> Result<()> {
        self.entries.insert(key.as_bytes(), value)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key.as_bytes())?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear()?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for result in self.entries.iter() {
            let (key, _) = result?;
            match String::from_utf8(key.to_vec()) {
                Ok(key) => keys.push(key),
                Err(_) => tracing::warn!("skipping non-utf8 key in durable store"),
            }
        }
        Ok(keys)
    }
}
