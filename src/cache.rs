//! # Result Cache Module
//!
//! ## Purpose
//! Two-tier cache for sorted-and-aggregated results, keyed by the canonical
//! (filters, sort key) signature. The memory tier is a strict LRU with a
//! bounded capacity; the durable tier is a byte store that survives process
//! restarts where available. Durable hits are promoted into memory before
//! being returned.
//!
//! ## Input/Output Specification
//! - **Input**: Filter sets, sort keys, completed cache entries
//! - **Output**: Cached entries (copies), hit/miss statistics
//! - **Expiry**: Lazy, at read time, per tier, against each entry's own TTL
//!
//! ## Key Features
//! - Strict LRU eviction (single least-recently-used entry, on insertion)
//! - Independent TTLs per tier
//! - Durable-tier failures logged and degraded, never escalated
//! - Optional startup sweep of expired durable entries

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::errors::{EngineError, Result};
use crate::filters::FilterSet;
use crate::sorter::SortKey;
use crate::store::DurableStore;
use crate::LeanRecord;

/// A cached sorted-and-aggregated result.
///
/// Read-only after creation: a resort of the same aggregate creates a new
/// entry under a new key, it never mutates an existing one. The cache owns
/// its stored entries and returns copies to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical (filters, sort key) cache key
    pub key: String,
    /// The fully sorted record sequence
    pub records: Vec<LeanRecord>,
    /// Total count reported by the source at aggregation time
    pub total: usize,
    /// Filters the entry was built for
    pub filters: FilterSet,
    /// Sort key the entry was built for
    pub sort_key: SortKey,
    /// Creation timestamp
    pub stored_at: DateTime<Utc>,
    /// Time-to-live applied by the owning tier, in seconds
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Build a fresh entry; the owning tier assigns the TTL on write
    pub fn new(
        filters: FilterSet,
        sort_key: SortKey,
        records: Vec<LeanRecord>,
        total: usize,
    ) -> Self {
        let key = filters.cache_key(&sort_key);
        Self {
            key,
            records,
            total,
            filters,
            sort_key,
            stored_at: Utc::now(),
            ttl_seconds: 0,
        }
    }

    fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Entry age vs its own TTL, checked lazily on read
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.stored_at).num_seconds();
        age >= self.ttl_seconds as i64
    }
}

/// Memory-tier slot with its access stamp
struct MemorySlot {
    entry: CacheEntry,
    last_access: u64,
}

/// Bounded-capacity strict-LRU memory tier.
///
/// Access order is tracked with a monotonically increasing stamp; eviction
/// removes the single slot with the smallest stamp. Capacity is small (tens
/// of entries) so the linear eviction scan is not worth a fancier structure.
struct MemoryTier {
    capacity: usize,
    slots: HashMap<String, MemorySlot>,
    clock: u64,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            clock: 0,
        }
    }

    fn touch(&mut self, key: &str) -> Option<&CacheEntry> {
        self.clock += 1;
        let clock = self.clock;
        self.slots.get_mut(key).map(|slot| {
            slot.last_access = clock;
            &slot.entry
        })
    }

    fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    fn remove(&mut self, key: &str) {
        self.slots.remove(key);
    }

    /// Insert an entry, evicting the least-recently-used slot first when at
    /// capacity. Replacing an existing key never evicts.
    fn insert(&mut self, entry: CacheEntry) {
        if !self.slots.contains_key(&entry.key) && self.slots.len() >= self.capacity {
            if let Some(lru_key) = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(key, _)| key.clone())
            {
                tracing::debug!("memory tier at capacity, evicting '{}'", lru_key);
                self.slots.remove(&lru_key);
            }
        }
        self.clock += 1;
        let slot = MemorySlot {
            last_access: self.clock,
            entry,
        };
        self.slots.insert(slot.entry.key.clone(), slot);
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Cache hit/miss statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub promotions: u64,
    pub degraded_writes: u64,
    pub memory_entries: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    durable_hits: AtomicU64,
    durable_misses: AtomicU64,
    promotions: AtomicU64,
    degraded_writes: AtomicU64,
}

/// Two-tier result cache
pub struct CacheManager {
    memory: Mutex<MemoryTier>,
    durable: Option<Arc<dyn DurableStore>>,
    memory_ttl_seconds: u64,
    durable_ttl_seconds: u64,
    enable_compression: bool,
    counters: Counters,
}

impl CacheManager {
    /// Create a cache manager; `durable` is optional so the engine can run
    /// memory-only when no store is configured.
    pub fn new(config: &CacheConfig, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(config.memory_capacity)),
            durable,
            memory_ttl_seconds: config.memory_ttl_seconds,
            durable_ttl_seconds: config.durable_ttl_seconds,
            enable_compression: config.enable_compression,
            counters: Counters::default(),
        }
    }

    /// Look up a cached result for (filters, sort key).
    ///
    /// Memory is consulted first; on a memory miss the durable tier is
    /// checked and a hit is promoted into memory before being returned.
    /// Expired entries are deleted on access.
    pub async fn get(&self, filters: &FilterSet, sort_key: &SortKey) -> Option<CacheEntry> {
        let key = filters.cache_key(sort_key);
        let now = Utc::now();

        // Memory tier; the lock is never held across an await point
        {
            let mut memory = self.memory.lock();
            let cached = memory.peek(&key).map(|e| (e.clone(), e.is_expired(now)));
            match cached {
                Some((entry, false)) => {
                    memory.touch(&key);
                    self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry);
                }
                Some((_, true)) => {
                    tracing::debug!("memory entry '{}' expired, dropping", key);
                    memory.remove(&key);
                }
                None => {}
            }
        }
        self.counters.memory_misses.fetch_add(1, Ordering::Relaxed);

        // Durable tier
        let store = self.durable.as_ref()?;
        let bytes = match store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.durable_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(err) => {
                tracing::warn!("durable tier read failed, degrading to memory-only: {}", err);
                self.counters.durable_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry = match self.decode_entry(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("dropping undecodable durable entry '{}': {}", key, err);
                let _ = store.delete(&key).await;
                self.counters.durable_misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired(now) {
            tracing::debug!("durable entry '{}' expired, deleting", key);
            let _ = store.delete(&key).await;
            self.counters.durable_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);

        // Promote into memory (write-through) under the memory tier's TTL
        let promoted = entry.clone().with_ttl(self.memory_ttl_seconds);
        self.memory.lock().insert(promoted);
        Some(entry)
    }

    /// Store a completed result in both tiers.
    ///
    /// A durable-tier failure never fails the put; the memory write still
    /// succeeds and the failure is logged as degraded operation.
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        let memory_entry = entry.clone().with_ttl(self.memory_ttl_seconds);
        self.memory.lock().insert(memory_entry);

        if let Some(store) = self.durable.as_ref() {
            let durable_entry = entry.with_ttl(self.durable_ttl_seconds);
            let key = durable_entry.key.clone();
            match self.encode_entry(&durable_entry) {
                Ok(bytes) => {
                    if let Err(err) = store.set(&key, bytes, self.durable_ttl_seconds).await {
                        self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "durable tier write failed for '{}', memory-only entry retained: {}",
                            key,
                            err
                        );
                    }
                }
                Err(err) => {
                    self.counters.degraded_writes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("failed to encode entry '{}' for durable tier: {}", key, err);
                }
            }
        }
        Ok(())
    }

    /// True when a non-expired entry exists in either tier (no promotion)
    pub async fn has(&self, filters: &FilterSet, sort_key: &SortKey) -> bool {
        let key = filters.cache_key(sort_key);
        let now = Utc::now();
        {
            let memory = self.memory.lock();
            if let Some(entry) = memory.peek(&key) {
                if !entry.is_expired(now) {
                    return true;
                }
            }
        }
        if let Some(store) = self.durable.as_ref() {
            if let Ok(Some(bytes)) = store.get(&key).await {
                if let Ok(entry) = self.decode_entry(&bytes) {
                    return !entry.is_expired(now);
                }
            }
        }
        false
    }

    /// Drop everything from both tiers
    pub async fn clear(&self) -> Result<()> {
        self.memory.lock().clear();
        if let Some(store) = self.durable.as_ref() {
            if let Err(err) = store.clear().await {
                tracing::warn!("durable tier clear failed: {}", err);
            }
        }
        tracing::info!("result cache cleared");
        Ok(())
    }

    /// Startup sweep: drop expired durable entries so restarts begin clean.
    /// Returns the number of entries removed.
    pub async fn sweep_durable(&self) -> Result<usize> {
        let Some(store) = self.durable.as_ref() else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut removed = 0usize;
        for key in store.keys().await? {
            let Ok(Some(bytes)) = store.get(&key).await else {
                continue;
            };
            let expired = match self.decode_entry(&bytes) {
                Ok(entry) => entry.is_expired(now),
                // undecodable entries are swept too
                Err(_) => true,
            };
            if expired {
                store.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("startup sweep removed {} expired durable entries", removed);
        }
        Ok(removed)
    }

    /// Snapshot of hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.counters.memory_misses.load(Ordering::Relaxed),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            durable_misses: self.counters.durable_misses.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            degraded_writes: self.counters.degraded_writes.load(Ordering::Relaxed),
            memory_entries: self.memory.lock().len(),
        }
    }

    /// First byte marks the compression flag so mixed stores stay readable
    fn encode_entry(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        let payload = bincode::serialize(entry)?;
        if self.enable_compression {
            let mut encoder =
                flate2::write::GzEncoder::new(vec![1u8], flate2::Compression::default());
            encoder.write_all(&payload)?;
            Ok(encoder.finish()?)
        } else {
            let mut bytes = vec![0u8];
            bytes.extend_from_slice(&payload);
            Ok(bytes)
        }
    }

    fn decode_entry(&self, bytes: &[u8]) -> Result<CacheEntry> {
        let (flag, payload) = bytes.split_first().ok_or_else(|| EngineError::Serialization {
            message: "empty durable entry".to_string(),
        })?;
        if *flag == 1 {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(bincode::deserialize(&decompressed)?)
        } else {
            Ok(bincode::deserialize(payload)?)
        }
    }
}
