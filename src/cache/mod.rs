//! TTL-keyed response cache on top of sled.
//!
//! Keys are the first 128 bits of `sha256(uri)`, so the uri itself is never
//! stored. Entries live in a generation tree (`entries.<n>`) whose number is
//! kept under a meta key in the default tree. Compaction copies the live
//! entries into the next generation and drops the old tree, which releases
//! the space held by expired and deleted records.

use bincode::{
    config::standard as bincode_config,
    error::{DecodeError, EncodeError},
    serde::{decode_from_slice, encode_to_vec},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};


const GENERATION_KEY: &[u8] = b"entries.generation";
const TREE_PREFIX: &str = "entries.";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sled::Error),

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] EncodeError),

    #[error("failed to decode cache entry: {0}")]
    Decode(#[from] DecodeError),

    #[error("value of {size} bytes exceeds the cache limit of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    /// A live entry expired while compaction was copying it.
    #[error("cache entry expired during compaction")]
    ExpiredDuringCompaction,

    #[error("cache generation marker is corrupt")]
    CorruptGeneration,
}

/// Cache store settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Largest payload accepted by `set` (bytes)
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    /// Extra compaction attempts on close after an entry expired mid-scan
    #[serde(default = "default_compaction_retries")]
    pub compaction_retries: u32,
    /// Flush after every write
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_max_value_size() -> usize {
    128 * 1024 * 1024
}

fn default_compaction_retries() -> u32 {
    3
}

fn default_sync_writes() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_value_size: default_max_value_size(),
            compaction_retries: default_compaction_retries(),
            sync_writes: default_sync_writes(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    expires_at_ms: i64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

struct Generation {
    number: u64,
    tree: sled::Tree,
}

/// Persistent byte-blob cache with per-entry expiry.
///
/// `get`, `set` and `delete` may run concurrently from many tasks. `close`
/// and `close_fast` take the store by value so they cannot overlap them.
pub struct CacheStore {
    db: sled::Db,
    entries: RwLock<Generation>,
    config: CacheConfig,
}

impl CacheStore {
    /// Opens (or creates) the cache in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: &CacheConfig) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        let db = sled::open(dir)?;

        let number = match db.get(GENERATION_KEY)? {
            Some(raw) => decode_generation(&raw)?,
            None => 0,
        };
        let current = tree_name(number);

        // Trees left behind by an interrupted compaction
        for name in db.tree_names() {
            if name.starts_with(TREE_PREFIX.as_bytes()) && &*name != current.as_bytes() {
                db.drop_tree(&name)?;
                debug!(tree = %String::from_utf8_lossy(&name), "Dropped stale cache generation");
            }
        }

        let tree = db.open_tree(&current)?;
        info!(dir = %dir.display(), generation = number, entries = tree.len(), "Cache opened");

        Ok(Self {
            db,
            entries: RwLock::new(Generation { number, tree }),
            config: config.clone(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Generation> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Generation> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the payload stored for `uri`, or `None` when absent or expired.
    pub fn get(&self, uri: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = cache_key(uri);
        let generation = self.read();

        let Some(raw) = generation.tree.get(key)? else {
            return Ok(None);
        };

        let entry = decode_entry(&raw)?;
        if entry.is_expired(now_ms()) {
            // Leave a record written concurrently by `set` alone
            let _ = generation
                .tree
                .compare_and_swap(key, Some(raw), None::<sled::IVec>)?;
            debug!(uri = %uri, "Cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry.payload))
    }

    /// Stores `data` for `uri`, expiring `ttl` from now.
    pub fn set(&self, uri: &str, data: &[u8], ttl: Duration) -> Result<(), CacheError> {
        if data.len() > self.config.max_value_size {
            return Err(CacheError::ValueTooLarge {
                size: data.len(),
                max: self.config.max_value_size,
            });
        }

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            payload: data.to_vec(),
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        };
        let encoded = encode_to_vec(&entry, bincode_config())?;

        self.read().tree.insert(cache_key(uri), encoded)?;
        if self.config.sync_writes {
            self.db.flush()?;
        }

        debug!(uri = %uri, bytes = data.len(), ttl_secs = ttl.as_secs(), "Cache entry stored");
        Ok(())
    }

    /// Removes the entry for `uri`; absent entries are not an error.
    pub fn delete(&self, uri: &str) -> Result<(), CacheError> {
        self.read().tree.remove(cache_key(uri))?;
        if self.config.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Removes expired and undecodable entries, returning how many went.
    pub fn collect_garbage(&self) -> Result<usize, CacheError> {
        let generation = self.read();
        let now = now_ms();
        let mut removed = 0;

        for item in generation.tree.iter() {
            let (key, raw) = item?;
            let stale = match decode_entry(&raw) {
                Ok(entry) => entry.is_expired(now),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable cache entry");
                    true
                }
            };

            if stale
                && generation
                    .tree
                    .compare_and_swap(&key, Some(raw), None::<sled::IVec>)?
                    .is_ok()
            {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Copies live entries into a fresh generation and drops the old one.
    ///
    /// Fails with [`CacheError::ExpiredDuringCompaction`] when an entry is
    /// found expired mid-scan; the current generation is left untouched.
    pub fn compact(&self) -> Result<(), CacheError> {
        let mut generation = self.write();
        let next = generation.number + 1;
        let name = tree_name(next);

        self.db.drop_tree(&name)?;
        let target = self.db.open_tree(&name)?;

        let mut copied = 0usize;
        for item in generation.tree.iter() {
            let (key, raw) = item?;
            if decode_entry(&raw)?.is_expired(now_ms()) {
                drop(target);
                self.db.drop_tree(&name)?;
                return Err(CacheError::ExpiredDuringCompaction);
            }
            target.insert(key, raw)?;
            copied += 1;
        }

        self.db.insert(GENERATION_KEY, next.to_be_bytes().to_vec())?;
        self.db.flush()?;

        let previous = std::mem::replace(
            &mut *generation,
            Generation {
                number: next,
                tree: target,
            },
        );
        self.db.drop_tree(tree_name(previous.number))?;

        info!(generation = next, entries = copied, "Cache compacted");
        Ok(())
    }

    /// Collects garbage, compacts and flushes.
    ///
    /// Compaction that keeps racing expiry is retried after another garbage
    /// pass up to `compaction_retries` times, then skipped with a warning.
    pub fn close(self) -> Result<(), CacheError> {
        let removed = self.collect_garbage()?;
        debug!(removed = removed, "Collected expired cache entries");

        let mut retries = 0;
        loop {
            match self.compact() {
                Ok(()) => break,
                Err(CacheError::ExpiredDuringCompaction)
                    if retries < self.config.compaction_retries =>
                {
                    retries += 1;
                    debug!(attempt = retries, "Entry expired during compaction, retrying");
                    self.collect_garbage()?;
                }
                Err(CacheError::ExpiredDuringCompaction) => {
                    warn!(attempts = retries + 1, "Cache compaction abandoned");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.db.flush()?;
        Ok(())
    }

    /// Flushes without garbage collection or compaction.
    pub fn close_fast(self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.read().number
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.read().tree.len()
    }
}

/// First 128 bits of `sha256(uri)`.
fn cache_key(uri: &str) -> [u8; 16] {
    let digest = Sha256::digest(uri.as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

fn tree_name(generation: u64) -> String {
    format!("{}{}", TREE_PREFIX, generation)
}

fn decode_generation(raw: &[u8]) -> Result<u64, CacheError> {
    <[u8; 8]>::try_from(raw)
        .map(u64::from_be_bytes)
        .map_err(|_| CacheError::CorruptGeneration)
}

fn decode_entry(raw: &[u8]) -> Result<CacheEntry, CacheError> {
    let (entry, _): (CacheEntry, _) = decode_from_slice(raw, bincode_config())?;
    Ok(entry)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
