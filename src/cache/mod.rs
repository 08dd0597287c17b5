//! Content-addressed file cache backing input materialization.
//!
//! Blobs are fetched from the CAS on demand and written to stable paths
//! under the cache root, keyed by `(digest, is_executable)`. Execution
//! directories hard-link against those paths, so the cache and the
//! execution directories must share a filesystem.
//!
//! Resource discipline:
//! - **Budget**: accounted bytes (resident entries plus reservations for
//!   in-flight fetches) never exceed `max_size_bytes`.
//! - **Pinning**: `put` pins the entry by incrementing its reference
//!   count; pinned entries are never evicted. `update` releases a batch
//!   of pins after the action's external publications.
//! - **Eviction**: unpinned entries go in LRU order of their release
//!   timestamp until the incoming entry fits.
//! - **Coalescing**: at most one fetch per key is in flight; concurrent
//!   callers wait on the fetch gate and then observe the resident entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::digest::{Digest, DigestBuilder};
use crate::instance::ByteSource;

/// Where the cache reads blob bytes from on a miss.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn open(&self, digest: &Digest) -> std::io::Result<ByteSource>;
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no space for {digest} within cache budget")]
    NoSpace { digest: Digest },

    #[error("fetch of {digest} failed: {source}")]
    Fetch {
        digest: Digest,
        source: std::io::Error,
    },

    #[error("fetched content for {digest} hashed to {actual}")]
    ContentMismatch { digest: Digest, actual: Digest },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable identity of a cache entry, derived from `(digest, is_executable)`.
/// The same content with differing executable bits occupies distinct entries.
pub type CacheKey = String;

fn cache_key(digest: &Digest, is_executable: bool) -> CacheKey {
    if is_executable {
        format!("{}_{}_exec", digest.hash, digest.size_bytes)
    } else {
        format!("{}_{}", digest.hash, digest.size_bytes)
    }
}

struct Entry {
    size_bytes: u64,
    ref_count: usize,
    last_released_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    /// Fetch gate per in-flight key. The fetcher holds the gate lock for
    /// the duration of the fetch; waiters queue on it and retry.
    in_flight: HashMap<CacheKey, Arc<Mutex<()>>>,
    /// Resident bytes plus reservations for in-flight fetches.
    used_bytes: u64,
}

pub struct CasFileCache {
    root: PathBuf,
    max_size_bytes: u64,
    blobs: Arc<dyn BlobSource>,
    state: Mutex<CacheState>,
}

impl CasFileCache {
    pub fn new(root: PathBuf, max_size_bytes: u64, blobs: Arc<dyn BlobSource>) -> Self {
        Self {
            root,
            max_size_bytes,
            blobs,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Initialize the on-disk root. Cache state is memory-resident; files
    /// left by a previous process are not reconciled.
    pub async fn start(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Stable path of an entry, suitable for hard-linking.
    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Ensure the content is resident and pinned; returns the cache key.
    ///
    /// Idempotent per `(digest, is_executable)`: repeated calls return the
    /// same key and each adds one pin. Fails when the entry cannot fit
    /// even after evicting every unpinned entry, or when the fetch fails.
    pub async fn put(&self, digest: &Digest, is_executable: bool) -> Result<CacheKey, CacheError> {
        let key = cache_key(digest, is_executable);
        loop {
            let guard;
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.ref_count += 1;
                    return Ok(key);
                }
                if let Some(pending) = state.in_flight.get(&key) {
                    let pending = Arc::clone(pending);
                    drop(state);
                    let _wait = pending.lock().await;
                    continue;
                }
                self.reserve(&mut state, digest).await?;
                let gate = Arc::new(Mutex::new(()));
                // Fresh mutex: acquiring here cannot block.
                guard = Arc::clone(&gate).lock_owned().await;
                state.in_flight.insert(key.clone(), gate);
            }

            let fetched = self.fetch(digest, is_executable, &key).await;

            let mut state = self.state.lock().await;
            state.in_flight.remove(&key);
            match fetched {
                Ok(()) => {
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            size_bytes: digest.size_bytes,
                            ref_count: 1,
                            last_released_at: Utc::now(),
                        },
                    );
                    drop(state);
                    drop(guard);
                    return Ok(key);
                }
                Err(err) => {
                    state.used_bytes -= digest.size_bytes;
                    drop(state);
                    drop(guard);
                    return Err(err);
                }
            }
        }
    }

    /// Release one pin per key in the batch. Entries reaching zero pins
    /// get a fresh release timestamp and become eviction candidates.
    pub async fn update(&self, keys: &[CacheKey]) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for key in keys {
            match state.entries.get_mut(key) {
                Some(entry) if entry.ref_count > 0 => {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 {
                        entry.last_released_at = now;
                    }
                }
                Some(_) => {
                    tracing::warn!(key = %key, "Released cache entry with zero references");
                }
                None => {
                    tracing::warn!(key = %key, "Released unknown cache key");
                }
            }
        }
    }

    /// Accounted bytes: resident entries plus in-flight reservations.
    pub async fn used_bytes(&self) -> u64 {
        self.state.lock().await.used_bytes
    }

    /// Reserve `digest.size_bytes` within the budget, evicting unpinned
    /// entries in LRU order of release time as needed. Caller holds the
    /// state lock.
    async fn reserve(&self, state: &mut CacheState, digest: &Digest) -> Result<(), CacheError> {
        let size = digest.size_bytes;
        if size > self.max_size_bytes {
            return Err(CacheError::NoSpace {
                digest: digest.clone(),
            });
        }
        while state.used_bytes + size > self.max_size_bytes {
            let victim = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.ref_count == 0)
                .min_by_key(|(_, entry)| entry.last_released_at)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                return Err(CacheError::NoSpace {
                    digest: digest.clone(),
                });
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.used_bytes -= entry.size_bytes;
                if let Err(err) = tokio::fs::remove_file(self.path(&victim)).await {
                    tracing::warn!(key = %victim, error = %err, "Failed to remove evicted entry");
                }
                tracing::debug!(key = %victim, freed = entry.size_bytes, "Evicted cache entry");
            }
        }
        state.used_bytes += size;
        Ok(())
    }

    /// Fetch the blob to a temp file, verify its digest, set the
    /// executable bit, and rename into place.
    async fn fetch(
        &self,
        digest: &Digest,
        is_executable: bool,
        key: &str,
    ) -> Result<(), CacheError> {
        let mut source = self
            .blobs
            .open(digest)
            .await
            .map_err(|source| CacheError::Fetch {
                digest: digest.clone(),
                source,
            })?;

        let temp = self.root.join(format!("tmp-{}", Uuid::new_v4()));
        let written = self
            .write_temp(&mut source, digest, &temp, is_executable)
            .await;
        match written {
            Ok(()) => {
                tokio::fs::rename(&temp, self.path(key)).await?;
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }

    async fn write_temp(
        &self,
        source: &mut ByteSource,
        digest: &Digest,
        temp: &Path,
        is_executable: bool,
    ) -> Result<(), CacheError> {
        let mut file = tokio::fs::File::create(temp).await?;
        let mut builder = DigestBuilder::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = source.read(&mut buf).await.map_err(|source| CacheError::Fetch {
                digest: digest.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            builder.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = builder.finish();
        if actual != *digest {
            return Err(CacheError::ContentMismatch {
                digest: digest.clone(),
                actual,
            });
        }

        if is_executable {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(temp, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(())
    }
}
