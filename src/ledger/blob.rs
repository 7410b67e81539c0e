//! Content-addressed blob fetching with an in-process cache.
//!
//! Blobs never change once published, so a cached entry is never invalidated. Hashes the
//! ledger reports as unknown are remembered and not queried again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::debug;

use super::client::BlobSource;
use super::types::LedgerError;

type BlobCell = Arc<OnceCell<Arc<Vec<u8>>>>;

/// Shared, hash-keyed blob cache in front of a [`BlobSource`]
pub struct BlobFetcher {
    source: Arc<dyn BlobSource>,
    cache: Mutex<HashMap<String, BlobCell>>,
    missing: Mutex<HashSet<String>>,
    network_reads: AtomicU64,
}

impl BlobFetcher {
    pub fn new(source: Arc<dyn BlobSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            network_reads: AtomicU64::new(0),
        }
    }

    /// Resolve a hash to its bytes.
    ///
    /// Concurrent callers for the same hash share a single in-flight read. Network failures
    /// are not cached; the next call retries.
    pub async fn fetch(&self, hash: &str) -> Result<Arc<Vec<u8>>, LedgerError> {
        if self
            .missing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
        {
            return Err(LedgerError::BlobNotFound(hash.to_string()));
        }

        let cell = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash.to_string())
            .or_default()
            .clone();

        let result = cell
            .get_or_try_init(|| async {
                self.network_reads.fetch_add(1, Ordering::Relaxed);
                debug!("Fetching blob {} from ledger", hash);
                self.source.read_blob(hash).await.map(Arc::new)
            })
            .await;

        match result {
            Ok(bytes) => Ok(bytes.clone()),
            Err(LedgerError::BlobNotFound(missing)) => {
                self.missing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(hash.to_string());
                self.forget(hash, &cell);
                Err(LedgerError::BlobNotFound(missing))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop an empty cell so an unknown hash lives only in the negative set
    fn forget(&self, hash: &str, cell: &BlobCell) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache
            .get(hash)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized())
        {
            cache.remove(hash);
        }
    }

    #[cfg(test)]
    fn cached_hashes(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of reads that reached the blob source
    pub fn network_reads(&self) -> u64 {
        self.network_reads.load(Ordering::Relaxed)
    }
}
