//! Stale-while-revalidate read cache with request deduplication.
//!
//! Provides:
//! - `QueryCache`: the store, one per application root
//! - `Subscription`: a reader's reference-counted attachment to one key
//! - `QueryState`: `{value, error, is_loading}` as seen by a reader
//! - `PendingFetch`: awaitable outcome of one fetch
//!
//! At most one fetch per key is in flight at a time. All state changes
//! happen under a `std::sync::Mutex` that is never held across an await,
//! so a check and the mutation that depends on it are never split.

mod entry;
mod subscription;

pub use subscription::{PendingFetch, QueryState, Subscription};

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use entry::{AnyValue, CacheEntry, ErasedFetcher};

/// Process-wide query store. Cheap to clone; clones share the same entries.
///
/// Construct one at the application root and hand it to every reader.
/// Fetches are spawned on the ambient tokio runtime. Entries live as long
/// as the cache; call [`QueryCache::clear`] on teardown to cancel anything
/// still in flight.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    next_fetch_id: AtomicU64,
    default_freshness: Duration,
}

/// How a `read` was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPath {
    Fresh,
    Deduplicated,
    Fetching,
}

impl QueryCache {
    /// Create a cache whose reads default to `default_freshness`.
    pub fn new(default_freshness: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(1),
                default_freshness,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.inner.entries.lock().unwrap_or_else(|poisoned| {
            tracing::error!("query cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Read `key`, fetching with `fetcher` if the entry is missing or older
    /// than `freshness` (the cache default when `None`).
    ///
    /// - fresh entry: value now, `is_loading = false`, no fetch
    /// - stale entry: stale value now, `is_loading = true`, background
    ///   refresh unless one is already in flight (then it is shared)
    /// - no entry: `is_loading = true` until the first fetch settles
    ///
    /// The returned subscription counts as a subscriber until dropped.
    pub fn read<T, F, Fut, E>(
        &self,
        key: impl Into<String>,
        fetcher: F,
        freshness: Option<Duration>,
    ) -> Subscription<T>
    where
        T: Any + Send + Sync,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = key.into();
        let freshness = freshness.unwrap_or(self.inner.default_freshness);
        let fetcher = erase_fetcher(fetcher);

        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::new);
        entry.subscribers += 1;
        entry.fetcher = Some(fetcher);

        let path = if entry.is_fresh(freshness) {
            ReadPath::Fresh
        } else if entry.in_flight.is_some() {
            ReadPath::Deduplicated
        } else {
            self.start_fetch(&key, entry);
            ReadPath::Fetching
        };
        debug!(key = %key, path = ?path, subscribers = entry.subscribers, "cache read");

        let rx = entry.subscribe();
        drop(entries);
        Subscription::new(self.clone(), key, rx)
    }

    /// Cancel any in-flight fetch for `key` and start a new one with the
    /// most recently registered fetcher. The cancelled fetch's result is
    /// discarded even if it arrives later.
    ///
    /// Returns `None` if the key was never read, or if nobody is
    /// subscribed; in the latter case the entry is invalidated so the next
    /// read refetches.
    pub fn force_refresh(&self, key: &str) -> Option<PendingFetch> {
        let mut entries = self.entries();
        let entry = entries.get_mut(key)?;

        if entry.subscribers == 0 {
            entry.invalidated = true;
            debug!(key = %key, "force refresh without subscribers, entry invalidated");
            return None;
        }

        if entry.cancel_in_flight() {
            debug!(key = %key, "superseded in-flight fetch");
        }
        self.start_fetch(key, entry)
    }

    /// Mark `key` stale without fetching. The next read refetches.
    pub fn invalidate(&self, key: &str) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.invalidated = true;
        }
    }

    /// Cancel every in-flight fetch. Cached values are kept.
    pub fn clear(&self) {
        let mut entries = self.entries();
        let mut cancelled = 0usize;
        for entry in entries.values_mut() {
            if entry.cancel_in_flight() {
                entry.publish();
                cancelled += 1;
            }
        }
        debug!(cancelled, "query cache cleared");
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.entries().get(key).map_or(0, |e| e.subscribers)
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.entries()
            .get(key)
            .is_some_and(|e| e.in_flight.is_some())
    }

    pub(crate) fn pending_fetch(&self, key: &str) -> Option<PendingFetch> {
        self.entries()
            .get(key)
            .and_then(|e| e.outcome_rx())
            .map(PendingFetch::new)
    }

    pub(crate) fn attach(&self, key: &str) {
        if let Some(entry) = self.entries().get_mut(key) {
            entry.subscribers += 1;
        }
    }

    /// Drop one subscriber. The last one out cancels the in-flight fetch.
    pub(crate) fn detach(&self, key: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 && entry.cancel_in_flight() {
            debug!(key = %key, "last subscriber detached, fetch cancelled");
            entry.publish();
        }
    }

    /// Spawn a fetch for `entry`. Caller holds the entries lock.
    fn start_fetch(&self, key: &str, entry: &mut CacheEntry) -> Option<PendingFetch> {
        let fetcher = entry.fetcher.clone()?;
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        entry.in_flight = Some(entry::InFlight {
            id,
            token: token.clone(),
            outcome_tx,
        });
        entry.publish();

        let cache = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = fetcher(token.clone()) => result,
            };
            settle(cache, &key, id, result);
        });

        Some(PendingFetch::new(outcome_rx))
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("default_freshness", &self.inner.default_freshness)
            .finish_non_exhaustive()
    }
}

/// Commit a fetch result, unless the fetch was superseded or cancelled in
/// the meantime.
fn settle(cache: Weak<CacheInner>, key: &str, id: u64, result: Result<AnyValue, String>) {
    let Some(inner) = cache.upgrade() else {
        return;
    };
    let cache = QueryCache { inner };
    let mut entries = cache.entries();
    let Some(entry) = entries.get_mut(key) else {
        return;
    };
    let Some(flight) = entry.take_in_flight(id) else {
        debug!(key = %key, fetch_id = id, "discarding result of superseded fetch");
        return;
    };

    let outcome = match result {
        Ok(value) => {
            entry.value = Some(Arc::clone(&value));
            entry.error = None;
            entry.updated_at = Some(tokio::time::Instant::now());
            entry.invalidated = false;
            Ok(value)
        }
        Err(message) => {
            warn!(key = %key, error = %message, "cache fetch failed");
            entry.error = Some(message.clone());
            Err(crate::error::QueryError::Failed(message))
        }
    };
    flight.outcome_tx.send_replace(Some(outcome));
    entry.publish();
}

fn erase_fetcher<T, F, Fut, E>(fetcher: F) -> ErasedFetcher
where
    T: Any + Send + Sync,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Arc::new(move |token| {
        fetcher(token)
            .map(|result| {
                result
                    .map(|value| Arc::new(value) as AnyValue)
                    .map_err(|e| e.to_string())
            })
            .boxed()
    })
}
