//! Typed handles onto a cache entry.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use super::entry::{EntrySnapshot, FetchOutcome};
use super::QueryCache;
use crate::error::QueryError;

/// Current state of a query as seen by one subscriber.
#[derive(Debug)]
pub struct QueryState<T> {
    /// Last successfully fetched value. Kept across later failures.
    pub value: Option<Arc<T>>,
    /// Message of the most recent failed fetch, cleared by the next success.
    pub error: Option<String>,
    /// A fetch for this key is in flight.
    pub is_loading: bool,
    pub updated_at: Option<Instant>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
            is_loading: self.is_loading,
            updated_at: self.updated_at,
        }
    }
}

impl<T: Any + Send + Sync> QueryState<T> {
    fn from_snapshot(key: &str, snapshot: EntrySnapshot) -> Self {
        let mut error = snapshot.error;
        let value = match snapshot.value.map(|v| v.downcast::<T>()) {
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => {
                error = Some(QueryError::TypeMismatch(key.to_string()).to_string());
                None
            }
            None => None,
        };
        Self {
            value,
            error,
            is_loading: snapshot.is_loading,
            updated_at: snapshot.updated_at,
        }
    }
}

/// A fetch that can be awaited for its outcome.
pub struct PendingFetch {
    rx: watch::Receiver<Option<FetchOutcome>>,
}

impl PendingFetch {
    pub(crate) fn new(rx: watch::Receiver<Option<FetchOutcome>>) -> Self {
        Self { rx }
    }

    pub(crate) async fn wait(mut self) -> FetchOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(QueryError::Cancelled)),
            // The cache was dropped with this fetch still running.
            Err(_) => Err(QueryError::Cancelled),
        }
    }

    /// Wait until the fetch succeeds, fails or is cancelled.
    pub async fn outcome(self) -> Result<(), QueryError> {
        self.wait().await.map(|_| ())
    }
}

/// One reader's attachment to a cache key.
///
/// Holding a `Subscription` counts as one subscriber; dropping it detaches.
/// When the last subscriber detaches while a fetch is in flight, the fetch
/// is cancelled. Cloning attaches another subscriber.
pub struct Subscription<T> {
    cache: QueryCache,
    key: String,
    rx: watch::Receiver<EntrySnapshot>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> Subscription<T> {
    pub(crate) fn new(cache: QueryCache, key: String, rx: watch::Receiver<EntrySnapshot>) -> Self {
        Self {
            cache,
            key,
            rx,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current `{value, error, is_loading}`.
    pub fn state(&self) -> QueryState<T> {
        let snapshot = self.rx.borrow().clone();
        QueryState::from_snapshot(&self.key, snapshot)
    }

    /// Wait for the entry to change, then return the new state.
    pub async fn changed(&mut self) -> QueryState<T> {
        // An error only means the cache is gone; the last state still stands.
        let _ = self.rx.changed().await;
        let snapshot = self.rx.borrow_and_update().clone();
        QueryState::from_snapshot(&self.key, snapshot)
    }

    /// Cancel whatever is in flight for this key and fetch again.
    pub fn refresh(&self) -> Option<PendingFetch> {
        self.cache.force_refresh(&self.key)
    }

    /// Outcome of the fetch currently in flight, or the entry's settled
    /// state if nothing is running.
    pub async fn settled(&self) -> Result<Arc<T>, QueryError> {
        match self.cache.pending_fetch(&self.key) {
            Some(pending) => {
                let value = pending.wait().await?;
                value
                    .downcast::<T>()
                    .map_err(|_| QueryError::TypeMismatch(self.key.clone()))
            }
            None => {
                let state = self.state();
                match (state.value, state.error) {
                    (_, Some(error)) => Err(QueryError::Failed(error)),
                    (Some(value), None) => Ok(value),
                    (None, None) => Err(QueryError::Cancelled),
                }
            }
        }
    }
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        self.cache.attach(&self.key);
        Self {
            cache: self.cache.clone(),
            key: self.key.clone(),
            rx: self.rx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cache.detach(&self.key);
    }
}
