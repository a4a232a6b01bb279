//! Per-key cache state.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

pub(crate) type ErasedFetcher =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<AnyValue, String>> + Send + Sync>;

pub(crate) type FetchOutcome = Result<AnyValue, QueryError>;

/// What subscribers see of an entry.
#[derive(Clone, Default)]
pub(crate) struct EntrySnapshot {
    pub value: Option<AnyValue>,
    pub error: Option<String>,
    pub is_loading: bool,
    pub updated_at: Option<Instant>,
}

/// A fetch that has been started and not yet settled.
///
/// The token and the outcome channel live together, so an entry can never
/// hold a fetch without the means to cancel it.
pub(crate) struct InFlight {
    pub id: u64,
    pub token: CancellationToken,
    pub outcome_tx: watch::Sender<Option<FetchOutcome>>,
}

impl InFlight {
    /// Cancel the fetch and tell anyone awaiting it.
    pub fn cancel(self) {
        self.token.cancel();
        self.outcome_tx.send_replace(Some(Err(QueryError::Cancelled)));
    }
}

pub(crate) struct CacheEntry {
    pub value: Option<AnyValue>,
    pub error: Option<String>,
    pub updated_at: Option<Instant>,
    /// Set by `invalidate`; the next read refetches even inside the window.
    pub invalidated: bool,
    pub in_flight: Option<InFlight>,
    pub subscribers: usize,
    /// Most recently registered fetcher, reused by `force_refresh`.
    pub fetcher: Option<ErasedFetcher>,
    state_tx: watch::Sender<EntrySnapshot>,
}

impl CacheEntry {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(EntrySnapshot::default());
        Self {
            value: None,
            error: None,
            updated_at: None,
            invalidated: false,
            in_flight: None,
            subscribers: 0,
            fetcher: None,
            state_tx,
        }
    }

    pub fn is_fresh(&self, freshness: Duration) -> bool {
        if self.invalidated {
            return false;
        }
        self.updated_at
            .is_some_and(|at| at.elapsed() < freshness)
    }

    pub fn take_in_flight(&mut self, id: u64) -> Option<InFlight> {
        if self.in_flight.as_ref().map(|f| f.id) != Some(id) {
            return None;
        }
        self.in_flight.take()
    }

    /// Cancel the current fetch, if any. Returns whether one was running.
    pub fn cancel_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(flight) => {
                flight.cancel();
                true
            }
            None => false,
        }
    }

    pub fn outcome_rx(&self) -> Option<watch::Receiver<Option<FetchOutcome>>> {
        self.in_flight.as_ref().map(|f| f.outcome_tx.subscribe())
    }

    pub fn subscribe(&self) -> watch::Receiver<EntrySnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            value: self.value.clone(),
            error: self.error.clone(),
            is_loading: self.in_flight.is_some(),
            updated_at: self.updated_at,
        }
    }

    /// Push the current state to every subscriber.
    pub fn publish(&self) {
        self.state_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flight(id: u64) -> (InFlight, watch::Receiver<Option<FetchOutcome>>) {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let flight = InFlight {
            id,
            token: CancellationToken::new(),
            outcome_tx,
        };
        (flight, outcome_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_window() {
        let mut entry = CacheEntry::new();
        assert!(!entry.is_fresh(Duration::from_secs(60)));

        entry.updated_at = Some(Instant::now());
        assert!(entry.is_fresh(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!entry.is_fresh(Duration::from_secs(60)));
        assert!(entry.is_fresh(Duration::from_secs(120)));

        entry.invalidated = true;
        assert!(!entry.is_fresh(Duration::from_secs(120)));
    }

    #[test]
    fn test_take_in_flight_checks_identity() {
        let mut entry = CacheEntry::new();
        let (f, _rx) = flight(7);
        entry.in_flight = Some(f);

        assert!(entry.take_in_flight(6).is_none());
        assert!(entry.in_flight.is_some());
        assert!(entry.take_in_flight(7).is_some());
        assert!(entry.in_flight.is_none());
    }

    #[test]
    fn test_cancel_in_flight_reports_cancelled() {
        let mut entry = CacheEntry::new();
        let (f, rx) = flight(1);
        let token = f.token.clone();
        entry.in_flight = Some(f);

        assert!(entry.cancel_in_flight());
        assert!(token.is_cancelled());
        let outcome = rx.borrow().clone();
        assert!(matches!(outcome, Some(Err(QueryError::Cancelled))));
        assert!(!entry.cancel_in_flight());
    }

    #[test]
    fn test_snapshot_reflects_loading() {
        let mut entry = CacheEntry::new();
        let rx = entry.subscribe();
        assert!(!entry.snapshot().is_loading);

        let (f, _outcome) = flight(1);
        entry.in_flight = Some(f);
        entry.publish();
        assert!(rx.borrow().is_loading);
    }
}
