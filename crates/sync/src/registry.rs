//! Tracks many jobs at once on behalf of a dashboard view.
//!
//! The registry owns one [`JobTracker`] per tracked job id and keeps the
//! latest [`JobRecord`] of every job it has seen for rendering. A tracked id
//! sits in the pending set until its first status arrives. A completion hook
//! runs exactly once per terminal transition; consumers that re-render on
//! every change use [`JobRegistry::subscribe`].
//!
//! Dropping the registry (or calling [`JobRegistry::shutdown`]) stops every
//! tracker. No hook or event fires after shutdown returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use pulseboard_types::{JobId, JobRecord};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::JobApi;
use crate::config::SyncConfig;
use crate::error::ApiError;
use crate::tracker::{JobTracker, TrackerEvent};
use crate::transport::{PollTransport, PushTransport, Transport, TransportKind};

const EVENT_CAPACITY: usize = 256;

/// Runs once per job per terminal transition.
pub type CompletionHook = Arc<dyn Fn(&JobRecord) + Send + Sync>;

/// Change notifications for reactive consumers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A status was observed (or loaded) and stored.
    Updated(JobRecord),
    /// The job reached a terminal status and is no longer tracked.
    Finished(JobRecord),
    /// Tracking stopped without a terminal status.
    Untracked(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Tracking requested, no status observed yet.
    Pending,
    Tracking,
}

/// Result of storing a record outside of observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stored {
    Stored,
    /// The registry's own record wins.
    Kept,
    Closed,
}

struct Slot {
    tracker: JobTracker,
    state: SlotState,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<JobId, JobRecord>,
    slots: HashMap<JobId, Slot>,
    closed: bool,
}

struct RegistryInner {
    api: Arc<dyn JobApi>,
    strategies: Vec<Arc<dyn Transport>>,
    on_complete: Mutex<Option<CompletionHook>>,
    events: broadcast::Sender<RegistryEvent>,
    state: Mutex<RegistryState>,
    /// Held while hooks run; shutdown takes it to wait them out.
    dispatch: Mutex<()>,
}

pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    /// Registry whose trackers walk `strategies` in order.
    pub fn new(api: Arc<dyn JobApi>, strategies: Vec<Arc<dyn Transport>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                api,
                strategies,
                on_complete: Mutex::new(None),
                events,
                state: Mutex::new(RegistryState::default()),
                dispatch: Mutex::new(()),
            }),
        }
    }

    /// Push first, polling at `config.poll_interval` as the fallback.
    pub fn from_config(config: &SyncConfig, api: Arc<dyn JobApi>) -> Self {
        let strategies: Vec<Arc<dyn Transport>> = vec![
            Arc::new(PushTransport::from_config(config)),
            Arc::new(PollTransport::new(Arc::clone(&api), config.poll_interval)),
        ];
        Self::new(api, strategies)
    }

    /// Replace the completion hook. The hook runs on a tracker task and must
    /// not call [`JobRegistry::shutdown`].
    pub fn set_completion_hook<F>(&self, hook: F)
    where
        F: Fn(&JobRecord) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_complete, "completion hook") = Some(Arc::new(hook));
    }

    pub fn with_completion_hook<F>(self, hook: F) -> Self
    where
        F: Fn(&JobRecord) + Send + Sync + 'static,
    {
        self.set_completion_hook(hook);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Start observing `job_id`. Tracking an already tracked id does
    /// nothing. Returns `false` once the registry is shut down.
    pub fn track(&self, job_id: impl Into<JobId>) -> bool {
        let job_id = job_id.into();
        let mut state = self.inner.state();
        if state.closed {
            warn!(job_id = %job_id, "registry is shut down, not tracking");
            return false;
        }
        if state.slots.contains_key(&job_id) {
            debug!(job_id = %job_id, "already tracked");
            return true;
        }

        let mut tracker = JobTracker::new(
            job_id.clone(),
            Arc::clone(&self.inner.api),
            self.inner.strategies.clone(),
        );
        let weak = Arc::downgrade(&self.inner);
        let listener_id = job_id.clone();
        tracker.start(move |event| on_tracker_event(&weak, &listener_id, event));

        state.slots.insert(
            job_id.clone(),
            Slot {
                tracker,
                state: SlotState::Pending,
            },
        );
        info!(job_id = %job_id, tracked = state.slots.len(), "tracking job");
        true
    }

    /// Stop observing `job_id`, keeping its last record. Returns whether it
    /// was tracked.
    pub fn stop_tracking(&self, job_id: &JobId) -> bool {
        let removed = self.inner.state().slots.remove(job_id);
        match removed {
            Some(slot) => {
                slot.tracker.stop();
                info!(job_id = %job_id, "stopped tracking job");
                let _ = self.inner.events.send(RegistryEvent::Untracked(job_id.clone()));
                true
            }
            None => false,
        }
    }

    /// Ask the backend to cancel `job_id`. The acknowledgement is stored,
    /// and the job is tracked so its final status arrives through
    /// observation.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<JobRecord, ApiError> {
        let ack = self.inner.api.cancel_job(job_id).await?;
        info!(job_id = %job_id, status = %ack.status, "cancel requested");

        if self.is_tracking(job_id) {
            self.inner.apply(job_id, ack.clone());
        } else if self.inner.store(ack.clone()) == Stored::Stored && !ack.is_terminal() {
            self.track(job_id.clone());
        }
        Ok(ack)
    }

    /// Store a listing of jobs and track the active ones.
    ///
    /// A record for an id that is tracked, or that this registry already saw
    /// finish, is skipped: observation is newer than any listing. Returns how
    /// many jobs started being tracked.
    pub fn load_jobs(&self, records: impl IntoIterator<Item = JobRecord>) -> usize {
        let mut started = 0;
        for record in records {
            let job_id = record.job_id.clone();
            let active = record.status.is_active();
            match self.inner.store(record) {
                Stored::Closed => break,
                Stored::Kept => continue,
                Stored::Stored => {}
            }
            if active && self.track(job_id) {
                started += 1;
            }
        }
        debug!(started, "jobs loaded");
        started
    }

    /// Fetch the recent-jobs listing and feed it to [`Self::load_jobs`].
    pub async fn load_recent(&self, limit: usize) -> Result<usize, ApiError> {
        let records = self.inner.api.recent_jobs(limit).await?;
        info!(count = records.len(), "recent jobs fetched");
        Ok(self.load_jobs(records))
    }

    pub fn record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.inner.state().records.get(job_id).cloned()
    }

    /// All known records, ordered by job id.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.inner.state().records.values().cloned().collect();
        records.sort_by(|a, b| a.job_id.as_str().cmp(b.job_id.as_str()));
        records
    }

    /// Tracked ids still waiting for their first status, ordered by job id.
    pub fn pending(&self) -> Vec<JobId> {
        let mut pending: Vec<JobId> = self
            .inner
            .state()
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        pending.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        pending
    }

    pub fn is_pending(&self, job_id: &JobId) -> bool {
        self.inner
            .state()
            .slots
            .get(job_id)
            .is_some_and(|slot| slot.state == SlotState::Pending)
    }

    pub fn is_tracking(&self, job_id: &JobId) -> bool {
        self.inner.state().slots.contains_key(job_id)
    }

    /// Strategy currently attached to `job_id`, if any.
    pub fn transport_of(&self, job_id: &JobId) -> Option<TransportKind> {
        self.inner
            .state()
            .slots
            .get(job_id)
            .and_then(|slot| slot.tracker.transport())
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().slots.len()
    }

    /// Stop every tracker. Idempotent; later `track` calls are refused.
    pub fn shutdown(&self) {
        let slots = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        for slot in slots.values() {
            slot.tracker.stop();
        }
        // Wait out a hook that passed its closed check before we flipped it.
        drop(lock(&self.inner.dispatch, "dispatch gate"));
        info!(stopped = slots.len(), "job registry shut down");
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RegistryInner {
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state, "registry state")
    }

    /// Store a record that did not come from observation (a listing or a
    /// cancel acknowledgement). Tracked jobs and jobs already seen finished
    /// keep what they have: a finished job never goes back to active.
    fn store(&self, record: JobRecord) -> Stored {
        let mut state = self.state();
        if state.closed {
            return Stored::Closed;
        }
        if state.slots.contains_key(&record.job_id) {
            return Stored::Kept;
        }
        if let Some(existing) = state.records.get(&record.job_id) {
            if existing.is_terminal() {
                debug!(job_id = %record.job_id, status = %existing.status, "keeping finished record");
                return Stored::Kept;
            }
        }
        state.records.insert(record.job_id.clone(), record.clone());
        let _ = self.events.send(RegistryEvent::Updated(record));
        Stored::Stored
    }

    /// Apply an observed status for a tracked job.
    fn apply(&self, job_id: &JobId, record: JobRecord) {
        let _gate = lock(&self.dispatch, "dispatch gate");
        let terminal = record.is_terminal();

        let (finished, first_finish) = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let was_finished = state.records.get(job_id).is_some_and(JobRecord::is_terminal);
            let Some(slot) = state.slots.get_mut(job_id) else {
                // Untracked while the status was in flight.
                return;
            };
            slot.state = SlotState::Tracking;
            state.records.insert(job_id.clone(), record.clone());
            // Sent under the lock so a reader that sees the slot gone also
            // finds these events queued.
            let _ = self.events.send(RegistryEvent::Updated(record.clone()));
            if terminal {
                // Re-tracking a job seen finished is not a new transition.
                let event = if was_finished {
                    RegistryEvent::Untracked(job_id.clone())
                } else {
                    RegistryEvent::Finished(record.clone())
                };
                let _ = self.events.send(event);
                (state.slots.remove(job_id), !was_finished)
            } else {
                (None, false)
            }
        };

        let Some(slot) = finished else {
            return;
        };
        slot.tracker.stop();
        if !first_finish {
            debug!(job_id = %job_id, "job was already finished, completion hook skipped");
            return;
        }
        info!(job_id = %job_id, status = %record.status, "job finished");
        let hook = lock(&self.on_complete, "completion hook").clone();
        if let Some(hook) = hook {
            hook(&record);
        }
    }

    /// Drop a tracker that gave up without a terminal status.
    fn abandon(&self, job_id: &JobId) {
        let removed = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let removed = state.slots.remove(job_id);
            if removed.is_some() {
                let _ = self.events.send(RegistryEvent::Untracked(job_id.clone()));
            }
            removed
        };
        if removed.is_some() {
            error!(job_id = %job_id, "job can no longer be observed, untracked");
        }
    }
}

fn on_tracker_event(registry: &Weak<RegistryInner>, job_id: &JobId, event: TrackerEvent) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    match event {
        TrackerEvent::Observed(record) => inner.apply(job_id, record),
        TrackerEvent::Exhausted => inner.abandon(job_id),
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("{what} lock poisoned, recovering");
        poisoned.into_inner()
    })
}
