//! Observation of a single backend job.
//!
//! A [`JobTracker`] owns one job id. On start it does a one-shot status
//! check, then walks its ordered strategy list (normally push, then poll),
//! advancing only when the current strategy fails. Every observed status
//! replaces the canonical record and goes to the listener. The first
//! terminal status stops the active strategy; nothing is observed after it.
//!
//! ```text
//! idle ─► observing(push) ─► observing(poll) ─► terminal
//!   └──────────┴─────────────────┴──────────────► terminal | stopped
//! ```

use std::sync::Arc;

use pulseboard_types::{JobId, JobRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::JobApi;
use crate::transport::{Transport, TransportEvent, TransportKind};

/// Where a tracker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    Observing(TransportKind),
    /// The job reached `completed`, `failed` or `cancelled`.
    Terminal,
    /// Observation was stopped from outside, or every strategy failed.
    Stopped,
}

impl TrackerPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Terminal | Self::Stopped)
    }
}

/// Delivered to the tracker's listener.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Observed(JobRecord),
    /// Every strategy failed; the tracker has stopped.
    Exhausted,
}

pub type Listener = Arc<dyn Fn(TrackerEvent) + Send + Sync>;

pub struct JobTracker {
    job_id: JobId,
    api: Arc<dyn JobApi>,
    strategies: Vec<Arc<dyn Transport>>,
    phase_tx: Arc<watch::Sender<TrackerPhase>>,
    record_tx: Arc<watch::Sender<Option<JobRecord>>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl JobTracker {
    pub fn new(job_id: JobId, api: Arc<dyn JobApi>, strategies: Vec<Arc<dyn Transport>>) -> Self {
        let (phase_tx, _) = watch::channel(TrackerPhase::Idle);
        let (record_tx, _) = watch::channel(None);
        Self {
            job_id,
            api,
            strategies,
            phase_tx: Arc::new(phase_tx),
            record_tx: Arc::new(record_tx),
            stop: CancellationToken::new(),
            task: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Start observing. A tracker starts at most once; later calls (and
    /// calls after `stop`) are no-ops returning `false`.
    pub fn start<F>(&mut self, listener: F) -> bool
    where
        F: Fn(TrackerEvent) + Send + Sync + 'static,
    {
        if self.task.is_some() || self.stop.is_cancelled() {
            return false;
        }
        let run = TrackerRun {
            job_id: self.job_id.clone(),
            api: Arc::clone(&self.api),
            strategies: self.strategies.clone(),
            phase_tx: Arc::clone(&self.phase_tx),
            record_tx: Arc::clone(&self.record_tx),
            stop: self.stop.clone(),
            listener: Arc::new(listener),
        };
        self.task = Some(tokio::spawn(run.drive()));
        true
    }

    /// Stop observing without implying anything about the job itself.
    /// The active strategy is cancelled synchronously.
    ///
    /// No listener call starts after this returns, but one already running
    /// on another thread may still finish afterwards. [`crate::JobRegistry`]
    /// serializes its listener against shutdown for the stricter guarantee.
    pub fn stop(&self) {
        self.stop.cancel();
        self.phase_tx.send_if_modified(|phase| {
            if phase.is_finished() {
                return false;
            }
            *phase = TrackerPhase::Stopped;
            true
        });
    }

    pub fn phase(&self) -> TrackerPhase {
        *self.phase_tx.borrow()
    }

    /// Attached strategy, if observing.
    pub fn transport(&self) -> Option<TransportKind> {
        match self.phase() {
            TrackerPhase::Observing(kind) => Some(kind),
            _ => None,
        }
    }

    /// Latest observed record.
    pub fn record(&self) -> Option<JobRecord> {
        self.record_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JobRecord>> {
        self.record_tx.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<TrackerPhase> {
        self.phase_tx.subscribe()
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether to keep observing after a status.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminal,
    /// Already finished (stopped or terminal); drop the status.
    Closed,
}

/// How one strategy's run ended.
enum Exit {
    Terminal,
    Stopped,
    Failed,
}

/// State owned by the spawned observation task.
struct TrackerRun {
    job_id: JobId,
    api: Arc<dyn JobApi>,
    strategies: Vec<Arc<dyn Transport>>,
    phase_tx: Arc<watch::Sender<TrackerPhase>>,
    record_tx: Arc<watch::Sender<Option<JobRecord>>>,
    stop: CancellationToken,
    listener: Listener,
}

impl TrackerRun {
    async fn drive(self) {
        // One-shot check: an already finished job never opens a transport.
        let initial = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return,
            result = self.api.job_status(&self.job_id) => result,
        };
        match initial {
            Ok(record) => {
                if self.observe(record) != Flow::Continue {
                    return;
                }
            }
            Err(e) if e.is_not_found() => {
                error!(job_id = %self.job_id, "backend has no such job, not observing");
                self.give_up();
                return;
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "initial status check failed");
            }
        }

        for strategy in &self.strategies {
            let kind = strategy.kind();
            if !self.enter(kind) {
                return;
            }
            info!(job_id = %self.job_id, transport = %kind, "observing job");

            let (tx, mut rx) = mpsc::unbounded_channel();
            let handle = strategy.start(&self.job_id, tx, self.stop.child_token());

            let exit = loop {
                let event = tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break Exit::Stopped,
                    event = rx.recv() => event,
                };
                match event {
                    Some(TransportEvent::Update(record)) => match self.observe(record) {
                        Flow::Continue => {}
                        Flow::Terminal => break Exit::Terminal,
                        Flow::Closed => break Exit::Stopped,
                    },
                    Some(TransportEvent::Failed(e)) => {
                        warn!(job_id = %self.job_id, transport = %kind, error = %e, "transport failed, falling back");
                        break Exit::Failed;
                    }
                    None => {
                        warn!(job_id = %self.job_id, transport = %kind, "transport ended before a terminal status, falling back");
                        break Exit::Failed;
                    }
                }
            };
            handle.stop();

            match exit {
                Exit::Failed => continue,
                Exit::Terminal | Exit::Stopped => return,
            }
        }

        error!(job_id = %self.job_id, "every transport failed, job no longer observed");
        self.give_up();
    }

    /// Stop on our own and report [`TrackerEvent::Exhausted`], unless the
    /// tracker already finished.
    fn give_up(&self) {
        let stopped = self.phase_tx.send_if_modified(|phase| {
            if phase.is_finished() {
                return false;
            }
            *phase = TrackerPhase::Stopped;
            true
        });
        if stopped && !self.stop.is_cancelled() {
            (self.listener)(TrackerEvent::Exhausted);
        }
    }

    /// Attach `kind`, unless the tracker was stopped meanwhile.
    fn enter(&self, kind: TransportKind) -> bool {
        let mut entered = false;
        self.phase_tx.send_if_modified(|phase| {
            if phase.is_finished() {
                return false;
            }
            *phase = TrackerPhase::Observing(kind);
            entered = true;
            true
        });
        entered
    }

    /// Apply one observed status, in receipt order.
    fn observe(&self, record: JobRecord) -> Flow {
        if record.job_id != self.job_id {
            warn!(job_id = %self.job_id, record_job_id = %record.job_id, "ignoring status for another job");
            return Flow::Continue;
        }
        if self.stop.is_cancelled() {
            return Flow::Closed;
        }

        let terminal = record.is_terminal();
        let mut accepted = false;
        self.phase_tx.send_if_modified(|phase| {
            if phase.is_finished() {
                return false;
            }
            accepted = true;
            if terminal {
                *phase = TrackerPhase::Terminal;
                return true;
            }
            false
        });
        if !accepted {
            return Flow::Closed;
        }
        // `stop` may have run on another thread since the first check.
        if self.stop.is_cancelled() {
            return Flow::Closed;
        }

        debug!(job_id = %self.job_id, status = %record.status, stage = record.progress.stage(), "job status observed");
        self.record_tx.send_replace(Some(record.clone()));
        (self.listener)(TrackerEvent::Observed(record));

        if terminal {
            info!(job_id = %self.job_id, "job reached terminal status, tracking stopped");
            Flow::Terminal
        } else {
            Flow::Continue
        }
    }
}
