//! Scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pulseboard_types::{JobId, JobKind, JobRecord, JobStatus};
use tokio_util::sync::CancellationToken;

use crate::api::JobApi;
use crate::error::{ApiError, TransportError};
use crate::transport::{Transport, TransportEvent, TransportHandle, TransportKind, UpdateSink};

pub(crate) fn record(id: &str, status: JobStatus) -> JobRecord {
    JobRecord::new(id, JobKind::Import, status)
}

/// `JobApi` answering from per-job queues of canned responses.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    statuses: Mutex<HashMap<JobId, VecDeque<Result<JobRecord, u16>>>>,
    fallbacks: Mutex<HashMap<JobId, JobRecord>>,
    recent: Mutex<Vec<JobRecord>>,
    cancelled: Mutex<Vec<JobId>>,
    status_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one status response for the record's job.
    pub fn push_status(&self, record: JobRecord) {
        self.statuses
            .lock()
            .unwrap()
            .entry(record.job_id.clone())
            .or_default()
            .push_back(Ok(record));
    }

    pub fn push_error(&self, job_id: &str, status: u16) {
        self.statuses
            .lock()
            .unwrap()
            .entry(JobId::from(job_id))
            .or_default()
            .push_back(Err(status));
    }

    /// Answer used once the job's queue is empty.
    pub fn set_fallback(&self, record: JobRecord) {
        self.fallbacks
            .lock()
            .unwrap()
            .insert(record.job_id.clone(), record);
    }

    pub fn set_recent(&self, records: Vec<JobRecord>) {
        *self.recent.lock().unwrap() = records;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobApi for ScriptedApi {
    async fn job_status(&self, job_id: &JobId) -> Result<JobRecord, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(job_id)
            .and_then(VecDeque::pop_front);
        let next = next.or_else(|| self.fallbacks.lock().unwrap().get(job_id).cloned().map(Ok));
        match next {
            Some(Ok(record)) => Ok(record),
            Some(Err(status)) => Err(ApiError::Status {
                status,
                body: "scripted failure".to_string(),
            }),
            None => Err(ApiError::Status {
                status: 503,
                body: "nothing scripted".to_string(),
            }),
        }
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<JobRecord, ApiError> {
        self.cancelled.lock().unwrap().push(job_id.clone());
        Ok(JobRecord::new(job_id.clone(), JobKind::Import, JobStatus::Running))
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, ApiError> {
        Ok(self.recent.lock().unwrap().iter().take(limit).cloned().collect())
    }
}

/// What a [`ScriptedTransport`] does once started.
#[derive(Clone)]
pub(crate) enum Script {
    /// Report failure right away, as if the channel could not open.
    FailToOpen,
    /// Stay attached and say nothing until stopped.
    Silent,
    /// Close without reporting anything.
    CloseQuietly,
    /// Emit these records 10ms apart, then stay attached until stopped.
    Emit(Vec<JobRecord>),
}

pub(crate) struct ScriptedTransport {
    kind: TransportKind,
    script: Script,
    started: Mutex<Vec<(JobId, CancellationToken)>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind, script: Script) -> Self {
        Self {
            kind,
            script,
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> Vec<JobId> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of started instances not yet stopped.
    pub fn live(&self) -> usize {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .count()
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn start(&self, job_id: &JobId, sink: UpdateSink, cancel: CancellationToken) -> TransportHandle {
        self.started
            .lock()
            .unwrap()
            .push((job_id.clone(), cancel.clone()));

        match self.script.clone() {
            Script::FailToOpen => {
                let _ = sink.send(TransportEvent::Failed(TransportError::Connect(
                    "connection refused".to_string(),
                )));
            }
            Script::CloseQuietly => drop(sink),
            Script::Silent => {
                let token = cancel.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    drop(sink);
                });
            }
            Script::Emit(records) => {
                let token = cancel.clone();
                tokio::spawn(async move {
                    for record in records {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                        }
                        if sink.send(TransportEvent::Update(record)).is_err() {
                            return;
                        }
                    }
                    token.cancelled().await;
                });
            }
        }
        TransportHandle::new(self.kind, cancel)
    }
}
