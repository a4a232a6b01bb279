//! Interchangeable ways of observing a remote job's status.
//!
//! Provides:
//! - `Transport`: strategy contract: start observing, report into a sink
//! - `PushTransport`: WebSocket channel streaming status frames
//! - `PollTransport`: periodic status requests
//! - `TransportHandle`: cleanup for a started strategy
//!
//! A strategy reports every status it sees as `TransportEvent::Update` and
//! gives up with `TransportEvent::Failed`. Closing the sink (dropping the
//! sender) without a terminal status counts as failure too.

pub mod poll;
pub mod push;

pub use poll::PollTransport;
pub use push::PushTransport;

use std::fmt;

use pulseboard_types::{JobId, JobRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Which strategy is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Push,
    Poll,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Update(JobRecord),
    Failed(TransportError),
}

pub type UpdateSink = mpsc::UnboundedSender<TransportEvent>;

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin observing `job_id`, reporting into `sink` until `cancel`
    /// fires, a terminal status is sent, or the strategy fails.
    fn start(&self, job_id: &JobId, sink: UpdateSink, cancel: CancellationToken) -> TransportHandle;
}

/// Cleanup for a started strategy. Stopping (or dropping) the handle
/// cancels the strategy's task; it closes its resources on its own.
#[derive(Debug)]
pub struct TransportHandle {
    kind: TransportKind,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn new(kind: TransportKind, cancel: CancellationToken) -> Self {
        Self { kind, cancel }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
