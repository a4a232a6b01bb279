//! Fixed-interval status polling.

use std::sync::Arc;
use std::time::Duration;

use pulseboard_types::JobId;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Transport, TransportEvent, TransportHandle, TransportKind, UpdateSink};
use crate::api::JobApi;

/// Issues a status request every `interval`, the first one immediately.
///
/// Request errors are logged and retried on the next tick; polling itself
/// never gives up. It ends after reporting a terminal status.
pub struct PollTransport {
    api: Arc<dyn JobApi>,
    interval: Duration,
}

impl PollTransport {
    pub fn new(api: Arc<dyn JobApi>, interval: Duration) -> Self {
        Self { api, interval }
    }
}

impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn start(&self, job_id: &JobId, sink: UpdateSink, cancel: CancellationToken) -> TransportHandle {
        tokio::spawn(poll_loop(
            Arc::clone(&self.api),
            job_id.clone(),
            self.interval,
            sink,
            cancel.clone(),
        ));
        TransportHandle::new(TransportKind::Poll, cancel)
    }
}

async fn poll_loop(
    api: Arc<dyn JobApi>,
    job_id: JobId,
    interval: Duration,
    sink: UpdateSink,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = api.job_status(&job_id) => result,
        };

        match result {
            Ok(record) => {
                let terminal = record.is_terminal();
                if sink.send(TransportEvent::Update(record)).is_err() || terminal {
                    break;
                }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "status poll failed, retrying next interval");
            }
        }
    }
    debug!(job_id = %job_id, "poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, ScriptedApi};
    use pulseboard_types::JobStatus;
    use tokio::sync::mpsc;

    fn updates(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<JobStatus> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Update(r) = event {
                seen.push(r.status);
            }
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal() {
        let api = Arc::new(ScriptedApi::new());
        api.push_status(record("j", JobStatus::Running));
        api.push_status(record("j", JobStatus::Running));
        api.push_status(record("j", JobStatus::Completed));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = PollTransport::new(api.clone(), Duration::from_secs(2));
        let _handle = poller.start(&JobId::from("j"), tx, CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            updates(&mut rx),
            vec![JobStatus::Running, JobStatus::Running, JobStatus::Completed]
        );
        assert_eq!(api.status_calls(), 3);
        // Sender dropped: the poller is done.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_is_immediate() {
        let api = Arc::new(ScriptedApi::new());
        api.push_status(record("j", JobStatus::Running));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = PollTransport::new(api.clone(), Duration::from_secs(30));
        let _handle = poller.start(&JobId::from("j"), tx, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(updates(&mut rx), vec![JobStatus::Running]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_errors_are_retried() {
        let api = Arc::new(ScriptedApi::new());
        api.push_error("j", 503);
        api.push_status(record("j", JobStatus::Failed));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = PollTransport::new(api.clone(), Duration::from_secs(1));
        let _handle = poller.start(&JobId::from("j"), tx, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(updates(&mut rx), vec![JobStatus::Failed]);
        assert_eq!(api.status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_polling() {
        let api = Arc::new(ScriptedApi::new());
        api.set_fallback(record("j", JobStatus::Running));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let poller = PollTransport::new(api.clone(), Duration::from_secs(1));
        let handle = poller.start(&JobId::from("j"), tx, CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop();
        let calls = api.status_calls();
        assert_eq!(calls, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.status_calls(), calls);
        updates(&mut rx);
        assert!(rx.recv().await.is_none());
    }
}
