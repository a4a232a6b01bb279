//! WebSocket push channel for job status frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pulseboard_types::{JobId, PushFrame};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent, TransportHandle, TransportKind, UpdateSink};
use crate::config::SyncConfig;
use crate::error::TransportError;

/// Timeouts after which the push channel is declared failed.
#[derive(Debug, Clone, Copy)]
pub struct PushTimeouts {
    pub connect: Duration,
    /// Measured from the moment the channel opens; pings don't count.
    pub first_frame: Duration,
    /// Maximum silence (any message, pings included) after the first frame.
    pub stall: Duration,
}

impl PushTimeouts {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            connect: config.push_connect_timeout,
            first_frame: config.push_first_frame_timeout,
            stall: config.push_stall_timeout,
        }
    }
}

/// Opens `{ws_base}/jobs/{id}/ws` and forwards each status frame.
///
/// Ends after the first terminal frame. Fails if the channel can't open,
/// stays silent past its timeouts, or closes before a terminal frame.
pub struct PushTransport {
    ws_base: String,
    timeouts: PushTimeouts,
}

impl PushTransport {
    pub fn new(ws_base: impl Into<String>, timeouts: PushTimeouts) -> Self {
        Self {
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.ws_base(), PushTimeouts::from_config(config))
    }

    pub fn channel_url(&self, job_id: &JobId) -> String {
        format!(
            "{}/jobs/{}/ws",
            self.ws_base,
            urlencoding::encode(job_id.as_str())
        )
    }
}

impl Transport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn start(&self, job_id: &JobId, sink: UpdateSink, cancel: CancellationToken) -> TransportHandle {
        let url = self.channel_url(job_id);
        let job_id = job_id.clone();
        let timeouts = self.timeouts;
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_channel(&url, &job_id, timeouts, &sink, &task_cancel).await {
                // Nobody listening once cancelled.
                if !task_cancel.is_cancelled() {
                    let _ = sink.send(TransportEvent::Failed(e));
                }
            }
        });
        TransportHandle::new(TransportKind::Push, cancel)
    }
}

async fn run_channel(
    url: &str,
    job_id: &JobId,
    timeouts: PushTimeouts,
    updates: &UpdateSink,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let connect = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        result = tokio::time::timeout(timeouts.connect, connect_async(url)) => result,
    };
    let (ws_stream, _) = connect
        .map_err(|_| TransportError::ConnectTimeout(timeouts.connect))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    info!(job_id = %job_id, %url, "push channel open");
    let (mut sink, mut stream) = ws_stream.split();

    let first_frame_deadline = Instant::now() + timeouts.first_frame;
    let mut last_activity = Instant::now();
    let mut seen_frame = false;

    loop {
        let deadline = if seen_frame {
            last_activity + timeouts.stall
        } else {
            first_frame_deadline
        };

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                debug!(job_id = %job_id, "push channel closed on request");
                return Ok(());
            }
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) if seen_frame => return Err(TransportError::Stalled(timeouts.stall)),
            Err(_) => return Err(TransportError::NoFirstFrame(timeouts.first_frame)),
            Ok(None) => return Err(TransportError::ClosedEarly),
            Ok(Some(Err(e))) => return Err(TransportError::Interrupted(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };
        last_activity = Instant::now();

        let text = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(job_id = %job_id, "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => return Err(TransportError::ClosedEarly),
            // Keepalive: counts as activity, not as a status frame.
            _ => continue,
        };

        let frame = match PushFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "ignoring undecodable push frame");
                continue;
            }
        };
        if &frame.job_id != job_id {
            warn!(job_id = %job_id, frame_job_id = %frame.job_id, "ignoring frame for another job");
            continue;
        }

        seen_frame = true;
        let terminal = frame.is_terminal();
        if updates.send(TransportEvent::Update(frame.into_record())).is_err() {
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        }
        if terminal {
            debug!(job_id = %job_id, "terminal frame received, closing push channel");
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_url() {
        let transport = PushTransport::new(
            "ws://localhost:8080/api/",
            PushTimeouts {
                connect: Duration::from_secs(1),
                first_frame: Duration::from_secs(1),
                stall: Duration::from_secs(1),
            },
        );
        assert_eq!(
            transport.channel_url(&JobId::from("imp 1")),
            "ws://localhost:8080/api/jobs/imp%201/ws"
        );
    }

    #[test]
    fn test_from_config_derives_ws_scheme() {
        let config = SyncConfig {
            api_base: "https://dash.example.com/api".to_string(),
            ws_base: None,
            ..SyncConfig::default()
        };
        let transport = PushTransport::from_config(&config);
        assert_eq!(
            transport.channel_url(&JobId::from("j")),
            "wss://dash.example.com/api/jobs/j/ws"
        );
        assert_eq!(transport.timeouts.first_frame, config.push_first_frame_timeout);
    }
}
