//! Push-channel frames.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::job::{JobId, JobRecord, JobStatus};

/// Frame discriminator. Anything but `Progress` ends the stream for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl FrameType {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Progress)
    }

    fn terminal_status(self) -> Option<JobStatus> {
        match self {
            Self::Progress => None,
            Self::Completed => Some(JobStatus::Completed),
            Self::Failed => Some(JobStatus::Failed),
            Self::Cancelled => Some(JobStatus::Cancelled),
        }
    }
}

/// `{ "type": ..., "job_id": ..., "data": JobRecord }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub job_id: JobId,
    pub data: JobRecord,
}

impl PushFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_terminal(&self) -> bool {
        self.frame_type.is_terminal()
    }

    /// The record this frame reports.
    ///
    /// A terminal frame is authoritative: if the embedded record still
    /// carries a non-terminal status, the frame type overrides it.
    pub fn into_record(self) -> JobRecord {
        let mut record = self.data;
        if let Some(status) = self.frame_type.terminal_status() {
            if !record.status.is_terminal() {
                record.status = status;
            }
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobProgress;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_progress_frame() {
        let text = r#"{
            "type": "progress",
            "job_id": "imp-1",
            "data": {
                "job_id": "imp-1",
                "kind": "import",
                "status": "running",
                "progress": {"stage": "downloading", "downloaded_mb": 12.5, "total_mb": 50.0}
            }
        }"#;
        let frame = PushFrame::parse(text).unwrap();
        assert_eq!(frame.frame_type, FrameType::Progress);
        assert!(!frame.is_terminal());

        let record = frame.into_record();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(
            record.progress,
            JobProgress::Downloading {
                downloaded_mb: 12.5,
                total_mb: 50.0
            }
        );
    }

    #[test]
    fn test_terminal_frame_overrides_stale_status() {
        let text = r#"{
            "type": "completed",
            "job_id": "imp-1",
            "data": {"job_id": "imp-1", "status": "running"}
        }"#;
        let frame = PushFrame::parse(text).unwrap();
        assert!(frame.is_terminal());
        assert_eq!(frame.into_record().status, JobStatus::Completed);
    }

    #[test]
    fn test_terminal_frame_keeps_reported_terminal_status() {
        let text = r#"{
            "type": "failed",
            "job_id": "imp-1",
            "data": {"job_id": "imp-1", "status": "cancelled"}
        }"#;
        let record = PushFrame::parse(text).unwrap().into_record();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let text = r#"{"type": "heartbeat", "job_id": "a", "data": {"job_id": "a", "status": "running"}}"#;
        assert!(PushFrame::parse(text).is_err());
    }
}
