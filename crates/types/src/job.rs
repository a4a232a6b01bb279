//! Job records as reported by the backend job endpoints.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

/// Opaque backend job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// `completed`, `failed` and `cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses worth observing: the job may still change.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does. Kinds this client does not know decode to `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Import,
    Export,
    Reindex,
    #[default]
    #[serde(other)]
    Other,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Export => "export",
            Self::Reindex => "reindex",
            Self::Other => "other",
        }
    }
}

/// Stage-specific progress, tagged by `stage`.
///
/// Stages the client does not model decode to [`JobProgress::Unknown`] so a
/// newer backend never breaks status decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobProgress {
    #[default]
    Queued,
    Downloading {
        downloaded_mb: f64,
        total_mb: f64,
    },
    Importing {
        chunk: u64,
        total_chunks: u64,
    },
    Indexing {
        indexed: u64,
        total: u64,
    },
    Finalizing,
    #[serde(other)]
    Unknown,
}

impl JobProgress {
    /// Completion estimate in `0.0..=1.0`, where the stage carries one.
    pub fn fraction(&self) -> Option<f64> {
        let ratio = |done: f64, total: f64| {
            if total > 0.0 {
                Some((done / total).clamp(0.0, 1.0))
            } else {
                None
            }
        };
        match self {
            Self::Queued => Some(0.0),
            Self::Downloading {
                downloaded_mb,
                total_mb,
            } => ratio(*downloaded_mb, *total_mb),
            Self::Importing {
                chunk,
                total_chunks,
            } => ratio(*chunk as f64, *total_chunks as f64),
            Self::Indexing { indexed, total } => ratio(*indexed as f64, *total as f64),
            Self::Finalizing | Self::Unknown => None,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading { .. } => "downloading",
            Self::Importing { .. } => "importing",
            Self::Indexing { .. } => "indexing",
            Self::Finalizing => "finalizing",
            Self::Unknown => "unknown",
        }
    }
}

/// Running totals reported alongside progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
#[serde(default)]
pub struct JobCounters {
    pub records_imported: u64,
    pub records_failed: u64,
    pub chunks_processed: u64,
    pub chunks_total: u64,
}

/// Canonical view of one backend job.
///
/// Every observation replaces the whole record; fields are never merged
/// with an older copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "codegen", ts(export, export_to = "../../../web/src/types/generated/"))]
pub struct JobRecord {
    pub job_id: JobId,
    #[serde(default)]
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "progress_or_queued")]
    pub progress: JobProgress,
    #[serde(default)]
    pub counters: JobCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<JobId>, kind: JobKind, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            status,
            progress: JobProgress::default(),
            counters: JobCounters::default(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// `"progress": null` is treated the same as a missing payload.
fn progress_or_queued<'de, D>(deserializer: D) -> Result<JobProgress, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<JobProgress>::deserialize(deserializer)?.unwrap_or_default())
}
