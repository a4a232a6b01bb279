//! Wire types shared by the pulseboard sync layer and the dashboard UI.
//!
//! - [`JobRecord`]: canonical status of one backend job
//! - [`JobProgress`]: stage-tagged progress payload
//! - [`PushFrame`]: one message on a job's push channel

pub mod frame;
pub mod job;

pub use frame::{FrameType, PushFrame};
pub use job::{JobCounters, JobId, JobKind, JobProgress, JobRecord, JobStatus};
