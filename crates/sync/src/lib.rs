// crates/sync/src/lib.rs
//! Client-side state synchronisation for the pulseboard dashboard.
//!
//! - [`cache`]: keyed query cache with stale-while-revalidate reads,
//!   per-key fetch deduplication and subscriber-counted cancellation
//! - [`tracker`]: observes one backend job, push first with polling as
//!   the fallback, until it reaches a terminal status
//! - [`registry`]: tracks many jobs for a view and reports completions
//!
//! The HTTP and WebSocket plumbing lives in [`api`] and [`transport`].

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod registry;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{HttpJobApi, JobApi};
pub use cache::{QueryCache, QueryState, Subscription};
pub use config::SyncConfig;
pub use error::{ApiError, QueryError, TransportError};
pub use registry::{JobRegistry, RegistryEvent};
pub use tracker::{JobTracker, TrackerEvent, TrackerPhase};
pub use transport::{PollTransport, PushTransport, Transport, TransportKind};
