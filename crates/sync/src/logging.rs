//! Tracing setup for the `pulseboard` binary. The library never installs a
//! global subscriber.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "pulseboard=info,pulseboard_sync=info";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a compact stderr subscriber. Stdout stays free for job output.
pub fn init_tracing() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
