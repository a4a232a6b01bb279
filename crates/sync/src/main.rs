// crates/sync/src/main.rs
//! `pulseboard`: inspect and follow backend jobs from a terminal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulseboard_sync::logging::init_tracing;
use pulseboard_sync::{
    HttpJobApi, JobApi, JobRegistry, QueryCache, RegistryEvent, Subscription, SyncConfig,
};
use pulseboard_types::{JobId, JobRecord};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

/// Cache key of the recent-jobs listing.
const RECENT_KEY: &str = "jobs:recent";

#[derive(Debug, Parser)]
#[command(name = "pulseboard", version, about = "Inspect and follow pulseboard jobs")]
struct Cli {
    /// API base URL (overrides PULSEBOARD_API_URL)
    #[arg(long, global = true, value_name = "URL")]
    api_url: Option<String>,

    /// Push channel base URL (overrides PULSEBOARD_WS_URL)
    #[arg(long, global = true, value_name = "URL")]
    ws_url: Option<String>,

    /// Polling fallback interval in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a job's current status
    Status { job_id: String },
    /// Follow jobs until every one of them finishes
    Watch {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// List recent jobs
    Recent {
        #[arg(long)]
        limit: Option<usize>,
        /// Keep following the jobs that are still running
        #[arg(long)]
        follow: bool,
    },
    /// Cancel a job and wait for it to stop
    Cancel { job_id: String },
}

impl Cli {
    fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        if let Some(url) = &self.api_url {
            config.api_base = url.clone();
        }
        if let Some(url) = &self.ws_url {
            config.ws_base = Some(url.clone());
        }
        if let Some(ms) = self.poll_interval_ms.filter(|ms| *ms > 0) {
            config.poll_interval = Duration::from_millis(ms);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = cli.config();
    let api: Arc<dyn JobApi> =
        Arc::new(HttpJobApi::new(&config).context("failed to build HTTP client")?);
    let cache = QueryCache::new(config.cache_freshness);
    info!(api = config.api_base(), ws = %config.ws_base(), "pulseboard starting");

    match cli.command {
        Command::Status { job_id } => {
            let sub = read_job(&cache, &api, JobId::from(job_id));
            let record = sub.settled().await?;
            println!("{}", describe(&record));
        }
        Command::Watch { job_ids } => {
            let registry = build_registry(&config, &api, &cache);
            let events = registry.subscribe();
            for id in job_ids {
                registry.track(id);
            }
            follow(&registry, events).await;
        }
        Command::Recent { limit, follow: keep_following } => {
            let limit = limit.unwrap_or(config.recent_jobs_limit);
            let listing = read_recent(&cache, &api, limit);
            let records = listing.settled().await?;
            print_table(&records);

            if keep_following {
                let registry = build_registry(&config, &api, &cache);
                let events = registry.subscribe();
                let started = registry.load_jobs(records.iter().cloned());
                eprintln!("  following {started} active job(s)\n");
                follow(&registry, events).await;
                registry.shutdown();

                // Completions invalidated the listing; this read refetches it.
                let refreshed = read_recent(&cache, &api, limit);
                print_table(&refreshed.settled().await?);
            }
        }
        Command::Cancel { job_id } => {
            let job_id = JobId::from(job_id);
            let registry = build_registry(&config, &api, &cache);
            let events = registry.subscribe();
            let ack = registry
                .cancel_job(&job_id)
                .await
                .with_context(|| format!("cancel request for {job_id} failed"))?;
            println!("{}", describe(&ack));
            follow(&registry, events).await;
        }
    }

    cache.clear();
    Ok(())
}

fn build_registry(config: &SyncConfig, api: &Arc<dyn JobApi>, cache: &QueryCache) -> JobRegistry {
    let cache = cache.clone();
    JobRegistry::from_config(config, Arc::clone(api)).with_completion_hook(move |record| {
        cache.invalidate(RECENT_KEY);
        cache.invalidate(&job_key(&record.job_id));
    })
}

fn job_key(job_id: &JobId) -> String {
    format!("job:{job_id}")
}

fn read_job(cache: &QueryCache, api: &Arc<dyn JobApi>, job_id: JobId) -> Subscription<JobRecord> {
    let api = Arc::clone(api);
    let key = job_key(&job_id);
    cache.read(
        key,
        move |_cancel| {
            let api = Arc::clone(&api);
            let job_id = job_id.clone();
            async move { api.job_status(&job_id).await }
        },
        None,
    )
}

fn read_recent(cache: &QueryCache, api: &Arc<dyn JobApi>, limit: usize) -> Subscription<Vec<JobRecord>> {
    let api = Arc::clone(api);
    cache.read(
        RECENT_KEY,
        move |_cancel| {
            let api = Arc::clone(&api);
            async move { api.recent_jobs(limit).await }
        },
        None,
    )
}

/// Print registry events until nothing is tracked, or until Ctrl-C.
async fn follow(registry: &JobRegistry, mut events: broadcast::Receiver<RegistryEvent>) {
    while registry.active_count() > 0 {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n  interrupted, stopping");
                registry.shutdown();
                return;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(event) => print_event(event),
            Err(RecvError::Lagged(missed)) => warn!(missed, "dropped registry events"),
            Err(RecvError::Closed) => return,
        }
    }
    // Events sent alongside the last completion.
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
}

fn print_event(event: RegistryEvent) {
    match event {
        RegistryEvent::Updated(record) => println!("{}", describe(&record)),
        RegistryEvent::Finished(record) => {
            eprintln!("  \u{2713} {} {}", record.job_id, record.status);
        }
        RegistryEvent::Untracked(job_id) => {
            eprintln!("  \u{2717} {job_id} can no longer be observed");
        }
    }
}

fn print_table(records: &[JobRecord]) {
    if records.is_empty() {
        println!("no jobs");
        return;
    }
    for record in records {
        println!("{}", describe(record));
    }
}

/// One line per record: id, kind, status, stage and completion.
fn describe(record: &JobRecord) -> String {
    let mut line = format!(
        "{:<24} {:<8} {:<10} {}",
        record.job_id.as_str(),
        record.kind.as_str(),
        record.status.as_str(),
        record.progress.stage()
    );
    if let Some(fraction) = record.progress.fraction() {
        line.push_str(&format!(" {:>3.0}%", fraction * 100.0));
    }
    let counters = &record.counters;
    if counters.records_imported > 0 || counters.records_failed > 0 {
        line.push_str(&format!(
            "  imported={} failed={}",
            counters.records_imported, counters.records_failed
        ));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!("  error: {error}"));
    }
    line
}
