//! Runtime configuration for the sync layer.

use std::time::Duration;

/// Default API base when `PULSEBOARD_API_URL` is unset.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080/api";

/// Configuration shared by the API client, transports and cache.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// PULSEBOARD_API_URL env var (e.g. https://host/api).
    pub api_base: String,
    /// PULSEBOARD_WS_URL env var. None = derived from `api_base`.
    pub ws_base: Option<String>,
    /// PULSEBOARD_POLL_INTERVAL_MS env var.
    pub poll_interval: Duration,
    pub push_connect_timeout: Duration,
    /// Push channel is declared failed if no frame arrives this long after opening.
    pub push_first_frame_timeout: Duration,
    /// ...or if it goes quiet this long after the first frame.
    pub push_stall_timeout: Duration,
    pub request_timeout: Duration,
    /// Freshness window for cache reads that don't pass one.
    pub cache_freshness: Duration,
    pub recent_jobs_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: std::env::var("PULSEBOARD_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            ws_base: std::env::var("PULSEBOARD_WS_URL").ok(),
            poll_interval: env_millis("PULSEBOARD_POLL_INTERVAL_MS")
                .unwrap_or(Duration::from_secs(2)),
            push_connect_timeout: Duration::from_secs(5),
            push_first_frame_timeout: Duration::from_secs(10),
            push_stall_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            cache_freshness: Duration::from_secs(5 * 60),
            recent_jobs_limit: 50,
        }
    }
}

impl SyncConfig {
    /// Base URL for push channels: `ws_base` if set, otherwise `api_base`
    /// with its scheme swapped to `ws`/`wss`.
    pub fn ws_base(&self) -> String {
        match &self.ws_base {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => derive_ws_base(&self.api_base),
        }
    }

    pub fn api_base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }
}

fn derive_ws_base(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_base: &str, ws_base: Option<&str>) -> SyncConfig {
        SyncConfig {
            api_base: api_base.to_string(),
            ws_base: ws_base.map(str::to_string),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_ws_base_derived_from_api_base() {
        assert_eq!(
            config("http://localhost:8080/api/", None).ws_base(),
            "ws://localhost:8080/api"
        );
        assert_eq!(
            config("https://dash.example.com/api", None).ws_base(),
            "wss://dash.example.com/api"
        );
    }

    #[test]
    fn test_explicit_ws_base_wins() {
        let cfg = config("http://localhost:8080/api", Some("ws://push.local/stream/"));
        assert_eq!(cfg.ws_base(), "ws://push.local/stream");
        assert_eq!(cfg.api_base(), "http://localhost:8080/api");
    }

    #[test]
    fn test_defaults_are_bounded() {
        let cfg = SyncConfig::default();
        assert!(cfg.push_first_frame_timeout < cfg.push_stall_timeout);
        assert_eq!(cfg.cache_freshness, Duration::from_secs(300));
        assert!(cfg.recent_jobs_limit > 0);
    }
}
