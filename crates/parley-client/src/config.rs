//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a session can start against a local
//! backend with no configuration at all.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_API_URL, DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STALE_SECS,
};

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the conversation backend.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://localhost:8000`
    pub api_url: String,

    /// Upper bound on every remote call. A call that exceeds it fails as a
    /// transport error and its mutation rolls back.
    /// Env: `PARLEY_REQUEST_TIMEOUT_SECS`
    /// Default: `30`
    pub request_timeout: Duration,

    /// Age after which a cached entry is refetched on its next read.
    /// Env: `PARLEY_STALE_SECS`
    /// Default: `60`
    pub stale_after: Duration,

    /// Capacity of the session event channel. Slow subscribers past this
    /// many events lag and skip ahead.
    /// Env: `PARLEY_EVENT_CAPACITY`
    /// Default: `256`
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_API_URL") {
            let url = url.trim();
            if url.is_empty() {
                tracing::warn!("Empty PARLEY_API_URL, using default");
            } else {
                config.api_url = url.to_string();
            }
        }

        if let Some(val) = lookup("PARLEY_REQUEST_TIMEOUT_SECS") {
            if let Some(timeout) = parse_secs("PARLEY_REQUEST_TIMEOUT_SECS", &val) {
                config.request_timeout = timeout;
            }
        }

        if let Some(val) = lookup("PARLEY_STALE_SECS") {
            if let Some(stale) = parse_secs("PARLEY_STALE_SECS", &val) {
                config.stale_after = stale;
            }
        }

        if let Some(val) = lookup("PARLEY_EVENT_CAPACITY") {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.event_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_EVENT_CAPACITY, using default"),
            }
        }

        // RUST_LOG is read by the binary's EnvFilter, not stored here.

        config
    }
}

/// Parse a positive number of seconds.
fn parse_secs(name: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(var = name, value = %value, "Invalid duration, using default");
            None
        }
    }
}
