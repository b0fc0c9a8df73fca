/// Application name
pub const APP_NAME: &str = "Parley";

/// Default backend base URL
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Sampling temperature used when a conversation does not set one
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Completion budget used when a conversation does not set one
pub const DEFAULT_MAX_COMPLETION_TOKENS: u32 = 1000;

/// Upper bound accepted for `max_completion_tokens`
pub const MAX_COMPLETION_TOKENS_LIMIT: u32 = 4000;

/// Cached entries older than this are refetched on the next read (seconds)
pub const DEFAULT_STALE_SECS: u64 = 60;

/// Remote call timeout (seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Session event channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
