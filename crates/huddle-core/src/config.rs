use std::time::Duration;

/// 10 MiB attachment limit
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Tunables of the messaging core.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Messages requested per page fetch.
    pub page_size: u32,
    /// Upper bound on mention candidates shown at once.
    pub max_mention_candidates: usize,
    /// Minimum gap between two local typing emissions for one channel.
    pub typing_emit_interval: Duration,
    /// Lifetime of a remote typing signal without renewal.
    pub typing_expiry: Duration,
    /// Auto-dismiss window of error notices.
    pub notice_ttl: Duration,
    pub max_attachment_bytes: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_mention_candidates: 8,
            typing_emit_interval: Duration::from_secs(3),
            typing_expiry: Duration::from_secs(6),
            notice_ttl: Duration::from_secs(5),
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

impl ChatConfig {
    /// Defaults overridden by `HUDDLE_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_parse("HUDDLE_PAGE_SIZE").unwrap_or(defaults.page_size),
            max_mention_candidates: env_parse("HUDDLE_MENTION_LIMIT")
                .unwrap_or(defaults.max_mention_candidates),
            typing_emit_interval: env_parse("HUDDLE_TYPING_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_emit_interval),
            typing_expiry: env_parse("HUDDLE_TYPING_EXPIRY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_expiry),
            notice_ttl: env_parse("HUDDLE_NOTICE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notice_ttl),
            max_attachment_bytes: env_parse("HUDDLE_MAX_ATTACHMENT_BYTES")
                .unwrap_or(defaults.max_attachment_bytes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
