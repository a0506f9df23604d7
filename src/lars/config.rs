//! Engine configuration.
//!
//! Provides the [`EngineConfig`] struct consumed by
//! [`CascadeEngine`](crate::lars::driver::CascadeEngine). Users construct it
//! manually or read the `LARS_*` environment knobs once at startup via
//! [`EngineConfig::from_env`] — no config-file parsing dependencies are
//! introduced.
//!
//! # Example
//!
//! ```rust
//! use lars::lars::config::EngineConfig;
//! use std::path::PathBuf;
//!
//! // Use the defaults
//! let config = EngineConfig::default();
//! assert_eq!(config.worker_pool, 16);
//!
//! // Or override what you need
//! let config = EngineConfig {
//!     artifact_root: PathBuf::from("/var/data/lars"),
//!     ..EngineConfig::default()
//! };
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of LLM turns an agent cell may take when `rules.max_turns`
/// is not specified in the cascade document.
pub const DEFAULT_MAX_TURNS: usize = 8;

/// Global configuration for a cascade engine instance.
///
/// Every field has a default; the `LARS_*` environment variables override
/// them when [`EngineConfig::from_env`] is used.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of candidate branches executing concurrently
    /// (`LARS_WORKER_POOL`).
    pub worker_pool: usize,
    /// Safety cap on cell invocations per cascade run, guarding against
    /// routing cycles (`LARS_MAX_CELL_ITERATIONS`).
    pub max_cell_iterations: usize,
    /// Maximum nesting depth for synchronous sub-cascade calls
    /// (`LARS_MAX_SUB_CASCADE_DEPTH`).
    pub max_sub_cascade_depth: usize,
    /// Globally disables persisting and retrieving winning rewrites
    /// (`LARS_DISABLE_WINNER_LEARNING`).
    pub disable_winner_learning: bool,
    /// How many prior winning rewrites are retrieved to seed the rewrite
    /// mutator (`LARS_WINNER_HISTORY_LIMIT`).
    pub winner_history_limit: usize,
    /// Event/log flush cadence for real-time consumers
    /// (`LARS_FLUSH_INTERVAL`).
    pub flush_interval: Duration,
    /// Model used by the rewrite mutator when a cell does not name one
    /// (`LARS_REWRITE_MODEL`).
    pub rewrite_model: Option<String>,
    /// Root directory for per-session artifacts; images land under
    /// `{root}/{session_id}/images/{cell_name}/`.
    pub artifact_root: PathBuf,
    /// Per tool call timeout. An expired call is surfaced to the agent as an
    /// error tool-result; the turn loop continues.
    pub tool_timeout: Duration,
    /// Largest image payload a trait may return. Larger images are dropped
    /// with an `image_truncated` event and an entry in the run's errors.
    pub max_image_bytes: usize,
    /// Minimum interval between polls of the log store while waiting on a
    /// signal. Same-process fires wake the waiter directly.
    pub signal_poll_interval: Duration,
    /// Event bus subscriber buffer. Consumers that fall further behind than
    /// this are disconnected rather than blocking publishers.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool: 16,
            max_cell_iterations: 256,
            max_sub_cascade_depth: 8,
            disable_winner_learning: false,
            winner_history_limit: 5,
            flush_interval: Duration::from_secs(1),
            rewrite_model: None,
            artifact_root: PathBuf::from("lars_artifacts"),
            tool_timeout: Duration::from_secs(60),
            max_image_bytes: 8 * 1024 * 1024,
            signal_poll_interval: Duration::from_millis(250),
            event_buffer: 1024,
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to the defaults for
    /// anything unset or unparseable.
    ///
    /// Recognised variables: `LARS_WORKER_POOL`, `LARS_MAX_CELL_ITERATIONS`,
    /// `LARS_MAX_SUB_CASCADE_DEPTH`, `LARS_DISABLE_WINNER_LEARNING`,
    /// `LARS_WINNER_HISTORY_LIMIT`, `LARS_FLUSH_INTERVAL`,
    /// `LARS_REWRITE_MODEL`, `LARS_ARTIFACT_ROOT`, `LARS_TOOL_TIMEOUT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_usize("LARS_WORKER_POOL") {
            config.worker_pool = n.max(1);
        }
        if let Some(n) = env_usize("LARS_MAX_CELL_ITERATIONS") {
            config.max_cell_iterations = n.max(1);
        }
        if let Some(n) = env_usize("LARS_MAX_SUB_CASCADE_DEPTH") {
            config.max_sub_cascade_depth = n.max(1);
        }
        if let Ok(v) = env::var("LARS_DISABLE_WINNER_LEARNING") {
            config.disable_winner_learning = matches!(v.as_str(), "true" | "1" | "yes");
        }
        if let Some(n) = env_usize("LARS_WINNER_HISTORY_LIMIT") {
            config.winner_history_limit = n;
        }
        if let Some(d) = env::var("LARS_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| parse_duration(&v))
        {
            config.flush_interval = d;
        }
        if let Ok(v) = env::var("LARS_REWRITE_MODEL") {
            if !v.is_empty() {
                config.rewrite_model = Some(v);
            }
        }
        if let Ok(v) = env::var("LARS_ARTIFACT_ROOT") {
            if !v.is_empty() {
                config.artifact_root = PathBuf::from(v);
            }
        }
        if let Some(d) = env::var("LARS_TOOL_TIMEOUT")
            .ok()
            .and_then(|v| parse_duration(&v))
        {
            config.tool_timeout = d;
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a human duration string: `"500ms"`, `"60s"`, `"5m"`, `"1h"`, or a
/// bare number of seconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(ms) = text.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(h) = text.strip_suffix('h') {
        return h.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * 3600));
    }
    if let Some(m) = text.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * 60));
    }
    if let Some(s) = text.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    text.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_pool, 16);
        assert_eq!(config.max_cell_iterations, 256);
        assert_eq!(config.max_sub_cascade_depth, 8);
        assert_eq!(config.winner_history_limit, 5);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert!(!config.disable_winner_learning);
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_duration("nope"), None);
    }
}
