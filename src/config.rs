//! Driver configuration and open options.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionFlags, OpenFlags};

/// Policy constants of the retry/backoff loop shared by prepare and step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-attempts allowed after a schema-invalidation result before failing.
    pub max_schema_retries: u32,
    /// Lower bound of the jittered sleep after a Busy/Locked result, in milliseconds.
    pub min_jitter_ms: u64,
    /// Upper bound (inclusive) of the jittered sleep, in milliseconds.
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_schema_retries: 3,
            min_jitter_ms: 1,
            max_jitter_ms: 150,
        }
    }
}

impl RetryPolicy {
    fn jitter_range(&self) -> RangeInclusive<u64> {
        let low = self.min_jitter_ms.min(self.max_jitter_ms);
        let high = self.min_jitter_ms.max(self.max_jitter_ms);
        low..=high
    }

    /// A random pause inside the configured jitter window.
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(rand::thread_rng().gen_range(self.jitter_range()))
    }
}

/// Connection-independent driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub retry: RetryPolicy,
    /// Catalog qualifier (`[name].`) stripped from SQL text before it is prepared.
    pub base_schema_name: Option<String>,
    /// Recognise the legacy `TYPES ...;` prefix by the native syntax-error message.
    pub legacy_types_clause: bool,
    /// Time budget used by [`crate::Connection::execute`] and friends.
    pub default_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            base_schema_name: Some("sqlite_default_schema".to_string()),
            legacy_types_clause: true,
            default_timeout_ms: 30_000,
        }
    }
}

impl DriverConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Inputs of [`crate::Connection::open`] besides the file path.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) vfs: Option<String>,
    pub(crate) flags: ConnectionFlags,
    pub(crate) open_flags: OpenFlags,
    pub(crate) max_pool_size: usize,
    pub(crate) pooling: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            vfs: None,
            flags: ConnectionFlags::empty(),
            open_flags: OpenFlags::DEFAULT,
            max_pool_size: 100,
            pooling: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vfs(mut self, name: impl Into<String>) -> Self {
        self.vfs = Some(name.into());
        self
    }

    pub fn flags(mut self, flags: ConnectionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn open_flags(mut self, flags: OpenFlags) -> Self {
        self.open_flags = flags;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Request a pooled handle; downgraded at open time when pooling would be unsafe.
    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_jitter_window() {
        let policy = RetryPolicy::default();
        for _ in 0..64 {
            let pause = policy.jitter();
            assert!(pause >= Duration::from_millis(1));
            assert!(pause <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_inverted_jitter_window_is_normalized() {
        let policy = RetryPolicy {
            max_schema_retries: 0,
            min_jitter_ms: 9,
            max_jitter_ms: 3,
        };
        let pause = policy.jitter();
        assert!(pause >= Duration::from_millis(3) && pause <= Duration::from_millis(9));
    }

    #[test]
    fn test_partial_config_document() {
        let config: DriverConfig =
            serde_json::from_str(r#"{ "retry": { "max_schema_retries": 7 }, "legacy_types_clause": false }"#)
                .unwrap();
        assert_eq!(config.retry.max_schema_retries, 7);
        assert_eq!(config.retry.max_jitter_ms, 150);
        assert!(!config.legacy_types_clause);
        assert_eq!(config.base_schema_name.as_deref(), Some("sqlite_default_schema"));
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_open_options_builder() {
        let options = OpenOptions::new()
            .vfs("unix")
            .pooling(true)
            .max_pool_size(4)
            .flags(ConnectionFlags::NO_BIND_FUNCTIONS);
        assert_eq!(options.vfs.as_deref(), Some("unix"));
        assert!(options.pooling);
        assert_eq!(options.max_pool_size, 4);
        assert_eq!(options.open_flags, OpenFlags::DEFAULT);
    }
}
