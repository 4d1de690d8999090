//! Dynamic proxy policy.
//!
//! The policy is stored as a single JSON document and read through an
//! atomically swappable snapshot: every request captures one `PolicySnapshot`
//! at entry and uses it for all decisions, so a concurrent policy update
//! never produces a torn read.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Downstream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownstreamPolicy {
    /// Base URL requests are forwarded to (e.g. "http://127.0.0.1:9000").
    pub base_url: String,
    /// Deadline for a downstream request, in seconds. For SSE this bounds
    /// connection establishment only; streaming is governed by the idle
    /// timeout instead.
    #[serde(default = "default_downstream_timeout_secs")]
    pub timeout_secs: u64,
}

/// Concurrency and rate caps, used for both the global dimension and the
/// per-key default dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caps {
    /// Maximum concurrently active unary requests.
    pub max_concurrent: u32,
    /// Maximum requests (and SSE messages) per trailing 60 seconds.
    pub max_rpm: u32,
    /// Maximum concurrently open SSE connections.
    pub max_sse: u32,
}

/// Per-key cap overrides. `None` fields fall back to the policy default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CapOverrides {
    pub max_rpm: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub max_sse: Option<u32>,
}

/// A per-API-pattern rate cap.
///
/// Patterns have the form `"METHOD /prefix/*"` or `"METHOD /path/{param}"`;
/// the first matching pattern names the API for both rate keying and
/// request logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiLimit {
    pub pattern: String,
    pub max_rpm: u32,
}

/// Wait queue settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QueuePolicy {
    /// Maximum number of waiters across all priorities.
    pub max_size: u32,
    /// How long a waiter may remain queued before resolving with 504.
    pub timeout_secs: u64,
}

/// SSE streaming settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SsePolicy {
    /// Close the stream when no downstream byte arrives for this long.
    pub idle_timeout_secs: u64,
}

/// Request-log retention settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetentionPolicy {
    /// Request-log rows older than this many days are swept.
    pub request_log_days: u32,
    /// Interval between sweeps, in seconds.
    pub sweep_interval_secs: u64,
}

/// The complete dynamic policy, observed by a request as one immutable value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySnapshot {
    pub downstream: DownstreamPolicy,
    /// Caps applied across all keys together.
    pub global: Caps,
    /// Default caps for a single key; overridable per key.
    pub default_user: Caps,
    /// Ordered per-API rate caps; first match wins.
    #[serde(default)]
    pub api_limits: Vec<ApiLimit>,
    pub queue: QueuePolicy,
    pub sse: SsePolicy,
    #[serde(default = "default_retention")]
    pub retention: RetentionPolicy,
}

fn default_downstream_timeout_secs() -> u64 {
    60
}

fn default_retention() -> RetentionPolicy {
    RetentionPolicy {
        request_log_days: 30,
        sweep_interval_secs: 3600,
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            downstream: DownstreamPolicy {
                base_url: "http://127.0.0.1:9000".to_string(),
                timeout_secs: default_downstream_timeout_secs(),
            },
            global: Caps {
                max_concurrent: 100,
                max_rpm: 600,
                max_sse: 50,
            },
            default_user: Caps {
                max_concurrent: 10,
                max_rpm: 60,
                max_sse: 5,
            },
            api_limits: Vec::new(),
            queue: QueuePolicy {
                max_size: 50,
                timeout_secs: 30,
            },
            sse: SsePolicy {
                idle_timeout_secs: 300,
            },
            retention: default_retention(),
        }
    }
}

/// Errors produced by [`PolicySnapshot::validate`].
#[derive(Debug, Error)]
pub enum PolicyValidationError {
    #[error("invalid policy value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl PolicySnapshot {
    /// Checks that the policy is internally consistent before it is
    /// installed. Caps of zero are allowed (they close the corresponding
    /// dimension entirely); timeouts must be non-zero.
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.downstream.base_url.is_empty() {
            return Err(PolicyValidationError::InvalidValue {
                field: "downstream.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.downstream.base_url.starts_with("http://")
            && !self.downstream.base_url.starts_with("https://")
        {
            return Err(PolicyValidationError::InvalidValue {
                field: "downstream.base_url",
                reason: format!("must be an http(s) URL, got '{}'", self.downstream.base_url),
            });
        }
        if self.downstream.timeout_secs == 0 {
            return Err(PolicyValidationError::InvalidValue {
                field: "downstream.timeout_secs",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.queue.timeout_secs == 0 {
            return Err(PolicyValidationError::InvalidValue {
                field: "queue.timeout_secs",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.sse.idle_timeout_secs == 0 {
            return Err(PolicyValidationError::InvalidValue {
                field: "sse.idle_timeout_secs",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(PolicyValidationError::InvalidValue {
                field: "retention.sweep_interval_secs",
                reason: "must be >= 1".to_string(),
            });
        }
        for limit in &self.api_limits {
            let mut parts = limit.pattern.splitn(2, ' ');
            let method = parts.next().unwrap_or("");
            let path = parts.next().unwrap_or("");
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(PolicyValidationError::InvalidValue {
                    field: "api_limits.pattern",
                    reason: format!("'{}' must start with an upper-case method", limit.pattern),
                });
            }
            if !path.starts_with('/') {
                return Err(PolicyValidationError::InvalidValue {
                    field: "api_limits.pattern",
                    reason: format!("'{}' must contain an absolute path", limit.pattern),
                });
            }
        }
        Ok(())
    }
}
