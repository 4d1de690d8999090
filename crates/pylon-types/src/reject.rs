//! Rejection reason codes returned on the proxy port.
//!
//! Every rejected request answers with a small JSON body carrying a stable
//! `code` string and a human-readable message. The HTTP status is fixed per
//! code.

use serde::{Deserialize, Serialize};

/// Why a request was not proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Missing, malformed, expired, or revoked credential.
    Unauthorized,
    /// The key's own per-minute budget is exhausted.
    UserLimit,
    /// The matched API pattern's per-minute budget is exhausted.
    ApiLimit,
    /// The global per-minute budget is exhausted.
    SystemBusy,
    /// The wait queue is full and no lower-priority waiter could be evicted.
    QueueFull,
    /// The wait deadline elapsed before a slot freed up.
    QueueTimeout,
    /// A higher-priority arrival evicted this request from the queue.
    Preempted,
    /// The downstream connection failed.
    DownstreamError,
}

impl RejectReason {
    /// Stable wire code, used as the `code` field of rejection bodies.
    pub fn code(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::UserLimit => "user_limit",
            Self::ApiLimit => "api_limit",
            Self::SystemBusy => "system_busy",
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
            Self::Preempted => "preempted",
            Self::DownstreamError => "downstream_error",
        }
    }

    /// Human-readable explanation, used as the `message` field.
    pub fn message(self) -> &'static str {
        match self {
            Self::Unauthorized => "missing or invalid API key",
            Self::UserLimit => "per-key request rate exceeded",
            Self::ApiLimit => "per-API request rate exceeded",
            Self::SystemBusy => "system-wide request rate exceeded",
            Self::QueueFull => "wait queue is full",
            Self::QueueTimeout => "timed out waiting for a free slot",
            Self::Preempted => "evicted from the wait queue by a higher-priority request",
            Self::DownstreamError => "downstream request failed",
        }
    }

    /// The HTTP status this reason answers with.
    pub fn status(self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::UserLimit | Self::ApiLimit | Self::SystemBusy => 429,
            Self::QueueFull | Self::Preempted => 503,
            Self::QueueTimeout => 504,
            Self::DownstreamError => 502,
        }
    }

    /// Whether this rejection counts as a rate-limit event in the request log.
    pub fn is_rate_limited(self) -> bool {
        matches!(
            self,
            Self::UserLimit | Self::ApiLimit | Self::SystemBusy | Self::QueueFull | Self::Preempted
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_contract() {
        assert_eq!(RejectReason::Unauthorized.status(), 401);
        assert_eq!(RejectReason::UserLimit.status(), 429);
        assert_eq!(RejectReason::ApiLimit.status(), 429);
        assert_eq!(RejectReason::SystemBusy.status(), 429);
        assert_eq!(RejectReason::QueueFull.status(), 503);
        assert_eq!(RejectReason::Preempted.status(), 503);
        assert_eq!(RejectReason::QueueTimeout.status(), 504);
        assert_eq!(RejectReason::DownstreamError.status(), 502);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(RejectReason::SystemBusy.code(), "system_busy");
        assert_eq!(RejectReason::QueueFull.code(), "queue_full");
        let json = serde_json::to_string(&RejectReason::UserLimit).unwrap();
        assert_eq!(json, "\"user_limit\"");
    }
}
