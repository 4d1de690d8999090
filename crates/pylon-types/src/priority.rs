//! API key priority levels.

use serde::{Deserialize, Serialize};

/// Scheduling priority attached to an API key.
///
/// Priorities order the wait queue (`High` ahead of `Normal` ahead of `Low`)
/// and decide preemption: a higher-priority arrival may evict a
/// strictly-lower-priority waiter from a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Served last, first to be preempted.
    #[serde(rename = "low")]
    Low,
    /// The default for newly created keys.
    #[serde(rename = "normal")]
    Normal,
    /// Served first, never preempted by `Normal` or `Low`.
    #[serde(rename = "high")]
    High,
}

impl Priority {
    /// Returns the canonical string label for this priority.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown priority label.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown priority: {0}")]
pub struct ParsePriorityError(pub String);

impl std::str::FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}
