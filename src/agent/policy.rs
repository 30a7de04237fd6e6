//! Per-category waiting-queue policy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when a category's waiting queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    /// Refuse the new request.
    RejectNew,
    /// Drop the oldest waiter to make room for the new request.
    LatestOnly,
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectNew => f.write_str("reject_new"),
            Self::LatestOnly => f.write_str("latest_only"),
        }
    }
}

impl FromStr for ReplacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject_new" | "reject-new" => Ok(Self::RejectNew),
            "latest_only" | "latest-only" | "replace_oldest_waiting" => Ok(Self::LatestOnly),
            other => Err(format!(
                "expected reject_new or latest_only, got '{other}'"
            )),
        }
    }
}

/// Admission limits for one agent category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Owners simultaneously active.
    pub concurrent_limit: usize,
    /// Owners allowed to wait.
    pub waiting_capacity: usize,
    pub replacement: ReplacementPolicy,
    /// Waiters older than this are discarded instead of promoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait: Option<Duration>,
}

impl QueuePolicy {
    pub fn new(
        concurrent_limit: usize,
        waiting_capacity: usize,
        replacement: ReplacementPolicy,
    ) -> Self {
        Self {
            concurrent_limit,
            waiting_capacity,
            replacement,
            max_wait: None,
        }
    }

    pub fn latest_only(concurrent_limit: usize, waiting_capacity: usize) -> Self {
        Self::new(concurrent_limit, waiting_capacity, ReplacementPolicy::LatestOnly)
    }

    pub fn reject_new(concurrent_limit: usize, waiting_capacity: usize) -> Self {
        Self::new(concurrent_limit, waiting_capacity, ReplacementPolicy::RejectNew)
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::latest_only(1, 1)
    }
}
