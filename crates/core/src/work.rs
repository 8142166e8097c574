use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a submitted work item.
pub type WorkId = Uuid;

/// Logical partition of the affinity-key space.
pub type ShardId = u32;

/// Identifier of a worker in the pool. Never reused within a process.
pub type WorkerId = u32;

/// Admission priority. Lower numeric value = more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Must not be shed short of a hard budget breach.
    Critical = 0,
    /// Survives critical pressure.
    High = 1,
    /// Default for API requests.
    Normal = 2,
    /// First to be delayed or shed.
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Index for fixed-size per-priority counters.
    #[inline]
    pub fn as_index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// A unit of computation routed by affinity key.
///
/// The payload is opaque to the scheduler; it is only handed to the
/// computation kernel. Items are immutable once submitted.
#[derive(Debug, Clone)]
pub struct WorkItem<P> {
    pub id: WorkId,
    /// Instrument identifier (or any other cache-locality key).
    pub affinity_key: String,
    pub priority: Priority,
    pub payload: P,
    /// Monotonic submission instant, used for deadline checks.
    pub enqueued_at: Instant,
    /// Wall-clock submission time, for logs and snapshots.
    pub submitted_at: DateTime<Utc>,
    pub deadline: Option<Instant>,
}

impl<P> WorkItem<P> {
    pub fn new(affinity_key: impl Into<String>, priority: Priority, payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            affinity_key: affinity_key.into(),
            priority,
            payload,
            enqueued_at: Instant::now(),
            submitted_at: Utc::now(),
            deadline: None,
        }
    }

    /// Set a deadline relative to submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.enqueued_at + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Tighten the deadline to `cap` after submission if that is earlier.
    pub fn cap_deadline(&mut self, cap: Duration) {
        let capped = self.enqueued_at + cap;
        self.deadline = Some(match self.deadline {
            Some(d) if d <= capped => d,
            _ => capped,
        });
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}
