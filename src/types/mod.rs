//! Core data types shared across components.

pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod status;

pub use envelope::{Attachment, Envelope};
pub use error::IngestError;
pub use mailbox::{Mailbox, TlsMode};
pub use status::{ConnState, StatusRecord};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Task priority. Ordering matters: `High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// How long an acquire may wait on host capacity before yielding BUSY.
    pub fn acquire_timeout(&self) -> Duration {
        match self {
            Self::High => Duration::from_secs(15),
            Self::Medium => Duration::from_secs(30),
            Self::Low => Duration::from_secs(60),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Observed email-volume tier; maps to a polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTier {
    Low,
    Medium,
    High,
}

impl VolumeTier {
    /// Reclassify from the number of new messages seen in one service cycle.
    pub fn from_new_messages(count: u32) -> Self {
        if count > 100 {
            Self::High
        } else if count > 10 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// What a scheduled task asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Poll,
    Idle,
    HealthCheck,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Idle => "idle",
            Self::HealthCheck => "health-check",
        }
    }
}

/// A unit of work for the worker fleet. Immutable once enqueued; a retry is
/// a new logical instance with an incremented retry count.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub mailbox: Mailbox,
    pub priority: Priority,
    pub kind: TaskKind,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn new(mailbox: Mailbox, priority: Priority, kind: TaskKind, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox,
            priority,
            kind,
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries,
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// The re-enqueued instance of a failed task.
    pub fn retried(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox: self.mailbox.clone(),
            priority: self.priority,
            kind: self.kind,
            enqueued_at: Utc::now(),
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
        }
    }

    /// Retry backoff: `min(1s * 2^retry_count, 30s)`.
    pub fn retry_backoff(&self) -> Duration {
        let secs = 1u64 << self.retry_count.min(5);
        Duration::from_secs(secs.min(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_volume_tier_thresholds() {
        assert_eq!(VolumeTier::from_new_messages(150), VolumeTier::High);
        assert_eq!(VolumeTier::from_new_messages(101), VolumeTier::High);
        assert_eq!(VolumeTier::from_new_messages(100), VolumeTier::Medium);
        assert_eq!(VolumeTier::from_new_messages(11), VolumeTier::Medium);
        assert_eq!(VolumeTier::from_new_messages(10), VolumeTier::Low);
        assert_eq!(VolumeTier::from_new_messages(0), VolumeTier::Low);
    }

    #[test]
    fn test_retry_backoff_caps_at_30s() {
        let mailbox = crate::adapters::sqlite::mailboxes::tests::sample_mailbox("mb-1");
        let mut task = Task::new(mailbox, Priority::High, TaskKind::Poll, 2);
        assert_eq!(task.retry_backoff(), Duration::from_secs(1));
        task = task.retried();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.retry_backoff(), Duration::from_secs(2));
        for _ in 0..6 {
            task = task.retried();
        }
        assert_eq!(task.retry_backoff(), Duration::from_secs(30));
    }
}
