use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::status::{BatchStatus, QueueStatus};

/// Reporting group for the rows created by one publish action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailBatch {
    pub id: Uuid,
    pub notification_type: String,
    pub event_id: Option<String>,
    pub status: BatchStatus,
    pub total_recipients: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEmailBatch {
    pub notification_type: String,
    pub event_id: Option<String>,
}

/// Result of inserting one batch and its rows atomically.
#[derive(Debug, Clone, Copy)]
pub struct InsertedBatch {
    pub batch_id: Uuid,
    pub inserted: usize,
}

/// Which rows a count should cover.
#[derive(Debug, Clone)]
pub enum StatsScope {
    All,
    Event { event_type: String, event_id: String },
    Batch(Uuid),
}

/// Raw per-status counts as read from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Queued => self.queued += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Sent => self.sent += count,
            QueueStatus::Failed => self.failed += count,
            QueueStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.sent + self.failed + self.cancelled
    }
}

/// Send outcomes for one published event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub queued: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl From<StatusCounts> for EventStats {
    fn from(counts: StatusCounts) -> Self {
        Self {
            queued: counts.queued,
            processing: counts.processing,
            sent: counts.sent,
            failed: counts.failed,
            cancelled: counts.cancelled,
            total: counts.total(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch: EmailBatch,
    pub stats: EventStats,
    pub derived_status: BatchStatus,
}
