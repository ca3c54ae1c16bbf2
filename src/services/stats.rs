use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use crate::{
    models::{
        audit::EmailLog,
        batch::{BatchReport, EmailBatch, EventStats, StatsScope, StatusCounts},
        queue::EmailQueueItem,
        status::BatchStatus,
    },
    store::QueueStore,
};

/// Read-only counts over queue rows.
pub struct StatsAggregator {
    queue: Arc<dyn QueueStore>,
}

/// Status of a batch as implied by the live state of its rows.
pub fn derive_batch_status(counts: &StatusCounts) -> BatchStatus {
    if counts.total() == 0 || counts.queued == counts.total() {
        return BatchStatus::Queued;
    }
    if counts.queued > 0 || counts.processing > 0 {
        return BatchStatus::Processing;
    }
    if counts.failed > 0 {
        return BatchStatus::CompletedWithErrors;
    }
    BatchStatus::Completed
}

impl StatsAggregator {
    pub fn new(queue: Arc<dyn QueueStore>) -> Self {
        Self { queue }
    }

    /// Send outcomes for one published event. Unknown events count as zero.
    pub async fn stats_for(&self, event_id: &str, event_type: &str) -> Result<EventStats> {
        let counts = self
            .queue
            .status_counts(StatsScope::Event {
                event_type: event_type.to_string(),
                event_id: event_id.to_string(),
            })
            .await?;
        Ok(counts.into())
    }

    pub async fn queue_stats(&self) -> Result<EventStats> {
        Ok(self.queue.status_counts(StatsScope::All).await?.into())
    }

    /// One queue row with its attempts and last error, for operator inspection.
    pub async fn queue_item(&self, id: Uuid) -> Result<Option<EmailQueueItem>> {
        self.queue.get_item(id).await
    }

    pub async fn batch_report(&self, batch_id: Uuid) -> Result<Option<BatchReport>> {
        match self.queue.get_batch(batch_id).await? {
            Some(batch) => Ok(Some(self.report_for(batch).await?)),
            None => Ok(None),
        }
    }

    /// Newest batches first, each with its live counts.
    pub async fn recent_batches(&self, limit: usize) -> Result<Vec<BatchReport>> {
        let batches = self.queue.recent_batches(limit).await?;
        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            reports.push(self.report_for(batch).await?);
        }
        Ok(reports)
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<EmailLog>> {
        self.queue.recent_logs(limit).await
    }

    async fn report_for(&self, batch: EmailBatch) -> Result<BatchReport> {
        let counts = self
            .queue
            .status_counts(StatsScope::Batch(batch.id))
            .await?;

        Ok(BatchReport {
            batch,
            stats: counts.into(),
            derived_status: derive_batch_status(&counts),
        })
    }
}
