use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::transport::EmailTransport,
    config::DispatcherSettings,
    models::{
        audit::CreateEmailLog,
        message::{DispatchReport, OutboundEmail, RowError},
        queue::EmailQueueItem,
        status::{DeliveryStatus, QueueStatus},
        template::RenderOutcome,
    },
    services::renderer::TemplateRenderer,
    store::{ProfileStore, QueueStore, TemplateStore},
};

enum RowOutcome {
    Sent,
    Failed(String),
    /// Cancelled between claim and send.
    Cancelled,
}

/// Claims due rows, renders them and hands them to the transport one at a time.
///
/// Every invocation is independent apart from send pacing: claiming is a
/// conditional update so racing invocations never process the same row twice,
/// and all invocations on one dispatcher share a single send clock.
pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    templates: Arc<dyn TemplateStore>,
    profiles: Arc<dyn ProfileStore>,
    transport: Arc<dyn EmailTransport>,
    renderer: TemplateRenderer,
    settings: DispatcherSettings,
    /// Start of the most recent transport call; held across the wait and the send.
    last_send: Mutex<Option<Instant>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        templates: Arc<dyn TemplateStore>,
        profiles: Arc<dyn ProfileStore>,
        transport: Arc<dyn EmailTransport>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            templates,
            profiles,
            transport,
            renderer: TemplateRenderer::new(settings.portal_url.clone()),
            settings,
            last_send: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Process up to `batch_size` due rows (configured default when `None`).
    ///
    /// Per-row failures land in the report; only store failures abort the run.
    pub async fn run(&self, batch_size: Option<usize>) -> Result<DispatchReport> {
        let started = Instant::now();
        let limit = batch_size
            .unwrap_or(self.settings.default_batch_size)
            .clamp(1, self.settings.max_batch_size.max(1));

        let mut report = DispatchReport::default();

        if let Some(after) = self.settings.stale_claim_after {
            let now = Utc::now();
            report.released = self.queue.release_stale(now - after, now).await?;
            if report.released > 0 {
                warn!(
                    released = report.released,
                    "Returned stale processing rows to the queue"
                );
            }
        }

        let due = self.queue.due_items(Utc::now(), limit).await?;
        debug!(due = due.len(), limit, "Loaded due queue rows");

        for (index, item) in due.iter().enumerate() {
            if let Some(budget) = self.settings.time_budget {
                if started.elapsed() >= budget {
                    info!(
                        remaining = due.len() - index,
                        "Dispatch time budget exhausted, leaving remaining rows queued"
                    );
                    break;
                }
            }

            if !self.queue.try_claim(item.id, Utc::now()).await? {
                debug!(queue_id = %item.id, "Row claimed by another dispatcher, skipping");
                report.skipped += 1;
                continue;
            }
            report.processed += 1;

            match self.process_row(item).await? {
                RowOutcome::Sent => report.sent += 1,
                RowOutcome::Cancelled => report.skipped += 1,
                RowOutcome::Failed(error) => {
                    report.failed += 1;
                    report.errors.push(RowError {
                        queue_id: item.id,
                        error,
                    });
                }
            }
        }

        info!(
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch run finished"
        );

        Ok(report)
    }

    async fn process_row(&self, item: &EmailQueueItem) -> Result<RowOutcome> {
        let template = match item.template_id.as_deref() {
            Some(key) => self.templates.get_template(key).await?,
            None => None,
        };

        let recipient_name = self.recipient_name(item).await;
        let variables = self
            .renderer
            .variables(item, recipient_name.as_deref(), Utc::now());

        let outcome = match self
            .renderer
            .render(template.as_ref(), &item.event_type, &variables)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(queue_id = %item.id, error = %e, "Template render failed");
                return self.record_failure(item, format!("Render failed: {}", e)).await;
            }
        };

        if let RenderOutcome::FallbackRendered(_) = outcome {
            debug!(
                queue_id = %item.id,
                template_id = ?item.template_id,
                "Template missing, sending generic message"
            );
        }

        let email = OutboundEmail::new(
            item.id,
            &self.settings.from_address,
            &item.to_email,
            outcome.into_email(),
        )
        .with_tag("event_type", &item.event_type);

        let sent = {
            let mut last_send = self.last_send.lock().await;
            if let Some(previous) = *last_send {
                sleep_until(previous + self.settings.send_interval).await;
            }

            // An operator may have cancelled the row after it was claimed.
            if self.queue.status_of(item.id).await? != Some(QueueStatus::Processing) {
                info!(queue_id = %item.id, "Row cancelled before send, skipping");
                return Ok(RowOutcome::Cancelled);
            }

            *last_send = Some(Instant::now());
            self.transport.send(&email).await
        };

        match sent {
            Ok(provider_id) => {
                if !self
                    .queue
                    .mark_sent(item.id, &provider_id, Utc::now())
                    .await?
                {
                    warn!(
                        queue_id = %item.id,
                        "Row left processing while the send was in flight"
                    );
                }

                self.write_log(
                    CreateEmailLog::new(
                        item.id,
                        item.event_type.clone(),
                        item.to_email.clone(),
                        item.template_id.clone(),
                        DeliveryStatus::Sent,
                        item.attempts + 1,
                    )
                    .with_provider_id(provider_id.clone()),
                )
                .await;

                info!(
                    queue_id = %item.id,
                    event_type = %item.event_type,
                    provider_id = %provider_id,
                    transport = self.transport.name(),
                    "Email sent"
                );
                Ok(RowOutcome::Sent)
            }
            Err(e) => self.record_failure(item, e.to_string()).await,
        }
    }

    /// Count a failed attempt: back to `queued` with backoff, or `failed`
    /// once the attempt budget is spent.
    async fn record_failure(&self, item: &EmailQueueItem, error: String) -> Result<RowOutcome> {
        let now = Utc::now();
        let attempts = (item.attempts + 1).min(item.max_attempts.max(1));

        let retry_at = if attempts >= item.max_attempts {
            self.queue
                .mark_failed(item.id, attempts, &error, now)
                .await?;
            error!(
                queue_id = %item.id,
                attempts,
                error = %error,
                "Email failed permanently"
            );
            None
        } else {
            let retry_at = self
                .settings
                .retry
                .next_run_at(now, item.attempts.max(0) as u32);
            self.queue
                .mark_retry(item.id, attempts, &error, retry_at, now)
                .await?;
            warn!(
                queue_id = %item.id,
                attempts,
                retry_at = %retry_at,
                error = %error,
                "Email send failed, rescheduled"
            );
            Some(retry_at)
        };

        self.write_log(
            CreateEmailLog::new(
                item.id,
                item.event_type.clone(),
                item.to_email.clone(),
                item.template_id.clone(),
                DeliveryStatus::Failed,
                attempts,
            )
            .with_error(error.clone())
            .with_metadata(json!({ "retry_at": retry_at })),
        )
        .await;

        Ok(RowOutcome::Failed(error))
    }

    async fn recipient_name(&self, item: &EmailQueueItem) -> Option<String> {
        let profile = match item.to_user_id {
            Some(user_id) => self.profiles.profile_by_id(user_id).await,
            None => self.profiles.profile_by_email(&item.to_email).await,
        };

        match profile {
            Ok(profile) => profile.and_then(|p| p.display_name()),
            Err(e) => {
                warn!(queue_id = %item.id, error = %e, "Profile lookup failed, using default name");
                None
            }
        }
    }

    async fn write_log(&self, log: CreateEmailLog) {
        let queue_id = log.queue_id;
        if let Err(e) = self.queue.log_attempt(log).await {
            warn!(queue_id = %queue_id, error = %e, "Failed to write email log");
        }
    }

    /// Give failed rows a fresh attempt budget and make them due now.
    pub async fn retry_failed(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Err(anyhow!("No queue ids supplied"));
        }
        let affected = self.queue.requeue_failed(ids, Utc::now()).await?;
        info!(requested = ids.len(), affected, "Failed rows requeued");
        Ok(affected)
    }

    /// Cancel rows that have not been sent yet.
    pub async fn cancel(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Err(anyhow!("No queue ids supplied"));
        }
        let affected = self.queue.cancel(ids, Utc::now()).await?;
        info!(requested = ids.len(), affected, "Queue rows cancelled");
        Ok(affected)
    }

    /// Delete finished rows older than `retention_days`.
    pub async fn purge(&self, retention_days: i64) -> Result<u64> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let purged = self.queue.purge_finished(cutoff).await?;
        if purged > 0 {
            info!(purged, retention_days, "Purged finished queue rows");
        }
        Ok(purged)
    }
}
