//! Store seams for the pipeline.
//!
//! Rules, lists, templates and profiles are read-only inputs to the resolver,
//! rule engine and dispatcher; the queue store is the only shared mutable state
//! between dispatcher invocations. `clients::database` implements every trait
//! over PostgreSQL and `clients::memory` over in-process maps.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    audit::{CreateEmailLog, EmailLog},
    batch::{EmailBatch, InsertedBatch, NewEmailBatch, StatsScope, StatusCounts},
    queue::{EmailQueueItem, NewQueueItem},
    recipient::{Profile, RecipientList},
    rule::NotificationRule,
    status::QueueStatus,
    template::EmailTemplate,
};

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, key: &str) -> Result<Option<EmailTemplate>>;

    async fn upsert_template(&self, template: EmailTemplate) -> Result<()>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every enabled rule for the event type, in no particular order.
    async fn enabled_rules(&self, event_type: &str) -> Result<Vec<NotificationRule>>;

    /// Insert or replace by id and return the stored rule. Replacing keeps the
    /// original `created_at`.
    async fn save_rule(&self, rule: NotificationRule) -> Result<NotificationRule>;

    /// Disable all enabled rules for the event type except `keep`.
    async fn disable_other_rules(&self, event_type: &str, keep: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait RecipientListStore: Send + Sync {
    async fn get_list(&self, id: Uuid) -> Result<Option<RecipientList>>;

    async fn delete_list(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile_by_id(&self, id: Uuid) -> Result<Option<Profile>>;

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>>;

    /// Active profiles with an address whose role is one of `roles`.
    async fn active_profiles_with_roles(&self, roles: &[String]) -> Result<Vec<Profile>>;

    async fn active_profiles(&self) -> Result<Vec<Profile>>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert the batch and all its rows as one unit. Rows whose
    /// (event, recipient, template) already exist are skipped.
    async fn insert_batch(
        &self,
        batch: NewEmailBatch,
        items: Vec<NewQueueItem>,
    ) -> Result<InsertedBatch>;

    /// Queued rows due at `now`, ordered by priority then creation time.
    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailQueueItem>>;

    /// `queued -> processing` only if the row is still queued.
    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn get_item(&self, id: Uuid) -> Result<Option<EmailQueueItem>>;

    async fn status_of(&self, id: Uuid) -> Result<Option<QueueStatus>>;

    /// `processing -> sent`; false if the row left `processing` meanwhile.
    async fn mark_sent(&self, id: Uuid, provider_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// `processing -> queued` with a pushed-back `scheduled_for`.
    async fn mark_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `processing -> failed`, leaving `scheduled_for` untouched.
    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn cancel(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64>;

    /// `failed -> queued` with a fresh attempt budget.
    async fn requeue_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64>;

    /// `processing` rows not touched since `cutoff` go back to `queued`.
    async fn release_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Delete terminal rows last updated before `cutoff`.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn status_counts(&self, scope: StatsScope) -> Result<StatusCounts>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<EmailBatch>>;

    /// Newest batches first.
    async fn recent_batches(&self, limit: usize) -> Result<Vec<EmailBatch>>;

    async fn log_attempt(&self, log: CreateEmailLog) -> Result<()>;

    /// Newest email log entries first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<EmailLog>>;

    async fn health_check(&self) -> Result<()>;
}
