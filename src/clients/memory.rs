//! In-process store used by tests and local dry runs.
//!
//! All state sits behind one mutex so every trait method is atomic in the same
//! way the conditional SQL updates are.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::{
        audit::{CreateEmailLog, EmailLog},
        batch::{EmailBatch, InsertedBatch, NewEmailBatch, StatsScope, StatusCounts},
        queue::{EmailQueueItem, NewQueueItem},
        recipient::{Profile, RecipientList},
        rule::NotificationRule,
        status::{BatchStatus, QueueStatus},
        template::EmailTemplate,
    },
    store::{ProfileStore, QueueStore, RecipientListStore, RuleStore, TemplateStore},
};

#[derive(Default)]
struct MemoryState {
    templates: HashMap<String, EmailTemplate>,
    rules: Vec<NotificationRule>,
    lists: HashMap<Uuid, RecipientList>,
    profiles: Vec<Profile>,
    /// Insertion order doubles as creation order for ties on `created_at`.
    items: Vec<EmailQueueItem>,
    batches: HashMap<Uuid, EmailBatch>,
    logs: Vec<EmailLog>,
}

impl MemoryState {
    fn item_mut(&mut self, id: Uuid) -> Option<&mut EmailQueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn in_scope(item: &EmailQueueItem, scope: &StatsScope) -> bool {
        match scope {
            StatsScope::All => true,
            StatsScope::Event {
                event_type,
                event_id,
            } => &item.event_type == event_type && item.event_id.as_deref() == Some(event_id),
            StatsScope::Batch(batch_id) => item.batch_id == Some(*batch_id),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    fail_next_insert: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_template(&self, template: EmailTemplate) {
        let mut state = self.state.lock().await;
        state.templates.insert(template.id.clone(), template);
    }

    pub async fn add_rule(&self, rule: NotificationRule) {
        self.state.lock().await.rules.push(rule);
    }

    pub async fn add_list(&self, list: RecipientList) {
        let mut state = self.state.lock().await;
        state.lists.insert(list.id, list);
    }

    pub async fn add_profile(&self, profile: Profile) {
        self.state.lock().await.profiles.push(profile);
    }

    /// Place a fully formed row, bypassing the enqueuer.
    pub async fn put_item(&self, item: EmailQueueItem) {
        self.state.lock().await.items.push(item);
    }

    pub async fn items(&self) -> Vec<EmailQueueItem> {
        self.state.lock().await.items.clone()
    }

    pub async fn logs(&self) -> Vec<EmailLog> {
        self.state.lock().await.logs.clone()
    }

    pub async fn rules(&self) -> Vec<NotificationRule> {
        self.state.lock().await.rules.clone()
    }

    /// Simulate losing the connection to the backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `insert_batch` fail before anything is written.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("Store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TemplateStore for InMemoryStore {
    async fn get_template(&self, key: &str) -> Result<Option<EmailTemplate>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.templates.get(key).cloned())
    }

    async fn upsert_template(&self, mut template: EmailTemplate) -> Result<()> {
        self.ensure_available()?;
        template.updated_at = Some(Utc::now());
        let mut state = self.state.lock().await;
        state.templates.insert(template.id.clone(), template);
        Ok(())
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn enabled_rules(&self, event_type: &str) -> Result<Vec<NotificationRule>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .rules
            .iter()
            .filter(|rule| rule.enabled && rule.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn save_rule(&self, rule: NotificationRule) -> Result<NotificationRule> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = rule;
                existing.created_at = created_at;
                Ok(existing.clone())
            }
            None => {
                state.rules.push(rule.clone());
                Ok(rule)
            }
        }
    }

    async fn disable_other_rules(&self, event_type: &str, keep: Uuid) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut disabled = 0;
        for rule in state
            .rules
            .iter_mut()
            .filter(|rule| rule.enabled && rule.event_type == event_type && rule.id != keep)
        {
            rule.enabled = false;
            disabled += 1;
        }
        Ok(disabled)
    }
}

#[async_trait]
impl RecipientListStore for InMemoryStore {
    async fn get_list(&self, id: Uuid) -> Result<Option<RecipientList>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.lists.get(&id).cloned())
    }

    async fn delete_list(&self, id: Uuid) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.state.lock().await.lists.remove(&id).is_some())
    }
}

#[async_trait]
impl ProfileStore for InMemoryStore {
    async fn profile_by_id(&self, id: Uuid) -> Result<Option<Profile>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.profiles.iter().find(|p| p.id == id).cloned())
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .iter()
            .find(|p| {
                p.email
                    .as_deref()
                    .is_some_and(|candidate| candidate.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn active_profiles_with_roles(&self, roles: &[String]) -> Result<Vec<Profile>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .iter()
            .filter(|p| p.is_active && p.email.is_some())
            .filter(|p| p.role.as_ref().is_some_and(|role| roles.contains(role)))
            .cloned()
            .collect())
    }

    async fn active_profiles(&self) -> Result<Vec<Profile>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .iter()
            .filter(|p| p.is_active && p.email.is_some())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn insert_batch(
        &self,
        batch: NewEmailBatch,
        items: Vec<NewQueueItem>,
    ) -> Result<InsertedBatch> {
        self.ensure_available()?;
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("Simulated insert failure"));
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();
        let batch_id = Uuid::new_v4();

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            if let Some(key) = item.dedupe_key() {
                let exists = state
                    .items
                    .iter()
                    .chain(rows.iter())
                    .any(|existing: &EmailQueueItem| {
                        existing.event_id.as_deref() == Some(key.1.as_str())
                            && existing.event_type == key.0
                            && existing.to_email.to_lowercase() == key.2
                            && existing.template_id.clone().unwrap_or_default() == key.3
                    });
                if exists {
                    continue;
                }
            }

            rows.push(EmailQueueItem {
                id: Uuid::new_v4(),
                event_type: item.event_type,
                event_id: item.event_id,
                template_id: item.template_id,
                to_email: item.to_email,
                to_user_id: item.to_user_id,
                event_payload: item.event_payload,
                status: QueueStatus::Queued,
                priority: item.priority,
                attempts: 0,
                max_attempts: item.max_attempts,
                scheduled_for: item.scheduled_for,
                last_error: None,
                provider_message_id: None,
                batch_id: Some(batch_id),
                tags: item.tags,
                created_at: now,
                updated_at: now,
            });
        }

        let inserted = rows.len();
        state.batches.insert(
            batch_id,
            EmailBatch {
                id: batch_id,
                notification_type: batch.notification_type,
                event_id: batch.event_id,
                status: BatchStatus::Queued,
                total_recipients: inserted as i32,
                created_at: now,
                updated_at: now,
            },
        );
        state.items.extend(rows);

        Ok(InsertedBatch { batch_id, inserted })
    }

    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailQueueItem>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut due: Vec<EmailQueueItem> = state
            .items
            .iter()
            .filter(|item| item.status == QueueStatus::Queued && item.scheduled_for <= now)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal keys.
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.item_mut(id) {
            Some(item) if item.status == QueueStatus::Queued => {
                item.status = QueueStatus::Processing;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<EmailQueueItem>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.items.iter().find(|item| item.id == id).cloned())
    }

    async fn status_of(&self, id: Uuid) -> Result<Option<QueueStatus>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.status))
    }

    async fn mark_sent(&self, id: Uuid, provider_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.item_mut(id) {
            Some(item) if item.status == QueueStatus::Processing => {
                item.status = QueueStatus::Sent;
                item.provider_message_id = Some(provider_id.to_string());
                item.last_error = None;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.item_mut(id) {
            Some(item) if item.status == QueueStatus::Processing => {
                item.status = QueueStatus::Queued;
                item.attempts = attempts;
                item.last_error = Some(error.to_string());
                item.scheduled_for = scheduled_for;
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        match state.item_mut(id) {
            Some(item) if item.status == QueueStatus::Processing => {
                item.status = QueueStatus::Failed;
                item.attempts = attempts;
                item.last_error = Some(error.to_string());
                item.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut affected = 0;
        for item in state
            .items
            .iter_mut()
            .filter(|item| ids.contains(&item.id) && item.status.is_cancellable())
        {
            item.status = QueueStatus::Cancelled;
            item.updated_at = now;
            affected += 1;
        }
        Ok(affected)
    }

    async fn requeue_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut affected = 0;
        for item in state
            .items
            .iter_mut()
            .filter(|item| ids.contains(&item.id) && item.status == QueueStatus::Failed)
        {
            item.status = QueueStatus::Queued;
            item.attempts = 0;
            item.scheduled_for = now;
            item.updated_at = now;
            affected += 1;
        }
        Ok(affected)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let mut affected = 0;
        for item in state
            .items
            .iter_mut()
            .filter(|item| item.status == QueueStatus::Processing && item.updated_at < cutoff)
        {
            item.status = QueueStatus::Queued;
            item.updated_at = now;
            affected += 1;
        }
        Ok(affected)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|item| {
            let finished = match item.status {
                QueueStatus::Sent | QueueStatus::Cancelled => true,
                QueueStatus::Failed => item.attempts_exhausted(),
                QueueStatus::Queued | QueueStatus::Processing => false,
            };
            !(finished && item.updated_at < cutoff)
        });
        Ok((before - state.items.len()) as u64)
    }

    async fn status_counts(&self, scope: StatsScope) -> Result<StatusCounts> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for item in state
            .items
            .iter()
            .filter(|item| MemoryState::in_scope(item, &scope))
        {
            counts.add(item.status, 1);
        }
        Ok(counts)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<EmailBatch>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn recent_batches(&self, limit: usize) -> Result<Vec<EmailBatch>> {
        self.ensure_available()?;
        let mut batches: Vec<EmailBatch> =
            self.state.lock().await.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn log_attempt(&self, log: CreateEmailLog) -> Result<()> {
        self.ensure_available()?;
        self.state.lock().await.logs.push(EmailLog {
            id: Uuid::new_v4(),
            queue_id: log.queue_id,
            event_type: log.event_type,
            to_email: log.to_email,
            template_id: log.template_id,
            status: log.status,
            attempt: log.attempt,
            provider_message_id: log.provider_message_id,
            error_message: log.error_message,
            metadata: log.metadata,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<EmailLog>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.logs.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}
