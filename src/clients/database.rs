use std::collections::HashMap;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
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

const SCHEMA: &str = include_str!("../../migrations/0001_email_pipeline.sql");

const QUEUE_COLUMNS: &str = "id, event_type, event_id, template_id, to_email, to_user_id, \
     event_payload, status, priority, attempts, max_attempts, scheduled_for, last_error, \
     provider_message_id, batch_id, tags, created_at, updated_at";

const PROFILE_COLUMNS: &str =
    "id, email, first_name, last_name, role, is_active, preferences, attributes";

const TEMPLATE_COLUMNS: &str =
    "id, name, subject, body_html, body_text, category, is_active, metadata, updated_at";

const BATCH_COLUMNS: &str =
    "id, notification_type, event_id, status, total_recipients, created_at, updated_at";

const LOG_COLUMNS: &str = "id, queue_id, event_type, to_email, template_id, status, attempt, \
     provider_message_id, error_message, metadata, created_at";

const RULE_COLUMNS: &str =
    "id, event_type, template_id, recipient_list_id, enabled, priority, tags, created_at";

/// PostgreSQL-backed implementation of every store seam.
///
/// One connection behind a mutex: the dispatcher is sequential by design and
/// the enqueue transaction needs exclusive access to the client.
pub struct DatabaseClient {
    client: Mutex<Client>,
}

fn queue_item_from_row(row: &Row) -> Result<EmailQueueItem> {
    let status: String = row.try_get("status")?;
    Ok(EmailQueueItem {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        event_id: row.try_get("event_id")?,
        template_id: row.try_get("template_id")?,
        to_email: row.try_get("to_email")?,
        to_user_id: row.try_get("to_user_id")?,
        event_payload: row.try_get("event_payload")?,
        status: status.parse()?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        scheduled_for: row.try_get("scheduled_for")?,
        last_error: row.try_get("last_error")?,
        provider_message_id: row.try_get("provider_message_id")?,
        batch_id: row.try_get("batch_id")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Preferences are stored as a JSON object; non-boolean entries are ignored.
fn preferences_from_json(value: JsonValue) -> HashMap<String, bool> {
    match value {
        JsonValue::Object(map) => map
            .into_iter()
            .filter_map(|(key, value)| value.as_bool().map(|subscribed| (key, subscribed)))
            .collect(),
        _ => HashMap::new(),
    }
}

fn profile_from_row(row: &Row) -> Result<Profile> {
    Ok(Profile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        role: row.try_get("role")?,
        is_active: row.try_get("is_active")?,
        preferences: preferences_from_json(row.try_get("preferences")?),
        attributes: row.try_get("attributes")?,
    })
}

fn template_from_row(row: &Row) -> Result<EmailTemplate> {
    Ok(EmailTemplate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        subject: row.try_get("subject")?,
        body_html: row.try_get("body_html")?,
        body_text: row.try_get("body_text")?,
        category: row.try_get("category")?,
        is_active: row.try_get("is_active")?,
        metadata: row.try_get("metadata")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rule_from_row(row: &Row) -> Result<NotificationRule> {
    Ok(NotificationRule {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        template_id: row.try_get("template_id")?,
        recipient_list_id: row.try_get("recipient_list_id")?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        tags: row.try_get("tags")?,
        created_at: row.try_get("created_at")?,
    })
}

fn batch_from_row(row: &Row) -> Result<EmailBatch> {
    let status: String = row.try_get("status")?;
    Ok(EmailBatch {
        id: row.try_get("id")?,
        notification_type: row.try_get("notification_type")?,
        event_id: row.try_get("event_id")?,
        status: status.parse::<BatchStatus>()?,
        total_recipients: row.try_get("total_recipients")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn log_from_row(row: &Row) -> Result<EmailLog> {
    let status: String = row.try_get("status")?;
    Ok(EmailLog {
        id: row.try_get("id")?,
        queue_id: row.try_get("queue_id")?,
        event_type: row.try_get("event_type")?,
        to_email: row.try_get("to_email")?,
        template_id: row.try_get("template_id")?,
        status: status.parse()?,
        attempt: row.try_get("attempt")?,
        provider_message_id: row.try_get("provider_message_id")?,
        error_message: row.try_get("error_message")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn list_from_row(row: &Row) -> Result<RecipientList> {
    let kind: String = row.try_get("kind")?;
    Ok(RecipientList {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        kind: kind.parse()?,
        config: row.try_get("config")?,
        is_active: row.try_get("is_active")?,
        is_system: row.try_get("is_system")?,
    })
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .lock()
            .await
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to apply schema: {}", e))?;

        info!("Database schema is up to date");
        Ok(())
    }

    async fn execute_update(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64> {
        self.client
            .lock()
            .await
            .execute(sql, params)
            .await
            .map_err(|e| anyhow!("Database update failed: {}", e))
    }
}

#[async_trait]
impl TemplateStore for DatabaseClient {
    async fn get_template(&self, key: &str) -> Result<Option<EmailTemplate>> {
        let sql = format!("SELECT {} FROM email_templates WHERE id = $1", TEMPLATE_COLUMNS);
        let row = self.client.lock().await.query_opt(&sql, &[&key]).await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn upsert_template(&self, template: EmailTemplate) -> Result<()> {
        self.execute_update(
            "INSERT INTO email_templates \
                 (id, name, subject, body_html, body_text, category, is_active, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
                 name = EXCLUDED.name, subject = EXCLUDED.subject, \
                 body_html = EXCLUDED.body_html, body_text = EXCLUDED.body_text, \
                 category = EXCLUDED.category, is_active = EXCLUDED.is_active, \
                 metadata = EXCLUDED.metadata, updated_at = now()",
            &[
                &template.id,
                &template.name,
                &template.subject,
                &template.body_html,
                &template.body_text,
                &template.category,
                &template.is_active,
                &template.metadata,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for DatabaseClient {
    async fn enabled_rules(&self, event_type: &str) -> Result<Vec<NotificationRule>> {
        let sql = format!(
            "SELECT {} FROM notification_rules WHERE event_type = $1 AND enabled",
            RULE_COLUMNS
        );
        let rows = self.client.lock().await.query(&sql, &[&event_type]).await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn save_rule(&self, rule: NotificationRule) -> Result<NotificationRule> {
        let sql = format!(
            "INSERT INTO notification_rules \
                 (id, event_type, template_id, recipient_list_id, enabled, priority, tags, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
                 event_type = EXCLUDED.event_type, template_id = EXCLUDED.template_id, \
                 recipient_list_id = EXCLUDED.recipient_list_id, enabled = EXCLUDED.enabled, \
                 priority = EXCLUDED.priority, tags = EXCLUDED.tags \
             RETURNING {}",
            RULE_COLUMNS
        );
        let row = self
            .client
            .lock()
            .await
            .query_one(
                &sql,
                &[
                    &rule.id,
                    &rule.event_type,
                    &rule.template_id,
                    &rule.recipient_list_id,
                    &rule.enabled,
                    &rule.priority,
                    &rule.tags,
                    &rule.created_at,
                ],
            )
            .await?;
        rule_from_row(&row)
    }

    async fn disable_other_rules(&self, event_type: &str, keep: Uuid) -> Result<u64> {
        self.execute_update(
            "UPDATE notification_rules SET enabled = FALSE \
             WHERE event_type = $1 AND id <> $2 AND enabled",
            &[&event_type, &keep],
        )
        .await
    }
}

#[async_trait]
impl RecipientListStore for DatabaseClient {
    async fn get_list(&self, id: Uuid) -> Result<Option<RecipientList>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt(
                "SELECT id, name, code, kind, config, is_active, is_system \
                 FROM recipient_lists WHERE id = $1",
                &[&id],
            )
            .await?;
        row.as_ref().map(list_from_row).transpose()
    }

    async fn delete_list(&self, id: Uuid) -> Result<bool> {
        let deleted = self
            .execute_update(
                "DELETE FROM recipient_lists WHERE id = $1 AND NOT is_system",
                &[&id],
            )
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl ProfileStore for DatabaseClient {
    async fn profile_by_id(&self, id: Uuid) -> Result<Option<Profile>> {
        let sql = format!("SELECT {} FROM profiles WHERE id = $1", PROFILE_COLUMNS);
        let row = self.client.lock().await.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE lower(email) = lower($1) LIMIT 1",
            PROFILE_COLUMNS
        );
        let row = self.client.lock().await.query_opt(&sql, &[&email]).await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn active_profiles_with_roles(&self, roles: &[String]) -> Result<Vec<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles \
             WHERE is_active AND email IS NOT NULL AND role = ANY($1) \
             ORDER BY email",
            PROFILE_COLUMNS
        );
        let rows = self.client.lock().await.query(&sql, &[&roles]).await?;
        rows.iter().map(profile_from_row).collect()
    }

    async fn active_profiles(&self) -> Result<Vec<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE is_active AND email IS NOT NULL ORDER BY email",
            PROFILE_COLUMNS
        );
        let rows = self.client.lock().await.query(&sql, &[]).await?;
        rows.iter().map(profile_from_row).collect()
    }
}

#[async_trait]
impl QueueStore for DatabaseClient {
    async fn insert_batch(
        &self,
        batch: NewEmailBatch,
        items: Vec<NewQueueItem>,
    ) -> Result<InsertedBatch> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| anyhow!("Failed to open enqueue transaction: {}", e))?;

        let batch_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO email_batches (id, notification_type, event_id, status, total_recipients) \
             VALUES ($1, $2, $3, 'queued', 0)",
            &[&batch_id, &batch.notification_type, &batch.event_id],
        )
        .await?;

        // Rows already queued for the same event, address and template hit the
        // dedupe index and are skipped.
        let insert = tx
            .prepare(
                "INSERT INTO email_queue \
                     (id, event_type, event_id, template_id, to_email, to_user_id, event_payload, \
                      status, priority, attempts, max_attempts, scheduled_for, batch_id, tags) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued', $8, 0, $9, $10, $11, $12) \
                 ON CONFLICT DO NOTHING",
            )
            .await?;

        let mut inserted = 0u64;
        for item in &items {
            inserted += tx
                .execute(
                    &insert,
                    &[
                        &Uuid::new_v4(),
                        &item.event_type,
                        &item.event_id,
                        &item.template_id,
                        &item.to_email,
                        &item.to_user_id,
                        &item.event_payload,
                        &item.priority,
                        &item.max_attempts,
                        &item.scheduled_for,
                        &batch_id,
                        &item.tags,
                    ],
                )
                .await?;
        }

        tx.execute(
            "UPDATE email_batches SET total_recipients = $2 WHERE id = $1",
            &[&batch_id, &(inserted as i32)],
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| anyhow!("Failed to commit enqueue transaction: {}", e))?;

        debug!(batch_id = %batch_id, inserted, "Batch written to database");

        Ok(InsertedBatch {
            batch_id,
            inserted: inserted as usize,
        })
    }

    async fn due_items(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EmailQueueItem>> {
        let sql = format!(
            "SELECT {} FROM email_queue \
             WHERE status = 'queued' AND scheduled_for <= $1 \
             ORDER BY priority ASC, created_at ASC \
             LIMIT $2",
            QUEUE_COLUMNS
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&now, &(limit as i64)])
            .await?;
        rows.iter().map(queue_item_from_row).collect()
    }

    async fn try_claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let claimed = self
            .execute_update(
                "UPDATE email_queue SET status = 'processing', updated_at = $2 \
                 WHERE id = $1 AND status = 'queued'",
                &[&id, &now],
            )
            .await?;
        Ok(claimed == 1)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<EmailQueueItem>> {
        let sql = format!("SELECT {} FROM email_queue WHERE id = $1", QUEUE_COLUMNS);
        let row = self.client.lock().await.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    async fn status_of(&self, id: Uuid) -> Result<Option<QueueStatus>> {
        let row = self
            .client
            .lock()
            .await
            .query_opt("SELECT status FROM email_queue WHERE id = $1", &[&id])
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<_, String>("status")?.parse()?)),
            None => Ok(None),
        }
    }

    async fn mark_sent(&self, id: Uuid, provider_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let updated = self
            .execute_update(
                "UPDATE email_queue \
                 SET status = 'sent', provider_message_id = $2, last_error = NULL, updated_at = $3 \
                 WHERE id = $1 AND status = 'processing'",
                &[&id, &provider_id, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self
            .execute_update(
                "UPDATE email_queue \
                 SET status = 'queued', attempts = $2, last_error = $3, scheduled_for = $4, \
                     updated_at = $5 \
                 WHERE id = $1 AND status = 'processing'",
                &[&id, &attempts, &error, &scheduled_for, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        attempts: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self
            .execute_update(
                "UPDATE email_queue \
                 SET status = 'failed', attempts = $2, last_error = $3, updated_at = $4 \
                 WHERE id = $1 AND status = 'processing'",
                &[&id, &attempts, &error, &now],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn cancel(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        self.execute_update(
            "UPDATE email_queue SET status = 'cancelled', updated_at = $2 \
             WHERE id = ANY($1) AND status IN ('queued', 'processing')",
            &[&ids, &now],
        )
        .await
    }

    async fn requeue_failed(&self, ids: &[Uuid], now: DateTime<Utc>) -> Result<u64> {
        self.execute_update(
            "UPDATE email_queue \
             SET status = 'queued', attempts = 0, scheduled_for = $2, updated_at = $2 \
             WHERE id = ANY($1) AND status = 'failed'",
            &[&ids, &now],
        )
        .await
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        self.execute_update(
            "UPDATE email_queue SET status = 'queued', updated_at = $2 \
             WHERE status = 'processing' AND updated_at < $1",
            &[&cutoff, &now],
        )
        .await
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.execute_update(
            "DELETE FROM email_queue \
             WHERE updated_at < $1 \
               AND (status IN ('sent', 'cancelled') \
                    OR (status = 'failed' AND attempts >= max_attempts))",
            &[&cutoff],
        )
        .await
    }

    async fn status_counts(&self, scope: StatsScope) -> Result<StatusCounts> {
        let client = self.client.lock().await;
        let rows = match &scope {
            StatsScope::All => {
                client
                    .query(
                        "SELECT status, COUNT(*) AS n FROM email_queue GROUP BY status",
                        &[],
                    )
                    .await?
            }
            StatsScope::Event {
                event_type,
                event_id,
            } => {
                client
                    .query(
                        "SELECT status, COUNT(*) AS n FROM email_queue \
                         WHERE event_type = $1 AND event_id = $2 GROUP BY status",
                        &[event_type, event_id],
                    )
                    .await?
            }
            StatsScope::Batch(batch_id) => {
                client
                    .query(
                        "SELECT status, COUNT(*) AS n FROM email_queue \
                         WHERE batch_id = $1 GROUP BY status",
                        &[batch_id],
                    )
                    .await?
            }
        };

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: QueueStatus = row.try_get::<_, String>("status")?.parse()?;
            let n: i64 = row.try_get("n")?;
            counts.add(status, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<EmailBatch>> {
        let sql = format!("SELECT {} FROM email_batches WHERE id = $1", BATCH_COLUMNS);
        let row = self.client.lock().await.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn recent_batches(&self, limit: usize) -> Result<Vec<EmailBatch>> {
        let sql = format!(
            "SELECT {} FROM email_batches ORDER BY created_at DESC LIMIT $1",
            BATCH_COLUMNS
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&(limit as i64)])
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn log_attempt(&self, log: CreateEmailLog) -> Result<()> {
        let status = log.status.to_string();

        self.execute_update(
            "INSERT INTO email_logs \
                 (id, queue_id, event_type, to_email, template_id, status, attempt, \
                  provider_message_id, error_message, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &Uuid::new_v4(),
                &log.queue_id,
                &log.event_type,
                &log.to_email,
                &log.template_id,
                &status,
                &log.attempt,
                &log.provider_message_id,
                &log.error_message,
                &log.metadata,
            ],
        )
        .await
        .map_err(|e| {
            error!(
                error = %e,
                queue_id = %log.queue_id,
                "Failed to write email log to database"
            );
            e
        })?;

        debug!(queue_id = %log.queue_id, status = %status, "Email log written to database");

        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<EmailLog>> {
        let sql = format!(
            "SELECT {} FROM email_logs ORDER BY created_at DESC LIMIT $1",
            LOG_COLUMNS
        );
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&(limit as i64)])
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .lock()
            .await
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}
