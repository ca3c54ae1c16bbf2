use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use email_queue_service::{
    clients::{memory::InMemoryStore, transport::MockTransport},
    config::{Config, DispatcherSettings},
    models::{
        queue::EmailQueueItem,
        recipient::{RecipientList, RecipientListKind},
        rule::NotificationRule,
        status::QueueStatus,
        template::EmailTemplate,
    },
    services::{
        dispatcher::Dispatcher, enqueuer::Enqueuer, resolver::RecipientResolver, rules::RuleEngine,
        stats::StatsAggregator,
    },
};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

pub const FROM_ADDRESS: &str = "noreply@example.com";
pub const PORTAL_URL: &str = "https://portal.test";

/// Dispatcher settings with no inter-send delay so tests run fast.
pub fn fast_settings() -> DispatcherSettings {
    DispatcherSettings::new(FROM_ADDRESS, PORTAL_URL).with_send_interval(Duration::ZERO)
}

/// Every pipeline component wired to one in-memory store and a mock transport.
pub struct Harness {
    pub store: InMemoryStore,
    pub transport: MockTransport,
    pub rules: Arc<RuleEngine>,
    pub enqueuer: Arc<Enqueuer>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: StatsAggregator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockTransport::new(), fast_settings())
    }

    pub fn with(transport: MockTransport, settings: DispatcherSettings) -> Self {
        let store = InMemoryStore::new();
        let shared = Arc::new(store.clone());

        let rules = Arc::new(RuleEngine::new(shared.clone(), shared.clone()));
        let resolver = Arc::new(RecipientResolver::new(shared.clone()));
        let enqueuer = Arc::new(Enqueuer::new(
            rules.clone(),
            shared.clone(),
            shared.clone(),
            resolver,
            shared.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            shared.clone(),
            shared.clone(),
            shared.clone(),
            Arc::new(transport.clone()),
            settings,
        ));

        Self {
            store,
            transport,
            rules,
            enqueuer,
            dispatcher,
            stats: StatsAggregator::new(shared),
        }
    }

    /// Bind `event_type` to `template` and a new list of the given kind.
    pub async fn bind(
        &self,
        event_type: &str,
        template: EmailTemplate,
        kind: RecipientListKind,
        config: JsonValue,
    ) -> RecipientList {
        let list = RecipientList::new(format!("{}_list", event_type), kind, config);
        let rule = NotificationRule::new(event_type, template.id.clone(), list.id);

        self.store.add_template(template).await;
        self.store.add_list(list.clone()).await;
        self.store.add_rule(rule).await;
        list
    }

    pub async fn item(&self, id: Uuid) -> EmailQueueItem {
        self.store
            .items()
            .await
            .into_iter()
            .find(|item| item.id == id)
            .expect("queue row exists")
    }
}

/// A due row placed straight into the queue.
pub fn queued_item(event_type: &str, to_email: &str, priority: i32) -> EmailQueueItem {
    let now = Utc::now();
    EmailQueueItem {
        id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        event_id: Some("event-1".to_string()),
        template_id: None,
        to_email: to_email.to_string(),
        to_user_id: None,
        event_payload: json!({}),
        status: QueueStatus::Queued,
        priority,
        attempts: 0,
        max_attempts: 3,
        scheduled_for: now,
        last_error: None,
        provider_message_id: None,
        batch_id: None,
        tags: vec![event_type.to_string()],
        created_at: now,
        updated_at: now,
    }
}

pub fn created_at(mut item: EmailQueueItem, created_at: DateTime<Utc>) -> EmailQueueItem {
    item.created_at = created_at;
    item.updated_at = created_at;
    item
}

pub fn test_config(resend_api_url: &str) -> Config {
    Config {
        database_url: "postgres://localhost/email_queue_test".to_string(),
        resend_api_url: resend_api_url.to_string(),
        resend_api_key: "re_test_key".to_string(),
        email_from: FROM_ADDRESS.to_string(),
        send_timeout_seconds: 5,
        portal_url: PORTAL_URL.to_string(),
        admin_api_token: "admin-secret".to_string(),
        send_interval_ms: 0,
        default_batch_size: 10,
        max_batch_size: 100,
        max_attempts: 3,
        retry_base_delay_seconds: 60,
        retry_max_delay_seconds: 3600,
        dispatch_interval_seconds: 0,
        dispatch_time_budget_seconds: 0,
        stale_claim_minutes: 15,
        retention_days: 0,
        server_port: 0,
        log_format: "pretty".to_string(),
    }
}
