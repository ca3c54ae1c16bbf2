use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

use crate::{config::Config, models::message::OutboundEmail};

/// The outbound email capability: `send(message) -> provider_id | error`.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<String>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
struct ResendTag<'a> {
    name: &'a str,
    value: String,
}

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    tags: Vec<ResendTag<'a>>,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

pub struct ResendTransport {
    http_client: Client,
    api_url: String,
    api_key: String,
}

impl ResendTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.send_timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(api_url = %config.resend_api_url, "Resend transport initialized");

        Ok(Self {
            http_client,
            api_url: config.resend_api_url.trim_end_matches('/').to_string(),
            api_key: config.resend_api_key.clone(),
        })
    }
}

/// Provider tags only allow ASCII letters, digits, '_' and '-'.
fn sanitize_tag_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String> {
        debug!(queue_id = %email.queue_id, to = %email.to, "Sending email through Resend");

        let request = ResendRequest {
            from: &email.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
            text: email.text.as_deref(),
            tags: email
                .tags
                .iter()
                .map(|(name, value)| ResendTag {
                    name: name.as_str(),
                    value: sanitize_tag_value(value),
                })
                .collect(),
        };

        let response = self
            .http_client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", email.queue_id.to_string())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Email provider request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Email provider returned {}: {}", status, body));
        }

        let body: ResendResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse provider response: {}", e))?;

        Ok(body.id)
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

/// Transport that records messages instead of sending them.
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<OutboundEmail>>>,
    calls: Arc<AtomicUsize>,
    call_times: Arc<Mutex<Vec<Instant>>>,
    failures_remaining: Arc<AtomicUsize>,
    always_fail: bool,
    failure_message: Option<String>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            always_fail: true,
            failure_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Fail the first `count` calls, then succeed.
    pub fn failing_first(count: usize, message: impl Into<String>) -> Self {
        let transport = Self {
            failure_message: Some(message.into()),
            ..Self::default()
        };
        transport.failures_remaining.store(count, Ordering::SeqCst);
        transport
    }

    /// Hold every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each call reached the transport, in call order.
    pub async fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().await.clone()
    }

    pub async fn was_sent_to(&self, address: &str) -> bool {
        self.sent.lock().await.iter().any(|email| email.to == address)
    }
}

#[async_trait]
impl EmailTransport for MockTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().await.push(Instant::now());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail_now = self.always_fail
            || self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        if fail_now {
            let message = self
                .failure_message
                .clone()
                .unwrap_or_else(|| "Mock failure".to_string());
            return Err(anyhow!(message));
        }

        self.sent.lock().await.push(email.clone());
        Ok(format!("mock-{}", email.queue_id))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
