use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::retry::RetryConfig;

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_resend_api_url")]
    pub resend_api_url: String,
    pub resend_api_key: String,
    pub email_from: String,
    #[serde(default = "default_send_timeout_seconds")]
    pub send_timeout_seconds: u64,

    #[serde(default = "default_portal_url")]
    pub portal_url: String,

    pub admin_api_token: String,

    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_seconds")]
    pub retry_base_delay_seconds: u64,
    #[serde(default = "default_retry_max_delay_seconds")]
    pub retry_max_delay_seconds: u64,

    #[serde(default)]
    pub dispatch_interval_seconds: u64,
    #[serde(default)]
    pub dispatch_time_budget_seconds: u64,
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: i64,
    #[serde(default)]
    pub retention_days: i64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_resend_api_url() -> String {
    "https://api.resend.com".to_string()
}

fn default_send_timeout_seconds() -> u64 {
    30
}

fn default_portal_url() -> String {
    "https://portal.example.com".to_string()
}

fn default_send_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    10
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_seconds() -> u64 {
    60
}

fn default_retry_max_delay_seconds() -> u64 {
    3600
}

fn default_stale_claim_minutes() -> i64 {
    15
}

fn default_server_port() -> u16 {
    8080
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Knobs the dispatcher reads on every invocation.
#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub from_address: String,
    pub portal_url: String,
    pub send_interval: Duration,
    pub default_batch_size: usize,
    pub max_batch_size: usize,
    pub time_budget: Option<Duration>,
    pub stale_claim_after: Option<chrono::Duration>,
    pub retry: RetryConfig,
}

impl DispatcherSettings {
    pub fn new(from_address: impl Into<String>, portal_url: impl Into<String>) -> Self {
        Self {
            from_address: from_address.into(),
            portal_url: portal_url.into(),
            send_interval: Duration::from_millis(default_send_interval_ms()),
            default_batch_size: default_batch_size(),
            max_batch_size: default_max_batch_size(),
            time_budget: None,
            stale_claim_after: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_send_interval(mut self, send_interval: Duration) -> Self {
        self.send_interval = send_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_stale_claim_after(mut self, after: chrono::Duration) -> Self {
        self.stale_claim_after = Some(after);
        self
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.max_attempts == 0 {
            return Err(anyhow!("MAX_ATTEMPTS must be at least 1"));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay_ms: self.retry_base_delay_seconds * 1000,
            max_delay_ms: self.retry_max_delay_seconds * 1000,
            backoff_multiplier: 2,
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            from_address: self.email_from.clone(),
            portal_url: self.portal_url.clone(),
            send_interval: Duration::from_millis(self.send_interval_ms),
            default_batch_size: self.default_batch_size,
            max_batch_size: self.max_batch_size,
            time_budget: (self.dispatch_time_budget_seconds > 0)
                .then(|| Duration::from_secs(self.dispatch_time_budget_seconds)),
            stale_claim_after: (self.stale_claim_minutes > 0)
                .then(|| chrono::Duration::minutes(self.stale_claim_minutes)),
            retry: self.retry_config(),
        }
    }
}
