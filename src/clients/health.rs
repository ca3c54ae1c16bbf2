use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::transport::EmailTransport,
    models::{
        batch::StatsScope,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
    store::QueueStore,
};

pub struct HealthChecker {
    queue: Arc<dyn QueueStore>,
    transport: Arc<dyn EmailTransport>,
}

impl HealthChecker {
    pub fn new(queue: Arc<dyn QueueStore>, transport: Arc<dyn EmailTransport>) -> Self {
        Self { queue, transport }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        let db_health = self.check_database().await;
        let db_up = db_health.status != HealthStatus::Unhealthy;
        checks.insert("database".to_string(), db_health);

        if db_up {
            checks.insert("queue".to_string(), self.check_queue().await);
        }

        checks.insert("email_transport".to_string(), self.check_transport());

        let overall_status = self.determine_overall_status(&checks);

        HealthCheckResponse {
            status: overall_status,
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.queue.health_check().await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_queue(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.queue.status_counts(StatsScope::All).await {
            Ok(counts) => {
                let elapsed = start.elapsed().as_millis() as u64;
                ServiceHealth::healthy(elapsed).with_detail(format!(
                    "queued={} processing={} failed={}",
                    counts.queued, counts.processing, counts.failed
                ))
            }
            Err(e) => {
                warn!(error = %e, "Queue stats unavailable");
                ServiceHealth::degraded(format!("Queue stats unavailable: {}", e))
            }
        }
    }

    fn check_transport(&self) -> ServiceHealth {
        match self.transport.name() {
            "mock" => ServiceHealth::degraded("Mock transport, emails are not delivered".to_string()),
            name => ServiceHealth::healthy(0).with_detail(name.to_string()),
        }
    }

    fn determine_overall_status(&self, checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
        let has_unhealthy = checks
            .values()
            .any(|health| health.status == HealthStatus::Unhealthy);

        let has_degraded = checks
            .values()
            .any(|health| health.status == HealthStatus::Degraded);

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
