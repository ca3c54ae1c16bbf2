use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::models::retry::RetryConfig;

/// Install the global subscriber: JSON lines unless `format` is `pretty`.
pub fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,email_queue_service=debug,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    }
}

/// Keep calling `connect` until the startup dependency named `dependency`
/// answers or `config.max_attempts` calls have failed.
///
/// Waits follow the same curve as row rescheduling (`RetryConfig::row_backoff`)
/// with up to 10% jitter so restarted replicas do not reconnect in lockstep.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    dependency: &str,
    connect: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;

    loop {
        let error = match connect().await {
            Ok(connected) => {
                if failures > 0 {
                    info!(dependency, failures, "Startup dependency reachable");
                }
                return Ok(connected);
            }
            Err(e) => e,
        };

        failures += 1;
        if failures >= config.max_attempts {
            warn!(
                dependency,
                failures,
                error = %error,
                "Giving up on startup dependency"
            );
            return Err(error);
        }

        let wait = config.row_backoff(failures - 1);
        let jitter: f64 = rand::random_range(-0.1..=0.1);
        let wait = wait.mul_f64(1.0 + jitter);

        debug!(
            dependency,
            failures,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "Startup dependency unreachable, waiting before the next try"
        );
        sleep(wait).await;
    }
}
