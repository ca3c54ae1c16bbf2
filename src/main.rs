use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use email_queue_service::{
    api::{AppState, run_api_server},
    clients::{database::DatabaseClient, health::HealthChecker, transport::ResendTransport},
    config::Config,
    models::retry::RetryConfig,
    services::{
        dispatcher::Dispatcher, enqueuer::Enqueuer, resolver::RecipientResolver, rules::RuleEngine,
        stats::StatsAggregator,
    },
    utils::{init_tracing, retry_with_backoff},
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config.log_format);

    info!(port = config.server_port, "Starting email queue service");

    let connect_retry = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 1_000,
        max_delay_ms: 10_000,
        backoff_multiplier: 2,
    };
    let database = retry_with_backoff(&connect_retry, "postgres", || {
        DatabaseClient::connect(&config.database_url)
    })
    .await?;
    database.migrate().await?;
    let database = Arc::new(database);

    let transport = Arc::new(ResendTransport::new(&config)?);

    let rules = Arc::new(RuleEngine::new(database.clone(), database.clone()));
    let resolver = Arc::new(RecipientResolver::new(database.clone()));
    let enqueuer = Arc::new(
        Enqueuer::new(
            rules.clone(),
            database.clone(),
            database.clone(),
            resolver,
            database.clone(),
        )
        .with_max_attempts(config.max_attempts),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        database.clone(),
        database.clone(),
        database.clone(),
        transport.clone(),
        config.dispatcher_settings(),
    ));

    if config.dispatch_interval_seconds > 0 {
        let dispatcher = dispatcher.clone();
        let interval = Duration::from_secs(config.dispatch_interval_seconds);
        let retention_days = config.retention_days;

        tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "Scheduled dispatcher started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Err(e) = dispatcher.run(None).await {
                    error!(error = %e, "Scheduled dispatch failed");
                }
                if let Err(e) = dispatcher.purge(retention_days).await {
                    error!(error = %e, "Retention cleanup failed");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        enqueuer,
        dispatcher,
        stats: StatsAggregator::new(database.clone()),
        rules,
        templates: database.clone(),
        lists: database.clone(),
        health_checker: HealthChecker::new(database, transport),
        admin_token: config.admin_api_token.clone(),
    });

    run_api_server(config.server_port, state).await
}
