use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use email_queue_service::{
    clients::transport::MockTransport,
    models::{
        recipient::{Profile, RecipientListKind},
        retry::RetryConfig,
        status::{DeliveryStatus, QueueStatus},
        template::EmailTemplate,
    },
    store::QueueStore,
};
use serde_json::json;
use tokio::time::Instant;

use crate::common::{FROM_ADDRESS, Harness, created_at, fast_settings, queued_item};

/// Test: Due rows are sent, finalized and logged
#[tokio::test]
async fn test_dispatch_sends_due_rows() -> Result<()> {
    let harness = Harness::new();
    harness
        .bind(
            "update_published",
            EmailTemplate::new(
                "update_published",
                "New update: {{title}}",
                "<p>Hello {{user_name}}, read {{ Title }} at {{portal_url}}</p>",
            ),
            RecipientListKind::RoleBased,
            json!({"roles": ["member"]}),
        )
        .await;
    harness
        .store
        .add_profile(Profile::new("ann@example.com", "member").with_name("Ann", "Lee"))
        .await;

    harness
        .enqueuer
        .enqueue("update_published", Some("update-1"), json!({"title": "Hi", "id": "u1"}))
        .await?;

    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);
    assert!(report.errors.is_empty());

    let sent = harness.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, FROM_ADDRESS);
    assert_eq!(sent[0].to, "ann@example.com");
    assert_eq!(sent[0].subject, "New update: Hi");
    assert!(sent[0].html.contains("Hello Ann Lee"));
    assert!(sent[0].html.contains("https://portal.test/updates/u1"));
    assert!(!sent[0].html.contains("{{"));

    let item = harness.store.items().await.remove(0);
    assert_eq!(item.status, QueueStatus::Sent);
    assert_eq!(
        item.provider_message_id,
        Some(format!("mock-{}", item.id))
    );

    let logs = harness.store.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Sent);
    assert_eq!(logs[0].attempt, 1);

    Ok(())
}

/// Test: A row whose template is missing is sent with the generic message
#[tokio::test]
async fn test_missing_template_uses_fallback_and_still_sends() -> Result<()> {
    let harness = Harness::new();
    let mut item = queued_item("update_published", "ann@example.com", 5);
    item.template_id = Some("does_not_exist".to_string());
    let id = item.id;
    harness.store.put_item(item).await;

    let report = harness.dispatcher.run(Some(10)).await?;

    assert_eq!(report.sent, 1);
    assert_eq!(harness.item(id).await.status, QueueStatus::Sent);

    let sent = harness.transport.sent().await;
    assert_eq!(sent[0].subject, "Update Published");
    assert!(sent[0].html.contains("https://portal.test"));

    Ok(())
}

/// Test: The last allowed attempt fails terminally and is not rescheduled
#[tokio::test]
async fn test_final_attempt_failure_marks_row_failed() -> Result<()> {
    let harness = Harness::with(MockTransport::failing("provider rejected"), fast_settings());
    let mut item = queued_item("update_published", "ann@example.com", 5);
    item.attempts = 2;
    item.max_attempts = 3;
    item.scheduled_for = Utc::now() - ChronoDuration::minutes(5);
    let (id, scheduled_for) = (item.id, item.scheduled_for);
    harness.store.put_item(item).await;

    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].queue_id, id);
    assert!(report.errors[0].error.contains("provider rejected"));

    let item = harness.item(id).await;
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempts, 3);
    assert_eq!(item.scheduled_for, scheduled_for);
    assert_eq!(item.last_error.as_deref(), Some("provider rejected"));

    // A failed row is never picked up again on its own.
    let report = harness.dispatcher.run(None).await?;
    assert_eq!(report.processed, 0);
    assert_eq!(harness.transport.calls(), 1);

    Ok(())
}

/// Test: A transient failure returns the row to the queue with backoff
#[tokio::test]
async fn test_transient_failure_reschedules_with_backoff() -> Result<()> {
    let harness = Harness::with(MockTransport::failing_first(1, "503 busy"), fast_settings());
    let item = queued_item("update_published", "ann@example.com", 5);
    let id = item.id;
    harness.store.put_item(item).await;

    let before = Utc::now();
    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.failed, 1);
    let item = harness.item(id).await;
    assert_eq!(item.status, QueueStatus::Queued);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_error.as_deref(), Some("503 busy"));
    assert!(item.scheduled_for >= before + ChronoDuration::seconds(60));

    // Not due yet, so the next run leaves it alone.
    let report = harness.dispatcher.run(None).await?;
    assert_eq!(report.processed, 0);

    let logs = harness.store.logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Failed);
    assert_eq!(logs[0].error_message.as_deref(), Some("503 busy"));
    assert!(logs[0].metadata["retry_at"].is_string());

    Ok(())
}

/// Test: Attempts never exceed the row's budget across repeated failures
#[tokio::test]
async fn test_attempts_never_exceed_max_attempts() -> Result<()> {
    let immediate = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 0,
        max_delay_ms: 0,
        backoff_multiplier: 2,
    };
    let harness = Harness::with(
        MockTransport::failing("down"),
        fast_settings().with_retry(immediate),
    );
    let item = queued_item("update_published", "ann@example.com", 5);
    let id = item.id;
    harness.store.put_item(item).await;

    for _ in 0..5 {
        harness.dispatcher.run(None).await?;
        let item = harness.item(id).await;
        assert!(item.attempts <= item.max_attempts);
    }

    let item = harness.item(id).await;
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempts, 3);
    assert_eq!(harness.transport.calls(), 3);

    Ok(())
}

/// Test: Lower priority numbers are sent first, earliest created wins ties
#[tokio::test]
async fn test_rows_are_claimed_in_priority_order() -> Result<()> {
    let harness = Harness::new();
    let base = Utc::now() - ChronoDuration::minutes(10);

    for (offset, (priority, to)) in [
        (1, "first-p1@example.com"),
        (5, "p5@example.com"),
        (1, "second-p1@example.com"),
        (10, "p10@example.com"),
    ]
    .into_iter()
    .enumerate()
    {
        let item = created_at(
            queued_item("update_published", to, priority),
            base + ChronoDuration::seconds(offset as i64),
        );
        harness.store.put_item(item).await;
    }

    let report = harness.dispatcher.run(Some(4)).await?;
    assert_eq!(report.sent, 4);

    let order: Vec<String> = harness
        .transport
        .sent()
        .await
        .into_iter()
        .map(|email| email.to)
        .collect();
    assert_eq!(
        order,
        vec![
            "first-p1@example.com",
            "second-p1@example.com",
            "p5@example.com",
            "p10@example.com"
        ]
    );

    Ok(())
}

/// Test: Batch size bounds how many rows one invocation claims
#[tokio::test]
async fn test_batch_size_limits_claims() -> Result<()> {
    let harness = Harness::new();
    for n in 0..5 {
        harness
            .store
            .put_item(queued_item("update_published", &format!("u{}@example.com", n), 5))
            .await;
    }

    let report = harness.dispatcher.run(Some(2)).await?;
    assert_eq!(report.processed, 2);

    let stats = harness.stats.queue_stats().await?;
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.queued, 3);

    Ok(())
}

/// Test: Sends are spaced by at least the configured interval
#[tokio::test]
async fn test_sends_respect_minimum_interval() -> Result<()> {
    let interval = Duration::from_millis(60);
    let harness = Harness::with(
        MockTransport::new(),
        fast_settings().with_send_interval(interval),
    );
    for n in 0..4 {
        harness
            .store
            .put_item(queued_item("update_published", &format!("u{}@example.com", n), 5))
            .await;
    }

    let started = Instant::now();
    let report = harness.dispatcher.run(None).await?;
    let elapsed = started.elapsed();

    assert_eq!(report.sent, 4);
    assert!(
        elapsed >= interval * 3,
        "4 sends took {:?}, expected at least {:?}",
        elapsed,
        interval * 3
    );

    Ok(())
}

/// Test: Only one of two concurrent claims on the same row succeeds
#[tokio::test]
async fn test_claim_is_exclusive() -> Result<()> {
    let harness = Harness::new();
    let item = queued_item("update_published", "ann@example.com", 5);
    let id = item.id;
    harness.store.put_item(item).await;

    let now = Utc::now();
    let (first, second) = tokio::join!(
        harness.store.try_claim(id, now),
        harness.store.try_claim(id, now)
    );

    assert_eq!([first?, second?].iter().filter(|claimed| **claimed).count(), 1);
    assert_eq!(harness.item(id).await.status, QueueStatus::Processing);

    Ok(())
}

/// Test: Racing dispatcher invocations never send a row twice
#[tokio::test]
async fn test_concurrent_dispatchers_do_not_double_send() -> Result<()> {
    let harness = Harness::with(
        MockTransport::new().with_delay(Duration::from_millis(5)),
        fast_settings(),
    );
    for n in 0..6 {
        harness
            .store
            .put_item(queued_item("update_published", &format!("u{}@example.com", n), 5))
            .await;
    }

    let (a, b) = tokio::join!(harness.dispatcher.run(None), harness.dispatcher.run(None));
    let (a, b) = (a?, b?);

    assert_eq!(a.processed + b.processed, 6);
    assert_eq!(a.sent + b.sent, 6);

    let mut recipients: Vec<String> = harness
        .transport
        .sent()
        .await
        .into_iter()
        .map(|email| email.to)
        .collect();
    recipients.sort();
    recipients.dedup();
    assert_eq!(recipients.len(), 6);
    assert_eq!(harness.transport.sent_count().await, 6);

    Ok(())
}

/// Test: Concurrent runs on one dispatcher share the send interval
#[tokio::test]
async fn test_concurrent_runs_share_send_pacing() -> Result<()> {
    let interval = Duration::from_millis(100);
    let harness = Harness::with(
        MockTransport::new(),
        fast_settings().with_send_interval(interval),
    );
    for n in 0..4 {
        harness
            .store
            .put_item(queued_item("update_published", &format!("u{}@example.com", n), 5))
            .await;
    }

    let (a, b) = tokio::join!(harness.dispatcher.run(None), harness.dispatcher.run(None));
    assert_eq!(a?.sent + b?.sent, 4);

    let times = harness.transport.call_times().await;
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= interval - Duration::from_millis(5),
            "sends were {:?} apart, expected about {:?}",
            gap,
            interval
        );
    }

    Ok(())
}

/// Test: A row cancelled between claim and send is not sent
#[tokio::test]
async fn test_row_cancelled_after_claim_is_not_sent() -> Result<()> {
    let harness = Harness::with(
        MockTransport::new(),
        fast_settings().with_send_interval(Duration::from_millis(300)),
    );
    let base = Utc::now() - ChronoDuration::minutes(1);
    let first = created_at(queued_item("update_published", "a@example.com", 5), base);
    let second = created_at(
        queued_item("update_published", "b@example.com", 5),
        base + ChronoDuration::seconds(1),
    );
    let second_id = second.id;
    harness.store.put_item(first).await;
    harness.store.put_item(second).await;

    let dispatcher = harness.dispatcher.clone();
    let run = tokio::spawn(async move { dispatcher.run(None).await });

    // The second row is claimed and waiting out the send interval.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.store.cancel(&[second_id], Utc::now()).await?, 1);

    let report = run.await??;

    assert_eq!(report.sent, 1);
    assert_eq!(report.skipped, 1);
    assert!(!harness.transport.was_sent_to("b@example.com").await);
    assert_eq!(harness.item(second_id).await.status, QueueStatus::Cancelled);

    Ok(())
}

/// Test: A malformed template fails its row without stopping the batch
#[tokio::test]
async fn test_render_failure_is_isolated_to_its_row() -> Result<()> {
    let harness = Harness::new();
    harness
        .store
        .add_template(EmailTemplate::new("broken", "Hello {{user_name", "<p>x</p>"))
        .await;

    let base = Utc::now() - ChronoDuration::minutes(1);
    let mut broken = created_at(queued_item("update_published", "a@example.com", 5), base);
    broken.template_id = Some("broken".to_string());
    let broken_id = broken.id;
    let fine = created_at(
        queued_item("update_published", "b@example.com", 5),
        base + ChronoDuration::seconds(1),
    );
    harness.store.put_item(broken).await;
    harness.store.put_item(fine).await;

    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.processed, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors[0].queue_id, broken_id);
    assert!(report.errors[0].error.contains("broken"));
    assert!(harness.transport.was_sent_to("b@example.com").await);

    let broken = harness.item(broken_id).await;
    assert_eq!(broken.attempts, 1);
    assert_eq!(broken.status, QueueStatus::Queued);

    Ok(())
}

/// Test: Losing the store aborts the whole invocation
#[tokio::test]
async fn test_store_outage_aborts_dispatch() -> Result<()> {
    let harness = Harness::new();
    harness
        .store
        .put_item(queued_item("update_published", "a@example.com", 5))
        .await;
    harness.store.set_unavailable(true);

    let result = harness.dispatcher.run(None).await;

    assert!(result.is_err());
    assert_eq!(harness.transport.calls(), 0);

    Ok(())
}

/// Test: An exhausted time budget leaves unclaimed rows queued
#[tokio::test]
async fn test_time_budget_leaves_rows_queued() -> Result<()> {
    let harness = Harness::with(
        MockTransport::new(),
        fast_settings().with_time_budget(Duration::ZERO),
    );
    harness
        .store
        .put_item(queued_item("update_published", "a@example.com", 5))
        .await;

    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.processed, 0);
    assert_eq!(harness.store.items().await[0].status, QueueStatus::Queued);

    Ok(())
}

/// Test: Rows stuck in processing are released before claiming
#[tokio::test]
async fn test_stale_claims_are_released() -> Result<()> {
    let harness = Harness::with(
        MockTransport::new(),
        fast_settings().with_stale_claim_after(ChronoDuration::minutes(15)),
    );
    let mut stuck = created_at(
        queued_item("update_published", "a@example.com", 5),
        Utc::now() - ChronoDuration::hours(1),
    );
    stuck.status = QueueStatus::Processing;
    let id = stuck.id;
    harness.store.put_item(stuck).await;

    let report = harness.dispatcher.run(None).await?;

    assert_eq!(report.released, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(harness.item(id).await.status, QueueStatus::Sent);

    Ok(())
}

/// Test: Explicit retry gives failed rows a fresh budget
#[tokio::test]
async fn test_retry_failed_requeues_with_fresh_budget() -> Result<()> {
    let harness = Harness::new();
    let mut failed = queued_item("update_published", "a@example.com", 5);
    failed.status = QueueStatus::Failed;
    failed.attempts = 3;
    failed.last_error = Some("bounced".to_string());
    let id = failed.id;
    let sent = {
        let mut item = queued_item("update_published", "b@example.com", 5);
        item.status = QueueStatus::Sent;
        item
    };
    let sent_id = sent.id;
    harness.store.put_item(failed).await;
    harness.store.put_item(sent).await;

    let affected = harness.dispatcher.retry_failed(&[id, sent_id]).await?;
    assert_eq!(affected, 1);

    let item = harness.item(id).await;
    assert_eq!(item.status, QueueStatus::Queued);
    assert_eq!(item.attempts, 0);
    assert_eq!(item.last_error.as_deref(), Some("bounced"));

    let report = harness.dispatcher.run(None).await?;
    assert_eq!(report.sent, 1);
    assert_eq!(harness.item(sent_id).await.status, QueueStatus::Sent);

    Ok(())
}

/// Test: Cancellation only touches rows that have not been sent
#[tokio::test]
async fn test_cancel_skips_finished_rows() -> Result<()> {
    let harness = Harness::new();
    let queued = queued_item("update_published", "a@example.com", 5);
    let mut sent = queued_item("update_published", "b@example.com", 5);
    sent.status = QueueStatus::Sent;
    let (queued_id, sent_id) = (queued.id, sent.id);
    harness.store.put_item(queued).await;
    harness.store.put_item(sent).await;

    let affected = harness.dispatcher.cancel(&[queued_id, sent_id]).await?;

    assert_eq!(affected, 1);
    assert_eq!(harness.item(queued_id).await.status, QueueStatus::Cancelled);
    assert_eq!(harness.item(sent_id).await.status, QueueStatus::Sent);

    let report = harness.dispatcher.run(None).await?;
    assert_eq!(report.processed, 0);

    Ok(())
}

/// Test: Retention cleanup deletes only old finished rows
#[tokio::test]
async fn test_purge_removes_old_finished_rows() -> Result<()> {
    let harness = Harness::new();
    let old = Utc::now() - ChronoDuration::days(40);

    let mut old_sent = created_at(queued_item("update_published", "a@example.com", 5), old);
    old_sent.status = QueueStatus::Sent;
    let mut old_retryable = created_at(queued_item("update_published", "b@example.com", 5), old);
    old_retryable.status = QueueStatus::Failed;
    old_retryable.attempts = 1;
    let old_queued = created_at(queued_item("update_published", "c@example.com", 5), old);
    let mut recent_sent = queued_item("update_published", "d@example.com", 5);
    recent_sent.status = QueueStatus::Sent;

    for item in [old_sent, old_retryable, old_queued, recent_sent] {
        harness.store.put_item(item).await;
    }

    assert_eq!(harness.dispatcher.purge(0).await?, 0);
    assert_eq!(harness.dispatcher.purge(30).await?, 1);
    assert_eq!(harness.store.items().await.len(), 3);

    Ok(())
}
