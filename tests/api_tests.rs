use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use email_queue_service::{
    api::{AppState, router},
    clients::health::HealthChecker,
    models::{
        recipient::{RecipientList, RecipientListKind},
        status::QueueStatus,
        template::EmailTemplate,
    },
    services::stats::StatsAggregator,
};
use serde_json::{Value as JsonValue, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::common::{Harness, queued_item};

const ADMIN_TOKEN: &str = "admin-secret";

fn app(harness: &Harness) -> Router {
    let shared = Arc::new(harness.store.clone());
    router(Arc::new(AppState {
        enqueuer: harness.enqueuer.clone(),
        dispatcher: harness.dispatcher.clone(),
        stats: StatsAggregator::new(shared.clone()),
        rules: harness.rules.clone(),
        templates: shared.clone(),
        lists: shared.clone(),
        health_checker: HealthChecker::new(shared, Arc::new(harness.transport.clone())),
        admin_token: ADMIN_TOKEN.to_string(),
    }))
}

fn admin(method: &str, uri: &str, body: Option<JsonValue>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN));

    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("valid request")
}

async fn send(app: Router, request: Request<Body>) -> Result<(StatusCode, JsonValue)> {
    let response = app.oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

/// Test: Admin routes refuse requests without the operator token
#[tokio::test]
async fn test_admin_routes_require_token() -> Result<()> {
    let harness = Harness::new();

    let missing = Request::builder()
        .method("POST")
        .uri("/admin/dispatch")
        .body(Body::empty())?;
    let (status, body) = send(app(&harness), missing).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let wrong = Request::builder()
        .method("POST")
        .uri("/admin/dispatch")
        .header(header::AUTHORIZATION, "Bearer guess")
        .body(Body::empty())?;
    let (status, _) = send(app(&harness), wrong).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    Ok(())
}

/// Test: Enqueue then dispatch over HTTP delivers the message
#[tokio::test]
async fn test_enqueue_and_dispatch_over_http() -> Result<()> {
    let harness = Harness::new();
    harness
        .bind(
            "contact_form_submitted",
            EmailTemplate::new("contact_form_submitted", "From {{name}}", "<p>{{message}}</p>"),
            RecipientListKind::Static,
            json!({"emails": ["support@example.com"]}),
        )
        .await;

    let (status, body) = send(
        app(&harness),
        admin(
            "POST",
            "/admin/enqueue",
            Some(json!({
                "event_type": "contact_form_submitted",
                "event_id": "contact-1",
                "event_payload": {"name": "Jo", "message": "Hello"}
            })),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queued_count"], 1);

    let (status, body) = send(
        app(&harness),
        admin("POST", "/admin/dispatch", Some(json!({"batchSize": 5}))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sent"], 1);

    let sent = harness.transport.sent().await;
    assert_eq!(sent[0].subject, "From Jo");

    let (status, body) = send(
        app(&harness),
        admin("GET", "/admin/stats/contact_form_submitted/contact-1", None),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sent"], 1);
    assert_eq!(body["data"]["total"], 1);

    Ok(())
}

/// Test: Dispatch accepts an empty body and rejects a zero batch size
#[tokio::test]
async fn test_dispatch_body_handling() -> Result<()> {
    let harness = Harness::new();

    let (status, body) = send(app(&harness), admin("POST", "/admin/dispatch", None)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["processed"], 0);

    let (status, _) = send(
        app(&harness),
        admin("POST", "/admin/dispatch", Some(json!({"batchSize": 0}))),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

/// Test: Cancel and retry need at least one id
#[tokio::test]
async fn test_cancel_requires_ids() -> Result<()> {
    let harness = Harness::new();

    let (status, body) = send(
        app(&harness),
        admin("POST", "/admin/queue/cancel", Some(json!({"ids": []}))),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, _) = send(
        app(&harness),
        admin("POST", "/admin/queue/retry", Some(json!({"ids": []}))),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

/// Test: Recent batches and the email log are listed newest first
#[tokio::test]
async fn test_list_batches_and_email_log() -> Result<()> {
    let harness = Harness::new();
    harness
        .bind(
            "survey_published",
            EmailTemplate::new("survey_published", "{{title}}", "<p>{{title}}</p>"),
            RecipientListKind::Static,
            json!({"emails": ["a@example.com", "b@example.com"]}),
        )
        .await;

    for event_id in ["survey-1", "survey-2"] {
        harness
            .enqueuer
            .enqueue("survey_published", Some(event_id), json!({"title": "Poll"}))
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    harness.dispatcher.run(Some(3)).await?;

    let (status, body) = send(app(&harness), admin("GET", "/admin/batches", None)).await?;
    assert_eq!(status, StatusCode::OK);
    let batches = body["data"].as_array().expect("batch list");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0]["batch"]["event_id"], "survey-2");
    assert_eq!(batches[0]["stats"]["total"], 2);
    assert_eq!(batches[1]["derived_status"], "completed");

    let (status, body) = send(app(&harness), admin("GET", "/admin/logs?limit=2", None)).await?;
    assert_eq!(status, StatusCode::OK);
    let logs = body["data"].as_array().expect("log list");
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log["status"] == "sent"));
    assert_eq!(harness.store.logs().await.len(), 3);

    Ok(())
}

/// Test: Operators can inspect a failed row and requeue it
#[tokio::test]
async fn test_inspect_and_retry_failed_row() -> Result<()> {
    let harness = Harness::new();
    let mut failed = queued_item("update_published", "a@example.com", 5);
    failed.status = QueueStatus::Failed;
    failed.attempts = 3;
    failed.last_error = Some("mailbox unavailable".to_string());
    let id = failed.id;
    harness.store.put_item(failed).await;

    let uri = format!("/admin/queue/{}", id);
    let (status, body) = send(app(&harness), admin("GET", &uri, None)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["attempts"], 3);
    assert_eq!(body["data"]["last_error"], "mailbox unavailable");

    let (status, body) = send(
        app(&harness),
        admin("POST", "/admin/queue/retry", Some(json!({"ids": [id]}))),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["affected"], 1);
    assert_eq!(harness.item(id).await.status, QueueStatus::Queued);

    let uri = format!("/admin/queue/{}", Uuid::new_v4());
    let (status, _) = send(app(&harness), admin("GET", &uri, None)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

/// Test: The public template endpoint hides inactive templates
#[tokio::test]
async fn test_public_template_lookup() -> Result<()> {
    let harness = Harness::new();
    harness
        .store
        .add_template(EmailTemplate::new("welcome", "Welcome", "<p>Hi</p>"))
        .await;
    harness
        .store
        .add_template(EmailTemplate::new("retired", "Old", "<p>Old</p>").inactive())
        .await;

    let get = |uri: &str| Request::builder().uri(uri).body(Body::empty());

    let (status, body) = send(app(&harness), get("/templates/welcome")?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["subject"], "Welcome");

    let (status, _) = send(app(&harness), get("/templates/retired")?).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

/// Test: Template writes are validated
#[tokio::test]
async fn test_template_upsert_validates() -> Result<()> {
    let harness = Harness::new();

    let (status, _) = send(
        app(&harness),
        admin(
            "PUT",
            "/admin/templates/weekly_digest",
            Some(json!({"subject": "Digest for {{user_name}}", "body_html": "<p>Hi</p>"})),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        app(&harness),
        admin(
            "PUT",
            "/admin/templates/broken",
            Some(json!({"subject": "Hi {{user_name", "body_html": "<p>Hi</p>"})),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app(&harness),
        admin(
            "PUT",
            "/admin/templates/odd_braces",
            Some(json!({"subject": "Hi {{a}b}} and {{ {x} }}", "body_html": "<p>Hi</p>"})),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    Ok(())
}

/// Test: Rules must reference an existing list and template
#[tokio::test]
async fn test_rule_endpoint_validates_references() -> Result<()> {
    let harness = Harness::new();
    let list = RecipientList::new(
        "ops",
        RecipientListKind::Static,
        json!({"emails": ["ops@example.com"]}),
    );
    harness.store.add_list(list.clone()).await;

    let (status, _) = send(
        app(&harness),
        admin(
            "PUT",
            "/admin/rules",
            Some(json!({
                "event_type": "update_published",
                "template_id": "nope",
                "recipient_list_id": list.id,
            })),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    harness
        .store
        .add_template(EmailTemplate::new("update_published", "Update", "<p>x</p>"))
        .await;
    let (status, body) = send(
        app(&harness),
        admin(
            "PUT",
            "/admin/rules",
            Some(json!({
                "event_type": "update_published",
                "template_id": "update_published",
                "recipient_list_id": list.id,
            })),
        ),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], true);
    assert_eq!(harness.store.rules().await.len(), 1);

    Ok(())
}

/// Test: System lists cannot be deleted, others can
#[tokio::test]
async fn test_delete_recipient_list() -> Result<()> {
    let harness = Harness::new();
    let system = RecipientList::new("all_members", RecipientListKind::RoleBased, json!({}))
        .system();
    let custom = RecipientList::new("temp", RecipientListKind::Static, json!({}));
    harness.store.add_list(system.clone()).await;
    harness.store.add_list(custom.clone()).await;

    let uri = format!("/admin/recipient-lists/{}", system.id);
    let (status, _) = send(app(&harness), admin("DELETE", &uri, None)).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let uri = format!("/admin/recipient-lists/{}", custom.id);
    let (status, _) = send(app(&harness), admin("DELETE", &uri, None)).await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(app(&harness), admin("DELETE", &uri, None)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}

/// Test: Health reports degraded on the mock transport and unhealthy without a store
#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let harness = Harness::new();
    let get = || Request::builder().uri("/health").body(Body::empty());

    let (status, body) = send(app(&harness), get()?).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["database"]["status"], "healthy");
    assert_eq!(body["checks"]["email_transport"]["status"], "degraded");

    harness.store.set_unavailable(true);
    let (status, body) = send(app(&harness), get()?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");

    Ok(())
}
