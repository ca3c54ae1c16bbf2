use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::health::HealthChecker,
    error::{AppError, AppResult},
    models::{
        health::HealthStatus,
        message::{AffectedRows, DispatchRequest, EnqueueRequest, ListQuery, QueueIdsRequest},
        response::ApiResponse,
        rule::RuleRequest,
        template::TemplateRequest,
        validation::validate_template,
    },
    services::{
        dispatcher::Dispatcher, enqueuer::Enqueuer, rules::RuleEngine, stats::StatsAggregator,
    },
    store::{RecipientListStore, TemplateStore},
};

pub struct AppState {
    pub enqueuer: Arc<Enqueuer>,
    pub dispatcher: Arc<Dispatcher>,
    pub stats: StatsAggregator,
    pub rules: Arc<RuleEngine>,
    pub templates: Arc<dyn TemplateStore>,
    pub lists: Arc<dyn RecipientListStore>,
    pub health_checker: HealthChecker,
    pub admin_token: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/enqueue", post(enqueue))
        .route("/dispatch", post(dispatch))
        .route("/stats/{event_type}/{event_id}", get(event_stats))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/{id}", get(queue_item))
        .route("/queue/cancel", post(cancel_rows))
        .route("/queue/retry", post(retry_rows))
        .route("/batches", get(recent_batches))
        .route("/batches/{id}", get(batch_report))
        .route("/logs", get(recent_logs))
        .route("/templates/{key}", put(upsert_template))
        .route("/rules", put(save_rule))
        .route("/recipients/preview/{event_type}", get(preview_recipients))
        .route("/recipient-lists/{id}", delete(delete_recipient_list))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health_check))
        .route("/templates/{key}", get(get_template))
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "HTTP server started");

    axum::serve(listener, app).await?;

    Ok(())
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if !state.admin_token.is_empty() && token == state.admin_token => {
            Ok(next.run(request).await)
        }
        _ => Err(AppError::Unauthorized),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> AppResult<impl IntoResponse> {
    let template = state
        .templates
        .get_template(&key)
        .await?
        .filter(|template| template.is_active)
        .ok_or_else(|| AppError::NotFound(format!("Template '{}' not found", key)))?;

    Ok(Json(ApiResponse::success(template, "Template retrieved")))
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> AppResult<impl IntoResponse> {
    if request.event_type.trim().is_empty() {
        return Err(AppError::Validation("event_type is required".to_string()));
    }

    let result = state
        .enqueuer
        .enqueue(
            &request.event_type,
            request.event_id.as_deref(),
            request.event_payload,
        )
        .await?;

    Ok(Json(ApiResponse::success(result, "Enqueue complete")))
}

async fn dispatch(State(state): State<Arc<AppState>>, body: Bytes) -> AppResult<impl IntoResponse> {
    let request = if body.is_empty() {
        DispatchRequest::default()
    } else {
        serde_json::from_slice::<DispatchRequest>(&body)
            .map_err(|e| AppError::Validation(e.to_string()))?
    };

    if request.batch_size == Some(0) {
        return Err(AppError::Validation("batchSize must be at least 1".to_string()));
    }

    let report = state.dispatcher.run(request.batch_size).await?;

    Ok(Json(ApiResponse::success(report, "Dispatch complete")))
}

async fn event_stats(
    State(state): State<Arc<AppState>>,
    Path((event_type, event_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let stats = state.stats.stats_for(&event_id, &event_type).await?;
    Ok(Json(ApiResponse::success(stats, "Event stats retrieved")))
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    let stats = state.stats.queue_stats().await?;
    Ok(Json(ApiResponse::success(stats, "Queue stats retrieved")))
}

async fn queue_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let item = state
        .stats
        .queue_item(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queue row {} not found", id)))?;

    Ok(Json(ApiResponse::success(item, "Queue row retrieved")))
}

async fn batch_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let report = state
        .stats
        .batch_report(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Batch {} not found", id)))?;

    Ok(Json(ApiResponse::success(report, "Batch report retrieved")))
}

async fn recent_batches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    let batches = state.stats.recent_batches(query.clamped()).await?;
    Ok(Json(ApiResponse::success(batches, "Batches retrieved")))
}

async fn recent_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    let logs = state.stats.recent_logs(query.clamped()).await?;
    Ok(Json(ApiResponse::success(logs, "Email log retrieved")))
}

async fn cancel_rows(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueueIdsRequest>,
) -> AppResult<impl IntoResponse> {
    if request.ids.is_empty() {
        return Err(AppError::Validation("ids cannot be empty".to_string()));
    }
    let affected = state.dispatcher.cancel(&request.ids).await?;
    Ok(Json(ApiResponse::success(
        AffectedRows { affected },
        "Rows cancelled",
    )))
}

async fn retry_rows(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueueIdsRequest>,
) -> AppResult<impl IntoResponse> {
    if request.ids.is_empty() {
        return Err(AppError::Validation("ids cannot be empty".to_string()));
    }
    let affected = state.dispatcher.retry_failed(&request.ids).await?;
    Ok(Json(ApiResponse::success(
        AffectedRows { affected },
        "Rows requeued",
    )))
}

async fn upsert_template(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<TemplateRequest>,
) -> AppResult<impl IntoResponse> {
    let template = request.into_template(&key);
    validate_template(&template).map_err(|e| AppError::Validation(e.to_string()))?;

    state.templates.upsert_template(template.clone()).await?;
    info!(template_id = %key, "Template saved");

    Ok(Json(ApiResponse::success(template, "Template saved")))
}

async fn save_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RuleRequest>,
) -> AppResult<impl IntoResponse> {
    let rule = request.into_rule();

    if state.lists.get_list(rule.recipient_list_id).await?.is_none() {
        return Err(AppError::Validation(format!(
            "Recipient list {} does not exist",
            rule.recipient_list_id
        )));
    }

    let rule = state.rules.save_rule(rule).await?;
    Ok(Json(ApiResponse::success(rule, "Rule saved")))
}

async fn preview_recipients(
    State(state): State<Arc<AppState>>,
    Path(event_type): Path<String>,
) -> AppResult<impl IntoResponse> {
    let preview = state.enqueuer.preview(&event_type).await?;
    Ok(Json(ApiResponse::success(preview, "Recipients previewed")))
}

async fn delete_recipient_list(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let list = state
        .lists
        .get_list(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Recipient list {} not found", id)))?;

    if list.is_system {
        return Err(AppError::Conflict(format!(
            "Recipient list '{}' is system-owned and cannot be deleted",
            list.code
        )));
    }

    state.lists.delete_list(id).await?;
    info!(list_id = %id, code = %list.code, "Recipient list deleted");

    Ok(Json(ApiResponse::success(id, "Recipient list deleted")))
}
