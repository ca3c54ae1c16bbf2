use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::template::RenderedEmail;

/// A fully rendered message handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub queue_id: Uuid,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl OutboundEmail {
    pub fn new(queue_id: Uuid, from: &str, to: &str, rendered: RenderedEmail) -> Self {
        Self {
            queue_id,
            from: from.to_string(),
            to: to.to_string(),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text.filter(|text| !text.is_empty()),
            tags: vec![("queue_id".to_string(), queue_id.to_string())],
        }
    }

    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.push((name.to_string(), value.to_string()));
        self
    }
}

/// Request body accepted by the enqueue endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub event_type: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default = "empty_payload")]
    pub event_payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub queued_count: usize,
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchRequest {
    #[serde(default, rename = "batchSize", alias = "batch_size")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub queue_id: Uuid,
    pub error: String,
}

/// Summary of one dispatcher invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Rows claimed and carried to an outcome by this invocation.
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Rows lost to a concurrent claimant or cancelled before send.
    pub skipped: usize,
    /// Stale `processing` rows handed back to the queue before claiming.
    pub released: u64,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueIdsRequest {
    pub ids: Vec<Uuid>,
}

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// `?limit=` for the operator listing endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

impl ListQuery {
    pub fn clamped(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AffectedRows {
    pub affected: u64,
}
