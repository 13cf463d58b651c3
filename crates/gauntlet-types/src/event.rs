use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Progress event published on the in-process bus and mirrored to the
/// external reporting sink.
#[derive(Debug, Clone, Serialize)]
pub struct EvalEvent {
    pub id: String,
    pub event: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EvalEvent {
    pub fn new(event: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event: event.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}
