use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::{NotificationChannel, NotificationStatus};

/// Domain event types written to the outbox alongside the state change
/// they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxMessageType {
    NotificationAccepted,
    NotificationSent,
    NotificationDelivered,
    NotificationFailed,
}

impl OutboxMessageType {
    /// The webhook event name this message maps to, if tenants can
    /// subscribe to it. `NotificationAccepted` is internal-only.
    pub fn webhook_event(&self) -> Option<&'static str> {
        match self {
            OutboxMessageType::NotificationAccepted => None,
            OutboxMessageType::NotificationSent => Some("sent"),
            OutboxMessageType::NotificationDelivered => Some("delivered"),
            OutboxMessageType::NotificationFailed => Some("failed"),
        }
    }
}

/// Transactional outbox row. `processed_at` transitions from NULL to a
/// timestamp exactly once; rows that exhaust their attempts are marked
/// processed with `last_error` set (dead-letter).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub message_type: OutboxMessageType,
    pub aggregate_id: String,
    pub payload: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Event payload serialized into `outbox_messages.payload`. Carries the
/// subscription id for webhook resolution; the egress body is a subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub notification_id: String,
    pub subscription_id: String,
    pub status: NotificationStatus,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub recipient: String,
    /// RFC-3339 UTC timestamp of the state change.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}
