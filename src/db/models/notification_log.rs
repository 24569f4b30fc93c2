use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::NotificationStatus;

/// Append-only audit trail entry, one row per state transition.
/// Rows are never mutated after insertion.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: String,
    pub notification_id: String,
    pub status: NotificationStatus,
    pub message: String,
    pub details: Option<String>,
    pub provider_response: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewNotificationLog {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub message: String,
    pub details: Option<String>,
    pub provider_response: Option<String>,
}

impl NewNotificationLog {
    pub fn transition(
        notification_id: &str,
        status: NotificationStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: notification_id.to_string(),
            status,
            message: message.into(),
            details: None,
            provider_response: None,
        }
    }

    pub fn with_provider_response(mut self, response: Option<String>) -> Self {
        self.provider_response = response;
        self
    }

    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }
}
