use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NotificationChannel {
    Email,
    Sms,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a notification.
///
/// Terminal states (`Delivered`, `Failed`, `Cancelled`) never change again;
/// every store mutation guards on the expected current status so a stale
/// writer cannot resurrect a terminal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Delivered,
    Failed,
    Retrying,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered
                | NotificationStatus::Failed
                | NotificationStatus::Cancelled
        )
    }

    /// Whether a worker may pick this notification up for sending.
    pub fn is_sendable(&self) -> bool {
        matches!(self, NotificationStatus::Pending)
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Sent)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Retrying, Pending)
                | (Sent, Delivered)
                | (Sent, Failed)
        )
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class. The queue collapses `Critical` and `High` into one lane.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for NotificationPriority {
    fn default() -> Self {
        NotificationPriority::Normal
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub subscription_id: String,
    pub channel: NotificationChannel,
    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub metadata: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    /// Provider-assigned id, set when the provider accepts the message.
    pub external_id: Option<String>,
    pub scheduled_at: Option<NaiveDateTime>,
    /// Set once when the notification is handed to the in-memory queue.
    pub queued_at: Option<NaiveDateTime>,
    pub sent_at: Option<NaiveDateTime>,
    pub delivered_at: Option<NaiveDateTime>,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Data required to persist a freshly accepted notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub subscription_id: String,
    pub channel: NotificationChannel,
    pub priority: NotificationPriority,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub metadata: Option<String>,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub max_retries: i32,
    pub scheduled_at: Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        use NotificationStatus::*;
        let all = [
            Pending, Processing, Sent, Delivered, Failed, Retrying, Cancelled,
        ];
        for terminal in [Delivered, Failed, Cancelled] {
            for next in all {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} must not transition to {next:?}"
                );
            }
        }
    }

    #[test]
    fn lifecycle_transitions_match_state_machine() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Processing.can_transition_to(Failed));
        assert!(Retrying.can_transition_to(Pending));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Sent));
        assert!(!Retrying.can_transition_to(Processing));
        assert!(!Sent.can_transition_to(Retrying));
    }
}
