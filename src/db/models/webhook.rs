use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Tenant-registered endpoint receiving signed event POSTs.
///
/// `events` is a comma-separated set over {sent, delivered, failed}.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub subscription_id: String,
    pub url: String,
    pub secret: String,
    pub events: String,
    pub active: bool,
    pub consecutive_failures: i32,
    pub last_success_at: Option<NaiveDateTime>,
    pub last_failure_at: Option<NaiveDateTime>,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl WebhookSubscription {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.split(',').any(|e| e.trim() == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn event_set_membership() {
        let webhook = WebhookSubscription {
            id: "wh-1".to_string(),
            subscription_id: "sub-1".to_string(),
            url: "https://example.test/hook".to_string(),
            secret: "s3cret".to_string(),
            events: "sent, delivered".to_string(),
            active: true,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            is_deleted: false,
            created_at: Utc::now().naive_utc(),
            updated_at: Utc::now().naive_utc(),
        };

        assert!(webhook.subscribes_to("sent"));
        assert!(webhook.subscribes_to("delivered"));
        assert!(!webhook.subscribes_to("failed"));
    }
}
