//! Simulated email transport. Stands in for an SMTP relay or email API;
//! accepts anything with a plausible address and fabricates the provider
//! acknowledgement a real relay would return.

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::Notification;
use crate::providers::{DeliveryState, NotificationProvider, ProviderError, ProviderResponse};

pub struct EmailProvider;

impl EmailProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EmailProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<ProviderResponse, ProviderError> {
        if !notification.recipient.contains('@') {
            return Err(ProviderError::Permanent(format!(
                "invalid recipient address: {}",
                notification.recipient
            )));
        }

        let external_id = format!("email-{}", Uuid::new_v4().simple());
        tracing::info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            external_id = %external_id,
            "email handed to relay"
        );

        let ack = serde_json::json!({
            "provider": "email",
            "accepted": [notification.recipient],
            "message_id": external_id,
        });

        Ok(ProviderResponse::accepted(
            external_id,
            Some(ack.to_string()),
        ))
    }

    async fn get_status(&self, external_id: &str) -> Result<DeliveryState, ProviderError> {
        // The simulated relay has no delivery feedback channel.
        tracing::debug!(external_id, "email status lookup");
        Ok(DeliveryState::Accepted)
    }

    async fn health(&self) -> bool {
        true
    }
}
