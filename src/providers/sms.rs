//! Simulated SMS transport.

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::Notification;
use crate::providers::{DeliveryState, NotificationProvider, ProviderError, ProviderResponse};

pub struct SmsProvider;

impl SmsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SmsProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn looks_like_msisdn(recipient: &str) -> bool {
    let digits = recipient.strip_prefix('+').unwrap_or(recipient);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[async_trait]
impl NotificationProvider for SmsProvider {
    fn name(&self) -> &str {
        "sms"
    }

    async fn send(&self, notification: &Notification) -> Result<ProviderResponse, ProviderError> {
        if !looks_like_msisdn(&notification.recipient) {
            return Err(ProviderError::Permanent(format!(
                "invalid recipient address: {}",
                notification.recipient
            )));
        }

        let external_id = format!("sms-{}", Uuid::new_v4().simple());
        tracing::info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            external_id = %external_id,
            segments = (notification.body.len() + 159) / 160,
            "sms handed to gateway"
        );

        let ack = serde_json::json!({
            "provider": "sms",
            "to": notification.recipient,
            "message_id": external_id,
        });

        Ok(ProviderResponse::accepted(
            external_id,
            Some(ack.to_string()),
        ))
    }

    async fn get_status(&self, external_id: &str) -> Result<DeliveryState, ProviderError> {
        tracing::debug!(external_id, "sms status lookup");
        Ok(DeliveryState::Accepted)
    }

    async fn health(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msisdn_validation() {
        assert!(looks_like_msisdn("+15551234567"));
        assert!(looks_like_msisdn("15551234567"));
        assert!(!looks_like_msisdn("+1555-123"));
        assert!(!looks_like_msisdn(""));
        assert!(!looks_like_msisdn("+"));
    }
}
