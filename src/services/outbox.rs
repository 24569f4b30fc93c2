//! Outbox dispatcher: at-least-once delivery of domain events to tenant
//! webhooks.
//!
//! Rows are polled FIFO by insertion and partitioned into per-aggregate
//! lanes; rows within a lane are delivered sequentially so every
//! aggregate's events arrive in order. Payloads are signed with
//! HMAC-SHA256 over the exact bytes on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::broadcast;

use crate::config::OutboxConfig;
use crate::db::models::{NotificationEvent, OutboxMessage, WebhookSubscription};
use crate::db::now_utc;
use crate::db::repository::{OutboxRepository, WebhookRepository};
use crate::error::{AppError, AppResult};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Egress body POSTed to webhooks. A subset of the stored event: the
/// subscription id stays internal.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    notification_id: &'a str,
    status: crate::db::models::NotificationStatus,
    #[serde(rename = "type")]
    channel: crate::db::models::NotificationChannel,
    recipient: &'a str,
    timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
}

impl<'a> WebhookPayload<'a> {
    fn from_event(event: &'a NotificationEvent) -> Self {
        Self {
            notification_id: &event.notification_id,
            status: event.status,
            channel: event.channel,
            recipient: &event.recipient,
            timestamp: &event.timestamp,
            error_message: event.error_message.as_deref(),
            external_id: event.external_id.as_deref(),
        }
    }
}

/// Hex HMAC-SHA256 over the raw request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct OutboxDispatcher {
    store: Store,
    config: OutboxConfig,
    client: reqwest::Client,
}

impl OutboxDispatcher {
    pub fn new(store: Store, config: OutboxConfig) -> Self {
        Self {
            store,
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("outbox dispatcher started");
        loop {
            let processed = match self.process_batch().await {
                Ok(count) => count,
                Err(error) => {
                    tracing::warn!("outbox batch failed: {}", error);
                    0
                }
            };

            if processed > 0 {
                // Drain the backlog without waiting out the poll interval,
                // but still notice shutdown between batches.
                if shutdown.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        // Final flush so events produced by draining workers leave the box.
        if let Err(error) = self.process_batch().await {
            tracing::warn!("outbox flush on shutdown failed: {}", error);
        }
        tracing::info!("outbox dispatcher stopped");
    }

    /// One poll: claim a FIFO batch, fan out per-aggregate lanes.
    /// Returns how many rows reached a settled state this round.
    pub async fn process_batch(&self) -> AppResult<usize> {
        let rows = OutboxRepository::fetch_unprocessed(self.store.pool(), self.config.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        // Partition preserving the FIFO order within each aggregate.
        let mut lanes: HashMap<String, Vec<OutboxMessage>> = HashMap::new();
        for row in rows {
            lanes.entry(row.aggregate_id.clone()).or_default().push(row);
        }

        let settled = futures::future::join_all(
            lanes
                .into_values()
                .map(|lane| self.process_lane(lane)),
        )
        .await
        .into_iter()
        .sum();

        Ok(settled)
    }

    /// Sequential delivery within one aggregate. A row that stays
    /// unsettled stops the lane so later events cannot overtake it.
    async fn process_lane(&self, rows: Vec<OutboxMessage>) -> usize {
        let mut settled = 0;
        for row in rows {
            match self.process_row(&row).await {
                Ok(true) => settled += 1,
                Ok(false) => break,
                Err(error) => {
                    tracing::warn!(outbox_id = %row.id, "outbox row processing failed: {}", error);
                    break;
                }
            }
        }
        settled
    }

    /// Returns Ok(true) when the row settled (processed or dead-lettered),
    /// Ok(false) when it stays pending for a later poll.
    async fn process_row(&self, row: &OutboxMessage) -> AppResult<bool> {
        let now = now_utc();

        let event: NotificationEvent = match serde_json::from_str(&row.payload) {
            Ok(event) => event,
            Err(error) => {
                // A payload we cannot parse will never deliver; dead-letter
                // immediately rather than burn attempts.
                tracing::error!(outbox_id = %row.id, "undecodable outbox payload: {}", error);
                OutboxRepository::record_failure(
                    self.store.pool(),
                    &row.id,
                    &format!("undecodable payload: {error}"),
                    1,
                    now,
                )
                .await?;
                return Ok(true);
            }
        };

        // Internal event types have no webhook audience.
        let Some(event_type) = row.message_type.webhook_event() else {
            OutboxRepository::mark_processed(self.store.pool(), &row.id, now).await?;
            return Ok(true);
        };

        let webhooks: Vec<WebhookSubscription> = WebhookRepository::find_active_for_subscription(
            self.store.pool(),
            &event.subscription_id,
        )
        .await?
        .into_iter()
        .filter(|webhook| webhook.subscribes_to(event_type))
        .collect();

        if webhooks.is_empty() {
            OutboxRepository::mark_processed(self.store.pool(), &row.id, now).await?;
            return Ok(true);
        }

        let body = serde_json::to_vec(&WebhookPayload::from_event(&event))
            .map_err(|e| AppError::Internal(e.into()))?;

        let mut all_delivered = true;
        for webhook in &webhooks {
            match self.deliver(webhook, &body).await {
                Ok(()) => {
                    WebhookRepository::record_success(self.store.pool(), &webhook.id, now).await?;
                }
                Err(message) => {
                    all_delivered = false;
                    let deactivated = WebhookRepository::record_failure(
                        self.store.pool(),
                        &webhook.id,
                        self.config.webhook_max_failures,
                        now,
                    )
                    .await?;
                    if deactivated {
                        tracing::warn!(
                            webhook_id = %webhook.id,
                            url = %webhook.url,
                            "webhook deactivated after {} consecutive failures",
                            self.config.webhook_max_failures,
                        );
                    }
                    tracing::warn!(
                        outbox_id = %row.id,
                        webhook_id = %webhook.id,
                        "webhook delivery failed: {}",
                        message,
                    );
                }
            }
        }

        if all_delivered {
            OutboxRepository::mark_processed(self.store.pool(), &row.id, now).await?;
            Ok(true)
        } else {
            let updated = OutboxRepository::record_failure(
                self.store.pool(),
                &row.id,
                "one or more webhook deliveries failed",
                self.config.max_attempts,
                now,
            )
            .await?;
            if updated.processed_at.is_some() {
                tracing::error!(
                    outbox_id = %row.id,
                    attempts = updated.attempts,
                    "outbox row dead-lettered"
                );
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    /// Signed POST with bounded in-call retries.
    async fn deliver(&self, webhook: &WebhookSubscription, body: &[u8]) -> Result<(), String> {
        let signature = sign_payload(&webhook.secret, body);

        let mut attempt: u32 = 0;
        loop {
            let result = self
                .client
                .post(&webhook.url)
                .timeout(self.config.webhook_timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-Signature", format!("sha256={signature}"))
                .body(body.to_vec())
                .send()
                .await;

            let failure = match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => format!("webhook responded {}", response.status()),
                Err(error) => format!("webhook request failed: {error}"),
            };

            if attempt + 1 >= self.config.webhook_retry_attempts {
                return Err(failure);
            }
            let backoff = self.config.webhook_retry_base * 2u32.pow(attempt);
            attempt += 1;
            tracing::debug!(
                webhook_id = %webhook.id,
                attempt,
                "retrying webhook in {:?}: {}",
                backoff,
                failure,
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // Independently computable: HMAC-SHA256("secret", "{}").
        let signature = sign_payload("secret", b"{}");
        assert_eq!(signature.len(), 64);
        assert_eq!(
            signature,
            "77325902caca812dc259733aacd046b73817372c777b8d95b402647474516e13"
        );
    }

    #[test]
    fn signature_depends_on_secret_and_body() {
        let base = sign_payload("secret", b"{\"a\":1}");
        assert_ne!(base, sign_payload("other", b"{\"a\":1}"));
        assert_ne!(base, sign_payload("secret", b"{\"a\":2}"));
    }

    #[test]
    fn payload_serializes_to_wire_shape() {
        let event = NotificationEvent {
            notification_id: "n-1".to_string(),
            subscription_id: "s-1".to_string(),
            status: crate::db::models::NotificationStatus::Sent,
            channel: crate::db::models::NotificationChannel::Email,
            recipient: "a@b.test".to_string(),
            timestamp: "2024-06-01T00:00:00.000Z".to_string(),
            error_message: None,
            external_id: Some("X1".to_string()),
        };

        let body = serde_json::to_value(WebhookPayload::from_event(&event)).unwrap();
        assert_eq!(body["notificationId"], "n-1");
        assert_eq!(body["status"], "sent");
        assert_eq!(body["type"], "email");
        assert_eq!(body["externalId"], "X1");
        // Internal routing data must not leak.
        assert!(body.get("subscriptionId").is_none());
        assert!(body.get("errorMessage").is_none());
    }
}
