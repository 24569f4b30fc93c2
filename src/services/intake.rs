//! Intake path: validate, authorize, reserve quota, persist and enqueue.
//!
//! The quota window reset, the limit check, the counter increment, the
//! notification insert, the initial log row and the `NotificationAccepted`
//! outbox row all commit in one transaction. In load-shedding mode the
//! enqueue is attempted before that commit, so a full queue rolls the
//! whole intake back and no quota is charged.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::db::models::{
    NewNotification, NewNotificationLog, Notification, NotificationChannel, NotificationEvent,
    NotificationPriority, NotificationStatus, OutboxMessageType, Subscription, SubscriptionStatus,
};
use crate::db::repository::{
    NotificationLogRepository, NotificationRepository, OutboxRepository, SubscriptionRepository,
};
use crate::db::now_utc;
use crate::error::{AppError, AppResult};
use crate::queue::{PriorityQueue, QueueItem};
use crate::store::{retry_transient, Store};

const MAX_RECIPIENT_LEN: usize = 256;
const MAX_SUBJECT_LEN: usize = 500;
const MAX_BODY_LEN: usize = 10_000;
const MAX_SMS_BODY_LEN: usize = 160;
const MAX_METADATA_LEN: usize = 4_000;
const MAX_CORRELATION_ID_LEN: usize = 64;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 64;
const MAX_BATCH_SIZE: usize = 1_000;
const IDEMPOTENCY_WINDOW_HOURS: i64 = 24;

/// Ingress request body for a single notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    // Accepted for wire compatibility; template rendering happens upstream.
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub was_idempotent: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub notifications: Vec<SendRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryResult {
    pub index: usize,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub was_idempotent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

struct AcceptedIntake {
    notification: Notification,
    /// Set in blocking-enqueue mode: the item goes to the queue after the
    /// transaction committed, with backpressure instead of shedding.
    enqueue_after_commit: Option<QueueItem>,
}

#[derive(Clone)]
pub struct IntakeService {
    store: Store,
    queue: Arc<PriorityQueue>,
    config: Config,
}

impl IntakeService {
    pub fn new(store: Store, queue: Arc<PriorityQueue>, config: Config) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    fn validate(request: &SendRequest, now: NaiveDateTime) -> AppResult<()> {
        if request.recipient.is_empty() || request.recipient.len() > MAX_RECIPIENT_LEN {
            return Err(AppError::Validation(format!(
                "recipient must be 1..={MAX_RECIPIENT_LEN} characters"
            )));
        }
        if request.subject.len() > MAX_SUBJECT_LEN {
            return Err(AppError::Validation(format!(
                "subject must be at most {MAX_SUBJECT_LEN} characters"
            )));
        }
        let body_limit = match request.channel {
            NotificationChannel::Sms => MAX_SMS_BODY_LEN,
            NotificationChannel::Email => MAX_BODY_LEN,
        };
        if request.body.is_empty() || request.body.len() > body_limit {
            return Err(AppError::Validation(format!(
                "body must be 1..={body_limit} characters for {} notifications",
                request.channel
            )));
        }
        if let Some(metadata) = &request.metadata {
            if metadata.len() > MAX_METADATA_LEN {
                return Err(AppError::Validation(format!(
                    "metadata must be at most {MAX_METADATA_LEN} characters"
                )));
            }
        }
        if let Some(correlation_id) = &request.correlation_id {
            if correlation_id.len() > MAX_CORRELATION_ID_LEN {
                return Err(AppError::Validation(format!(
                    "correlationId must be at most {MAX_CORRELATION_ID_LEN} characters"
                )));
            }
        }
        if let Some(key) = &request.idempotency_key {
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(AppError::Validation(format!(
                    "idempotencyKey must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }
        if let Some(scheduled_at) = request.scheduled_at {
            if scheduled_at.naive_utc() <= now {
                return Err(AppError::Validation(
                    "scheduledAt must be in the future".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn authorize(
        subscription: &Subscription,
        channel: NotificationChannel,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        if !subscription.is_active(now) {
            let reason = if subscription.status != SubscriptionStatus::Active {
                subscription.status.as_str()
            } else {
                "expired"
            };
            return Err(AppError::SubscriptionInvalid(format!(
                "subscription is {reason}"
            )));
        }
        if !subscription.allows_channel(channel) {
            return Err(AppError::SubscriptionInvalid(format!(
                "{channel} notifications are not permitted for this subscription"
            )));
        }
        Ok(())
    }

    fn replay_response(notification: &Notification) -> SendResponse {
        SendResponse {
            notification_id: notification.id.clone(),
            status: notification.status,
            message: "notification already accepted".to_string(),
            created_at: DateTime::<Utc>::from_naive_utc_and_offset(notification.created_at, Utc),
            was_idempotent: true,
        }
    }

    /// Accept one notification for the authenticated subscription.
    pub async fn send(
        &self,
        subscription: &Subscription,
        request: &SendRequest,
    ) -> AppResult<SendResponse> {
        let now = now_utc();
        Self::validate(request, now)?;
        Self::authorize(subscription, request.channel, now)?;

        // Idempotent replay: no quota charge, no new row, no enqueue.
        if let Some(key) = &request.idempotency_key {
            let since = now - Duration::hours(IDEMPOTENCY_WINDOW_HOURS);
            if let Some(existing) = NotificationRepository::find_by_idempotency_key(
                self.store.pool(),
                &subscription.id,
                key,
                since,
            )
            .await?
            {
                tracing::debug!(
                    notification_id = %existing.id,
                    "idempotency hit, replaying original response"
                );
                return Ok(Self::replay_response(&existing));
            }
        }

        let accepted = match retry_transient(|| async move {
            self.try_accept(subscription, request).await
        })
        .await
        {
            Ok(accepted) => accepted,
            // Two intakes raced past the pre-check with the same key; the
            // unique index picked the winner, replay it.
            Err(error) if error.is_idempotency_conflict() => {
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let since = now - Duration::hours(IDEMPOTENCY_WINDOW_HOURS);
                let existing = NotificationRepository::find_by_idempotency_key(
                    self.store.pool(),
                    &subscription.id,
                    key,
                    since,
                )
                .await?
                .ok_or(error)?;
                return Ok(Self::replay_response(&existing));
            }
            Err(error) => return Err(error),
        };

        if let Some(item) = accepted.enqueue_after_commit {
            self.queue.enqueue(item).await?;
        }

        let notification = accepted.notification;
        tracing::info!(
            notification_id = %notification.id,
            subscription_id = %subscription.id,
            channel = %notification.channel,
            priority = ?notification.priority,
            "notification accepted"
        );

        Ok(SendResponse {
            notification_id: notification.id.clone(),
            status: notification.status,
            message: "notification accepted".to_string(),
            created_at: DateTime::<Utc>::from_naive_utc_and_offset(notification.created_at, Utc),
            was_idempotent: false,
        })
    }

    /// One transaction: quota window reset + check + charge, notification
    /// insert, initial log, accepted outbox row, and (in shed mode) the
    /// enqueue reservation.
    async fn try_accept(
        &self,
        subscription: &Subscription,
        request: &SendRequest,
    ) -> AppResult<AcceptedIntake> {
        let now = now_utc();
        let mut tx = self.store.pool().begin().await.map_err(AppError::Database)?;

        // Fresh counters under the transaction; the handler's copy may be
        // stale by the time we get here.
        let current = SubscriptionRepository::find_by_id(&mut *tx, &subscription.id)
            .await?
            .ok_or(AppError::Unauthorized)?;
        Self::authorize(&current, request.channel, now)?;

        let (daily_used, last_reset_daily) = if current.daily_window_rolled(now) {
            (0, now)
        } else {
            (current.daily_used, current.last_reset_daily)
        };
        let (monthly_used, last_reset_monthly) = if current.monthly_window_rolled(now) {
            (0, now)
        } else {
            (current.monthly_used, current.last_reset_monthly)
        };

        if daily_used >= current.daily_limit {
            return Err(AppError::QuotaExceeded {
                retry_after_seconds: Subscription::seconds_until_daily_reset(now),
            });
        }
        if monthly_used >= current.monthly_limit {
            return Err(AppError::QuotaExceeded {
                retry_after_seconds: Subscription::seconds_until_monthly_reset(now),
            });
        }

        let new = NewNotification {
            user_id: current.user_id.clone(),
            subscription_id: current.id.clone(),
            channel: request.channel,
            priority: request.priority.unwrap_or_default(),
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            body: request.body.clone(),
            metadata: request.metadata.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            max_retries: self.config.dispatch.retry_max,
            scheduled_at: request.scheduled_at.map(|at| at.naive_utc()),
        };
        let mut notification = NotificationRepository::insert(&mut *tx, &new, now).await?;

        SubscriptionRepository::apply_usage(
            &mut *tx,
            &current.id,
            daily_used + 1,
            monthly_used + 1,
            last_reset_daily,
            last_reset_monthly,
            now,
        )
        .await?;

        NotificationLogRepository::insert(
            &mut *tx,
            NewNotificationLog::transition(&notification.id, NotificationStatus::Pending, "accepted"),
            now,
        )
        .await?;

        let event = NotificationEvent {
            notification_id: notification.id.clone(),
            subscription_id: current.id.clone(),
            status: NotificationStatus::Pending,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            timestamp: DateTime::<Utc>::from_naive_utc_and_offset(now, Utc)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            error_message: None,
            external_id: None,
        };
        OutboxRepository::insert(
            &mut *tx,
            OutboxMessageType::NotificationAccepted,
            &notification.id,
            &serde_json::to_string(&event).map_err(|e| AppError::Internal(e.into()))?,
            now,
        )
        .await?;

        // Future-dated notifications are left to the scheduled releaser.
        let immediate = notification
            .scheduled_at
            .map_or(true, |at| at <= now + Duration::seconds(1));

        let mut enqueue_after_commit = None;
        if immediate {
            if let Some(queued) =
                NotificationRepository::mark_queued(&mut *tx, &notification.id, now).await?
            {
                notification = queued;
            }
            let item = QueueItem {
                id: notification.id.clone(),
                priority: notification.priority,
            };
            if self.config.dispatch.blocking_enqueue {
                // Backpressure mode: enqueue after commit, never inside the
                // write transaction (a blocked send would starve the
                // workers that drain the queue).
                enqueue_after_commit = Some(item);
            } else {
                // Shed mode: reserve the slot now so a full queue rolls
                // the intake back before anything is charged.
                self.queue.try_enqueue(item)?;
            }
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(AcceptedIntake {
            notification,
            enqueue_after_commit,
        })
    }

    /// Batch intake: every entry is processed independently under the same
    /// error taxonomy.
    pub async fn send_batch(
        &self,
        subscription: &Subscription,
        batch: &BatchRequest,
    ) -> AppResult<Vec<BatchEntryResult>> {
        if batch.notifications.len() > MAX_BATCH_SIZE {
            return Err(AppError::Validation(format!(
                "batch size must be at most {MAX_BATCH_SIZE}"
            )));
        }

        let mut results = Vec::with_capacity(batch.notifications.len());
        for (index, request) in batch.notifications.iter().enumerate() {
            match self.send(subscription, request).await {
                Ok(response) => results.push(BatchEntryResult {
                    index,
                    accepted: true,
                    notification_id: Some(response.notification_id),
                    was_idempotent: Some(response.was_idempotent),
                    error_code: None,
                    error_message: None,
                }),
                Err(error) => results.push(BatchEntryResult {
                    index,
                    accepted: false,
                    notification_id: None,
                    was_idempotent: None,
                    error_code: Some(error.code().to_string()),
                    error_message: Some(error.to_string()),
                }),
            }
        }
        Ok(results)
    }

    /// Pending → Cancelled for an owner-scoped cancel request.
    pub async fn cancel(
        &self,
        subscription: &Subscription,
        notification_id: &str,
    ) -> AppResult<Notification> {
        let existing =
            NotificationRepository::find_for_subscription(self.store.pool(), notification_id, &subscription.id)
                .await?
                .ok_or_else(|| AppError::NotFound("notification not found".to_string()))?;

        match self
            .store
            .cancel(&existing.id, self.config.dispatch.quota_refund_on_cancel)
            .await?
        {
            Some(cancelled) => Ok(cancelled),
            None => {
                let message = if existing.status.is_terminal() {
                    format!("notification is already {}", existing.status)
                } else {
                    format!(
                        "notification cannot be cancelled in status {}",
                        existing.status
                    )
                };
                Err(AppError::BadRequest(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(channel: NotificationChannel) -> SendRequest {
        SendRequest {
            channel,
            recipient: "a@b.test".to_string(),
            subject: "S".to_string(),
            body: "B".to_string(),
            priority: None,
            scheduled_at: None,
            metadata: None,
            correlation_id: None,
            idempotency_key: None,
            template_id: None,
            template_data: None,
        }
    }

    #[test]
    fn email_body_boundary() {
        let now = now_utc();
        let mut r = request(NotificationChannel::Email);

        r.body = "x".repeat(10_000);
        assert!(IntakeService::validate(&r, now).is_ok());

        r.body = "x".repeat(10_001);
        assert!(matches!(
            IntakeService::validate(&r, now),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn sms_body_boundary() {
        let now = now_utc();
        let mut r = request(NotificationChannel::Sms);
        r.recipient = "+15551234567".to_string();

        r.body = "x".repeat(160);
        assert!(IntakeService::validate(&r, now).is_ok());

        r.body = "x".repeat(161);
        assert!(matches!(
            IntakeService::validate(&r, now),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn recipient_boundary() {
        let now = now_utc();
        let mut r = request(NotificationChannel::Email);

        r.recipient = "x".repeat(257);
        assert!(IntakeService::validate(&r, now).is_err());

        r.recipient = String::new();
        assert!(IntakeService::validate(&r, now).is_err());
    }

    #[test]
    fn scheduled_at_must_be_future() {
        let now = now_utc();
        let mut r = request(NotificationChannel::Email);

        r.scheduled_at = Some(
            DateTime::<Utc>::from_naive_utc_and_offset(now - Duration::minutes(2), Utc),
        );
        assert!(matches!(
            IntakeService::validate(&r, now),
            Err(AppError::Validation(_))
        ));

        r.scheduled_at = Some(
            DateTime::<Utc>::from_naive_utc_and_offset(now + Duration::minutes(2), Utc),
        );
        assert!(IntakeService::validate(&r, now).is_ok());
    }

    #[test]
    fn subject_and_metadata_boundaries() {
        let now = now_utc();
        let mut r = request(NotificationChannel::Email);

        r.subject = "x".repeat(501);
        assert!(IntakeService::validate(&r, now).is_err());
        r.subject = "x".repeat(500);
        assert!(IntakeService::validate(&r, now).is_ok());

        r.metadata = Some("x".repeat(4_001));
        assert!(IntakeService::validate(&r, now).is_err());

        r.metadata = None;
        r.idempotency_key = Some("x".repeat(65));
        assert!(IntakeService::validate(&r, now).is_err());
    }
}
