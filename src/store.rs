//! Transactional state changes over the notification aggregate.
//!
//! Every lifecycle transition couples the status update with its audit log
//! row and, where the spec requires one, an outbox row, inside a single
//! transaction. Readers therefore always see a consistent
//! (status, sent_at, external_id, retry_count) tuple, and an outbox row
//! exists exactly when the state change it describes committed.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::db::models::{
    NewNotificationLog, Notification, NotificationEvent, NotificationLog, NotificationStatus,
    OutboxMessageType,
};
use crate::db::repository::{
    NotificationLogRepository, NotificationRepository, OutboxRepository, SubscriptionRepository,
};
use crate::db::now_utc;
use crate::error::{AppError, AppResult};
use crate::providers::SendOutcome;

/// Run a whole-transaction closure, retrying on transient database
/// conflicts (SQLite busy/locked): up to 3 attempts with exponential
/// backoff and jitter.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(error) if error.is_transient() && attempt < 2 => {
                let backoff = Duration::from_millis(50 * 2u64.pow(attempt));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..25));
                attempt += 1;
                tracing::debug!(attempt, "transient database conflict, retrying: {}", error);
                tokio::time::sleep(backoff + jitter).await;
            }
            other => return other,
        }
    }
}

/// Outcome of the stuck-processing sweep for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Requeued,
    Failed,
    Lost,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn event(
        notification: &Notification,
        status: NotificationStatus,
        error_message: Option<String>,
    ) -> NotificationEvent {
        let timestamp = DateTime::<Utc>::from_naive_utc_and_offset(notification.updated_at, Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        NotificationEvent {
            notification_id: notification.id.clone(),
            subscription_id: notification.subscription_id.clone(),
            status,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            timestamp,
            error_message,
            external_id: notification.external_id.clone(),
        }
    }

    fn encode_event(event: &NotificationEvent) -> AppResult<String> {
        serde_json::to_string(event).map_err(|e| AppError::Internal(e.into()))
    }

    /// The lifecycle state machine
    /// (`NotificationStatus::can_transition_to`) is the source of truth
    /// for every transition: re-read the row under the transaction and
    /// consult it first. The guarded UPDATE that follows closes the race
    /// with concurrent writers.
    async fn allows_transition(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        to: NotificationStatus,
    ) -> AppResult<bool> {
        Ok(NotificationRepository::find_by_id(executor, id)
            .await?
            .is_some_and(|current| current.status.can_transition_to(to)))
    }

    pub async fn find(&self, id: &str) -> AppResult<Option<Notification>> {
        NotificationRepository::find_by_id(&self.pool, id).await
    }

    pub async fn logs(&self, id: &str) -> AppResult<Vec<NotificationLog>> {
        NotificationLogRepository::list_for_notification(&self.pool, id).await
    }

    /// Pending → Processing under the worker. `None` means the row is gone
    /// or no longer sendable and the queue entry should be dropped.
    pub async fn begin_processing(&self, id: &str) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            let sendable = NotificationRepository::find_by_id(&mut *tx, id)
                .await?
                .is_some_and(|current| current.status.is_sendable());
            if !sendable {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::mark_processing(&mut *tx, id, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(
                    id,
                    NotificationStatus::Processing,
                    "picked up by worker",
                ),
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Processing → Sent plus the `NotificationSent` outbox row.
    pub async fn mark_sent(
        &self,
        id: &str,
        outcome: &SendOutcome,
    ) -> AppResult<Option<Notification>> {
        let external_id = outcome
            .external_id
            .clone()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("successful send without external id")))?;
        let external_id = &external_id;

        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Sent).await? {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::mark_sent(&mut *tx, id, &external_id, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(id, NotificationStatus::Sent, "provider accepted")
                    .with_provider_response(outcome.provider_response.clone()),
                now,
            )
            .await?;

            let event = Self::event(&notification, NotificationStatus::Sent, None);
            OutboxRepository::insert(
                &mut *tx,
                OutboxMessageType::NotificationSent,
                id,
                &Self::encode_event(&event)?,
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Processing → Retrying with the attempt counted. `None` when the
    /// retry budget is already spent (caller should fail the row instead).
    pub async fn mark_retrying(&self, id: &str, error: &str) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Retrying).await? {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::mark_retrying(&mut *tx, id, error, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(
                    id,
                    NotificationStatus::Retrying,
                    format!(
                        "attempt {} of {} failed, retry scheduled",
                        notification.retry_count, notification.max_retries
                    ),
                )
                .with_details(Some(error.to_string())),
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Processing/Sent → Failed plus the `NotificationFailed` outbox row.
    pub async fn mark_failed(&self, id: &str, error: &str) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Failed).await? {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::mark_failed(&mut *tx, id, error, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(id, NotificationStatus::Failed, "delivery failed")
                    .with_details(Some(error.to_string())),
                now,
            )
            .await?;

            let event = Self::event(
                &notification,
                NotificationStatus::Failed,
                Some(error.to_string()),
            );
            OutboxRepository::insert(
                &mut *tx,
                OutboxMessageType::NotificationFailed,
                id,
                &Self::encode_event(&event)?,
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Retrying → Pending when the retry timer fires.
    pub async fn release_retry(&self, id: &str) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Pending).await? {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::release_retry(&mut *tx, id, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(
                    id,
                    NotificationStatus::Pending,
                    "retry released to queue",
                ),
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Sent → Delivered plus the `NotificationDelivered` outbox row.
    /// Idempotent: confirming a row that already moved on is a no-op.
    pub async fn confirm_delivered(&self, id: &str) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Delivered).await? {
                return Ok(None);
            }

            let Some(notification) =
                NotificationRepository::confirm_delivered(&mut *tx, id, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(
                    id,
                    NotificationStatus::Delivered,
                    "delivery confirmed",
                ),
                now,
            )
            .await?;

            let event = Self::event(&notification, NotificationStatus::Delivered, None);
            OutboxRepository::insert(
                &mut *tx,
                OutboxMessageType::NotificationDelivered,
                id,
                &Self::encode_event(&event)?,
                now,
            )
            .await?;

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Pending → Cancelled. Rejected (returns `None`) once the row is
    /// Processing or beyond. Optionally refunds the quota charge.
    pub async fn cancel(&self, id: &str, refund_quota: bool) -> AppResult<Option<Notification>> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if !Self::allows_transition(&mut *tx, id, NotificationStatus::Cancelled).await? {
                return Ok(None);
            }

            let Some(notification) = NotificationRepository::cancel(&mut *tx, id, now).await?
            else {
                return Ok(None);
            };

            NotificationLogRepository::insert(
                &mut *tx,
                NewNotificationLog::transition(
                    id,
                    NotificationStatus::Cancelled,
                    "cancelled by user",
                ),
                now,
            )
            .await?;

            if refund_quota {
                SubscriptionRepository::refund_usage(&mut *tx, &notification.subscription_id, now)
                    .await?;
            }

            tx.commit().await.map_err(AppError::Database)?;
            Ok(Some(notification))
        })
        .await
    }

    /// Reclaim one stuck Processing row: back to Pending with the lost
    /// attempt counted, or Failed once the retry budget is spent.
    ///
    /// The sweep is a recovery path outside the lifecycle machine
    /// (Processing back to Pending has no regular edge), so only the
    /// narrow SQL guards apply here.
    pub async fn reclaim_stuck(&self, id: &str) -> AppResult<ReclaimOutcome> {
        retry_transient(|| async move {
            let now = now_utc();
            let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

            if let Some(notification) =
                NotificationRepository::reclaim_stuck(&mut *tx, id, now).await?
            {
                NotificationLogRepository::insert(
                    &mut *tx,
                    NewNotificationLog::transition(
                        id,
                        NotificationStatus::Pending,
                        format!(
                            "stuck in processing, reclaimed (attempt {} of {})",
                            notification.retry_count, notification.max_retries
                        ),
                    ),
                    now,
                )
                .await?;
                tx.commit().await.map_err(AppError::Database)?;
                return Ok(ReclaimOutcome::Requeued);
            }

            let error = "processing timed out";
            if let Some(notification) =
                NotificationRepository::fail_stuck(&mut *tx, id, error, now).await?
            {
                NotificationLogRepository::insert(
                    &mut *tx,
                    NewNotificationLog::transition(
                        id,
                        NotificationStatus::Failed,
                        "stuck in processing, retries exhausted",
                    ),
                    now,
                )
                .await?;

                let event = Self::event(
                    &notification,
                    NotificationStatus::Failed,
                    Some(error.to_string()),
                );
                OutboxRepository::insert(
                    &mut *tx,
                    OutboxMessageType::NotificationFailed,
                    id,
                    &Self::encode_event(&event)?,
                    now,
                )
                .await?;

                tx.commit().await.map_err(AppError::Database)?;
                return Ok(ReclaimOutcome::Failed);
            }

            // Someone else moved the row first.
            Ok(ReclaimOutcome::Lost)
        })
        .await
    }
}
