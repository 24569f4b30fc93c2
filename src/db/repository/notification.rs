use chrono::NaiveDateTime;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::db::models::{NewNotification, Notification, NotificationStatus};
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, user_id, subscription_id, channel, status, priority,
    recipient, subject, body, metadata, correlation_id, idempotency_key,
    retry_count, max_retries, last_error, external_id,
    scheduled_at, queued_at, sent_at, delivered_at,
    is_deleted, created_at, updated_at
"#;

/// Repository for the notification root entity.
///
/// Every status mutation is a guarded single-statement
/// `UPDATE ... WHERE id = ? AND status = ? RETURNING ...` so concurrent
/// writers (worker, scheduler, releaser, cancel endpoint) can never move a
/// row out of a terminal state or skip a lifecycle step. A `None` return
/// means the guard did not match and the caller loses the race.
pub struct NotificationRepository;

impl NotificationRepository {
    pub async fn insert(
        executor: impl SqliteExecutor<'_>,
        new: &NewNotification,
        now: NaiveDateTime,
    ) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notifications (
                id, user_id, subscription_id, channel, status, priority,
                recipient, subject, body, metadata, correlation_id, idempotency_key,
                retry_count, max_retries, scheduled_at, is_deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&new.user_id)
        .bind(&new.subscription_id)
        .bind(new.channel)
        .bind(new.priority)
        .bind(&new.recipient)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(&new.metadata)
        .bind(&new.correlation_id)
        .bind(&new.idempotency_key)
        .bind(new.max_retries)
        .bind(new.scheduled_at)
        .bind(now)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: &str,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Owner-scoped read for the ingress API.
    pub async fn find_for_subscription(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        subscription_id: &str,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE id = ? AND subscription_id = ? AND is_deleted = 0
            "#
        ))
        .bind(id)
        .bind(subscription_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Idempotency lookup: the most recent non-deleted notification created
    /// with this key after `since`.
    pub async fn find_by_idempotency_key(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
        idempotency_key: &str,
        since: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE subscription_id = ? AND idempotency_key = ?
              AND created_at > ? AND is_deleted = 0
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(subscription_id)
        .bind(idempotency_key)
        .bind(since)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn list_for_subscription(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
        status: Option<NotificationStatus>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE subscription_id = ? AND is_deleted = 0
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(subscription_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn count_for_subscription(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
        status: Option<NotificationStatus>,
    ) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE subscription_id = ? AND is_deleted = 0
              AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(subscription_id)
        .bind(status)
        .bind(status)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn counts_by_status(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
    ) -> AppResult<std::collections::HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) FROM notifications
            WHERE subscription_id = ? AND is_deleted = 0
            GROUP BY status
            "#,
        )
        .bind(subscription_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    pub async fn counts_by_channel(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
    ) -> AppResult<std::collections::HashMap<String, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT channel, COUNT(*) FROM notifications
            WHERE subscription_id = ? AND is_deleted = 0
            GROUP BY channel
            "#,
        )
        .bind(subscription_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(rows.into_iter().collect())
    }

    /// Pending → Processing (worker pickup).
    pub async fn mark_processing(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'processing', updated_at = ?
            WHERE id = ? AND status = 'pending' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Processing → Sent: stamps sent_at and the provider-assigned id,
    /// clears last_error.
    pub async fn mark_sent(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        external_id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'sent', sent_at = ?, external_id = ?, last_error = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(external_id)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Processing → Retrying with the attempt counted.
    pub async fn mark_retrying(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'retrying', retry_count = retry_count + 1, last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND is_deleted = 0
              AND retry_count < max_retries
            RETURNING {COLUMNS}
            "#
        ))
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Processing/Sent → Failed. Does not touch retry_count.
    pub async fn mark_failed(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'failed', last_error = ?, updated_at = ?
            WHERE id = ? AND status IN ('processing', 'sent') AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Retrying → Pending (retry timer fired, about to re-enter the queue).
    pub async fn release_retry(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'pending', queued_at = ?, updated_at = ?
            WHERE id = ? AND status = 'retrying' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Sent → Delivered; a no-op when the row has moved on (idempotent
    /// confirmation).
    pub async fn confirm_delivered(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'delivered', delivered_at = ?, updated_at = ?
            WHERE id = ? AND status = 'sent' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Pending → Cancelled. Fails the guard for any other state, including
    /// Processing (an in-flight send cannot be recalled).
    pub async fn cancel(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'cancelled', updated_at = ?
            WHERE id = ? AND status = 'pending' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Claim a due scheduled notification for queueing. The `queued_at IS
    /// NULL` guard makes promotion race-free across releaser ticks.
    pub async fn mark_queued(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET queued_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending' AND queued_at IS NULL AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Scheduled notifications whose release time has arrived.
    pub async fn due_scheduled(
        executor: impl SqliteExecutor<'_>,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE status = 'pending' AND scheduled_at IS NOT NULL
              AND scheduled_at <= ? AND queued_at IS NULL AND is_deleted = 0
            ORDER BY scheduled_at ASC
            LIMIT ?
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Rows abandoned mid-send (process died between pickup and outcome).
    pub async fn stuck_processing(
        executor: impl SqliteExecutor<'_>,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE status = 'processing' AND updated_at < ? AND is_deleted = 0
            ORDER BY updated_at ASC
            LIMIT ?
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Processing → Pending with the lost attempt counted (stuck-row sweep).
    pub async fn reclaim_stuck(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'pending', retry_count = retry_count + 1, queued_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND is_deleted = 0
              AND retry_count < max_retries
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Processing → Failed for the sweep's exhausted-budget branch. The
    /// narrow guard means a row a worker finished in the meantime is left
    /// alone.
    pub async fn fail_stuck(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        error: &str,
        now: NaiveDateTime,
    ) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'failed', last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Everything the in-memory queue would have held before a restart:
    /// immediately-sendable pending rows plus retrying rows whose timers
    /// died with the process.
    pub async fn recoverable(
        executor: impl SqliteExecutor<'_>,
        now: NaiveDateTime,
    ) -> AppResult<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {COLUMNS} FROM notifications
            WHERE is_deleted = 0
              AND (
                    (status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?))
                 OR status = 'retrying'
              )
            ORDER BY created_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }
}
