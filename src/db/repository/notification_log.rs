use chrono::NaiveDateTime;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::db::models::{NewNotificationLog, NotificationLog};
use crate::error::{AppError, AppResult};

const COLUMNS: &str =
    "id, notification_id, status, message, details, provider_response, created_at";

/// Append-only repository: inserts and reads, no updates.
pub struct NotificationLogRepository;

impl NotificationLogRepository {
    pub async fn insert(
        executor: impl SqliteExecutor<'_>,
        log: NewNotificationLog,
        now: NaiveDateTime,
    ) -> AppResult<NotificationLog> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, NotificationLog>(&format!(
            r#"
            INSERT INTO notification_logs (
                id, notification_id, status, message, details, provider_response, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(log.notification_id)
        .bind(log.status)
        .bind(log.message)
        .bind(log.details)
        .bind(log.provider_response)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Transition history for one notification, in insertion order.
    pub async fn list_for_notification(
        executor: impl SqliteExecutor<'_>,
        notification_id: &str,
    ) -> AppResult<Vec<NotificationLog>> {
        sqlx::query_as::<_, NotificationLog>(&format!(
            r#"
            SELECT {COLUMNS} FROM notification_logs
            WHERE notification_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#
        ))
        .bind(notification_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }
}
