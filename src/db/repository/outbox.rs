use chrono::NaiveDateTime;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::db::models::{OutboxMessage, OutboxMessageType};
use crate::error::{AppError, AppResult};

const COLUMNS: &str =
    "id, message_type, aggregate_id, payload, attempts, last_error, processed_at, created_at";

pub struct OutboxRepository;

impl OutboxRepository {
    /// Insert a row inside the same transaction as the state change it
    /// describes.
    pub async fn insert(
        executor: impl SqliteExecutor<'_>,
        message_type: OutboxMessageType,
        aggregate_id: &str,
        payload: &str,
        now: NaiveDateTime,
    ) -> AppResult<OutboxMessage> {
        let id = Uuid::new_v4().to_string();

        sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            INSERT INTO outbox_messages (
                id, message_type, aggregate_id, payload, attempts, created_at
            ) VALUES (?, ?, ?, ?, 0, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(message_type)
        .bind(aggregate_id)
        .bind(payload)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Unprocessed rows in insertion order, up to a batch.
    pub async fn fetch_unprocessed(
        executor: impl SqliteExecutor<'_>,
        limit: i64,
    ) -> AppResult<Vec<OutboxMessage>> {
        sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            SELECT {COLUMNS} FROM outbox_messages
            WHERE processed_at IS NULL
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Flip `processed_at` exactly once.
    pub async fn mark_processed(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE outbox_messages SET processed_at = ? WHERE id = ? AND processed_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Count an attempt; dead-letter (processed with last_error) once the
    /// attempt budget is spent. Returns the updated row.
    pub async fn record_failure(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        error: &str,
        max_attempts: i32,
        now: NaiveDateTime,
    ) -> AppResult<OutboxMessage> {
        sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            UPDATE outbox_messages
            SET attempts = attempts + 1,
                last_error = ?,
                processed_at = CASE WHEN attempts + 1 >= ? THEN ? ELSE processed_at END
            WHERE id = ?
            RETURNING {COLUMNS}
            "#
        ))
        .bind(error)
        .bind(max_attempts)
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_aggregate(
        executor: impl SqliteExecutor<'_>,
        aggregate_id: &str,
    ) -> AppResult<Vec<OutboxMessage>> {
        sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            SELECT {COLUMNS} FROM outbox_messages
            WHERE aggregate_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#
        ))
        .bind(aggregate_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }
}
