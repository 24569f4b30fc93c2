use chrono::NaiveDateTime;
use sqlx::SqliteExecutor;

use crate::db::models::WebhookSubscription;
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, subscription_id, url, secret, events, active,
    consecutive_failures, last_success_at, last_failure_at,
    is_deleted, created_at, updated_at
"#;

pub struct WebhookRepository;

impl WebhookRepository {
    /// Active webhooks for a tenant; event filtering happens in the
    /// dispatcher against the comma-set.
    pub async fn find_active_for_subscription(
        executor: impl SqliteExecutor<'_>,
        subscription_id: &str,
    ) -> AppResult<Vec<WebhookSubscription>> {
        sqlx::query_as::<_, WebhookSubscription>(&format!(
            r#"
            SELECT {COLUMNS} FROM webhook_subscriptions
            WHERE subscription_id = ? AND active = 1 AND is_deleted = 0
            "#
        ))
        .bind(subscription_id)
        .fetch_all(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn record_success(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET consecutive_failures = 0, last_success_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Count a failure; deactivate once the consecutive-failure budget is
    /// spent. Returns whether the webhook was deactivated by this call.
    pub async fn record_failure(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        max_failures: i32,
        now: NaiveDateTime,
    ) -> AppResult<bool> {
        let deactivated = sqlx::query_scalar::<_, bool>(
            r#"
            UPDATE webhook_subscriptions
            SET consecutive_failures = consecutive_failures + 1,
                last_failure_at = ?,
                active = CASE WHEN consecutive_failures + 1 >= ? THEN 0 ELSE active END,
                updated_at = ?
            WHERE id = ?
            RETURNING active = 0
            "#,
        )
        .bind(now)
        .bind(max_failures)
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(deactivated)
    }

    pub async fn create(
        executor: impl SqliteExecutor<'_>,
        webhook: &WebhookSubscription,
    ) -> AppResult<WebhookSubscription> {
        sqlx::query_as::<_, WebhookSubscription>(&format!(
            r#"
            INSERT INTO webhook_subscriptions (
                id, subscription_id, url, secret, events, active,
                consecutive_failures, last_success_at, last_failure_at,
                is_deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&webhook.id)
        .bind(&webhook.subscription_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&webhook.events)
        .bind(webhook.active)
        .bind(webhook.consecutive_failures)
        .bind(webhook.last_success_at)
        .bind(webhook.last_failure_at)
        .bind(webhook.is_deleted)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }
}
