use chrono::NaiveDateTime;
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::db::models::Subscription;
use crate::error::{AppError, AppResult};

const COLUMNS: &str = r#"
    id, user_id, key, status, expires_at,
    daily_limit, monthly_limit, daily_used, monthly_used,
    last_reset_daily, last_reset_monthly,
    allow_sms, allow_email, is_deleted, created_at, updated_at
"#;

pub struct SubscriptionRepository;

impl SubscriptionRepository {
    /// Resolve the opaque ingress credential to a tenant.
    pub async fn find_by_key(
        executor: impl SqliteExecutor<'_>,
        key: &str,
    ) -> AppResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE key = ? AND is_deleted = 0"
        ))
        .bind(key)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    pub async fn find_by_id(
        executor: impl SqliteExecutor<'_>,
        id: &str,
    ) -> AppResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Write back the quota bookkeeping computed by the intake transaction:
    /// window resets plus the charge for the accepted notification. Runs
    /// inside the same transaction as the notification insert so a
    /// concurrent intake for the same tenant serializes on the row.
    pub async fn apply_usage(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        daily_used: i64,
        monthly_used: i64,
        last_reset_daily: NaiveDateTime,
        last_reset_monthly: NaiveDateTime,
        now: NaiveDateTime,
    ) -> AppResult<Subscription> {
        sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET daily_used = ?, monthly_used = ?,
                last_reset_daily = ?, last_reset_monthly = ?, updated_at = ?
            WHERE id = ? AND is_deleted = 0
            RETURNING {COLUMNS}
            "#
        ))
        .bind(daily_used)
        .bind(monthly_used)
        .bind(last_reset_daily)
        .bind(last_reset_monthly)
        .bind(now)
        .bind(id)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Operator-configurable refund path (cancel of a pending notification).
    pub async fn refund_usage(
        executor: impl SqliteExecutor<'_>,
        id: &str,
        now: NaiveDateTime,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET daily_used = MAX(daily_used - 1, 0),
                monthly_used = MAX(monthly_used - 1, 0),
                updated_at = ?
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn create(
        executor: impl SqliteExecutor<'_>,
        subscription: &Subscription,
    ) -> AppResult<Subscription> {
        sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, key, status, expires_at,
                daily_limit, monthly_limit, daily_used, monthly_used,
                last_reset_daily, last_reset_monthly,
                allow_sms, allow_email, is_deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.key)
        .bind(subscription.status)
        .bind(subscription.expires_at)
        .bind(subscription.daily_limit)
        .bind(subscription.monthly_limit)
        .bind(subscription.daily_used)
        .bind(subscription.monthly_used)
        .bind(subscription.last_reset_daily)
        .bind(subscription.last_reset_monthly)
        .bind(subscription.allow_sms)
        .bind(subscription.allow_email)
        .bind(subscription.is_deleted)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)
    }

    /// Helper for tests and seeding: a fresh active subscription.
    pub fn new_active(user_id: &str, key: &str, daily_limit: i64, monthly_limit: i64) -> Subscription {
        let now = crate::db::now_utc();
        Subscription {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            key: key.to_string(),
            status: crate::db::models::SubscriptionStatus::Active,
            expires_at: None,
            daily_limit,
            monthly_limit,
            daily_used: 0,
            monthly_used: 0,
            last_reset_daily: now,
            last_reset_monthly: now,
            allow_sms: true,
            allow_email: true,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}
