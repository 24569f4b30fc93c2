use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::NotificationChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
    Expired,
    Revoked,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Revoked => "revoked",
        }
    }
}

/// Tenant boundary: carries the ingress credential, per-window quotas and
/// channel permissions.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    /// Opaque, rotatable ingress credential.
    pub key: String,
    pub status: SubscriptionStatus,
    pub expires_at: Option<NaiveDateTime>,
    pub daily_limit: i64,
    pub monthly_limit: i64,
    pub daily_used: i64,
    pub monthly_used: i64,
    pub last_reset_daily: NaiveDateTime,
    pub last_reset_monthly: NaiveDateTime,
    pub allow_sms: bool,
    pub allow_email: bool,
    pub is_deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Subscription {
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.status == SubscriptionStatus::Active
            && self.expires_at.map_or(true, |expires| expires > now)
    }

    pub fn allows_channel(&self, channel: NotificationChannel) -> bool {
        match channel {
            NotificationChannel::Email => self.allow_email,
            NotificationChannel::Sms => self.allow_sms,
        }
    }

    /// Daily window rolled over if the last reset happened before today's
    /// midnight UTC; monthly on the first of the month UTC.
    pub fn daily_window_rolled(&self, now: NaiveDateTime) -> bool {
        self.last_reset_daily.date() < now.date()
    }

    pub fn monthly_window_rolled(&self, now: NaiveDateTime) -> bool {
        let last = self.last_reset_monthly.date();
        (last.year(), last.month()) < (now.year(), now.month())
    }

    /// Seconds until the next daily window opens, for `Retry-After`.
    pub fn seconds_until_daily_reset(now: NaiveDateTime) -> u64 {
        let tomorrow = now
            .date()
            .succ_opt()
            .unwrap_or(now.date())
            .and_hms_opt(0, 0, 0)
            .unwrap_or(now);
        (tomorrow - now).num_seconds().max(1) as u64
    }

    /// Seconds until the first of the next month UTC.
    pub fn seconds_until_monthly_reset(now: NaiveDateTime) -> u64 {
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        let next = chrono::NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(now);
        (next - now).num_seconds().max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn subscription() -> Subscription {
        Subscription {
            id: "sub-1".to_string(),
            user_id: "user-1".to_string(),
            key: "key-1".to_string(),
            status: SubscriptionStatus::Active,
            expires_at: None,
            daily_limit: 100,
            monthly_limit: 1000,
            daily_used: 0,
            monthly_used: 0,
            last_reset_daily: at(2024, 6, 1, 0),
            last_reset_monthly: at(2024, 6, 1, 0),
            allow_sms: true,
            allow_email: true,
            is_deleted: false,
            created_at: at(2024, 6, 1, 0),
            updated_at: at(2024, 6, 1, 0),
        }
    }

    #[test]
    fn daily_window_rolls_at_midnight_utc() {
        let sub = subscription();
        assert!(!sub.daily_window_rolled(at(2024, 6, 1, 23)));
        assert!(sub.daily_window_rolled(at(2024, 6, 2, 0)));
    }

    #[test]
    fn monthly_window_rolls_on_first_of_month() {
        let sub = subscription();
        assert!(!sub.monthly_window_rolled(at(2024, 6, 30, 23)));
        assert!(sub.monthly_window_rolled(at(2024, 7, 1, 0)));
        assert!(sub.monthly_window_rolled(at(2025, 1, 1, 0)));
    }

    #[test]
    fn expired_subscription_is_not_active() {
        let mut sub = subscription();
        sub.expires_at = Some(at(2024, 6, 15, 0));
        assert!(sub.is_active(at(2024, 6, 14, 0)));
        assert!(!sub.is_active(at(2024, 6, 15, 0)));
    }

    #[test]
    fn seconds_until_daily_reset_counts_to_midnight() {
        let secs = Subscription::seconds_until_daily_reset(at(2024, 6, 1, 23));
        assert_eq!(secs, 3600);
    }
}
