use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{
    Notification, NotificationChannel, NotificationPriority, NotificationStatus, Subscription,
};
use crate::db::repository::{NotificationRepository, SubscriptionRepository};
use crate::error::{AppError, AppResult};
use crate::services::intake::{BatchEntryResult, BatchRequest, SendRequest, SendResponse};
use crate::AppState;

pub const SUBSCRIPTION_KEY_HEADER: &str = "x-subscription-key";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(send_notification).get(list_notifications))
        .route("/batch", post(send_batch))
        .route("/stats", get(notification_stats))
        .route("/:id", get(get_notification))
        .route("/:id/cancel", post(cancel_notification))
}

/// Extractor resolving the `X-Subscription-Key` header to a tenant.
/// Unknown or missing keys are 401; status/expiry/channel checks are the
/// intake service's business and surface as 403.
pub struct AuthedSubscription(pub Subscription);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedSubscription {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(SUBSCRIPTION_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                tracing::debug!("missing X-Subscription-Key header");
                AppError::Unauthorized
            })?;

        let subscription = SubscriptionRepository::find_by_key(&state.db, key)
            .await?
            .ok_or_else(|| {
                tracing::debug!("unknown subscription key");
                AppError::Unauthorized
            })?;

        Ok(AuthedSubscription(subscription))
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<NotificationStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsListResponse {
    pub items: Vec<NotificationResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub recipient: String,
    pub subject: String,
    pub correlation_id: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub external_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

impl From<Notification> for NotificationResponse {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            channel: n.channel,
            status: n.status,
            priority: n.priority,
            recipient: n.recipient,
            subject: n.subject,
            correlation_id: n.correlation_id,
            retry_count: n.retry_count,
            max_retries: n.max_retries,
            last_error: n.last_error,
            external_id: n.external_id,
            scheduled_at: n.scheduled_at.map(utc),
            sent_at: n.sent_at.map(utc),
            delivered_at: n.delivered_at.map(utc),
            created_at: utc(n.created_at),
            updated_at: utc(n.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatsResponse {
    pub by_status: std::collections::HashMap<String, i64>,
    pub by_type: std::collections::HashMap<String, i64>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Accept a single notification.
async fn send_notification(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
    Json(request): Json<SendRequest>,
) -> AppResult<(StatusCode, Json<SendResponse>)> {
    let response = state.intake.send(&subscription, &request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Accept up to 1000 notifications; per-entry results.
async fn send_batch(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
    Json(batch): Json<BatchRequest>,
) -> AppResult<Json<Vec<BatchEntryResult>>> {
    let results = state.intake.send_batch(&subscription, &batch).await?;
    Ok(Json(results))
}

/// Owner-scoped single read.
async fn get_notification(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
    Path(id): Path<String>,
) -> AppResult<Json<NotificationResponse>> {
    let notification =
        NotificationRepository::find_for_subscription(&state.db, &id, &subscription.id)
            .await?
            .ok_or_else(|| AppError::NotFound("notification not found".to_string()))?;
    Ok(Json(notification.into()))
}

/// Owner-scoped paged listing with optional status filter.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let items = NotificationRepository::list_for_subscription(
        &state.db,
        &subscription.id,
        query.status,
        per_page,
        offset,
    )
    .await?;
    let total =
        NotificationRepository::count_for_subscription(&state.db, &subscription.id, query.status)
            .await?;
    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    Ok(Json(NotificationsListResponse {
        items: items.into_iter().map(Into::into).collect(),
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Counts by status and channel for the authenticated tenant.
async fn notification_stats(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
) -> AppResult<Json<NotificationStatsResponse>> {
    let by_status = NotificationRepository::counts_by_status(&state.db, &subscription.id).await?;
    let by_type = NotificationRepository::counts_by_channel(&state.db, &subscription.id).await?;
    let total = by_status.values().sum();

    Ok(Json(NotificationStatsResponse {
        by_status,
        by_type,
        total,
    }))
}

/// Cancel a pending notification; 400 once it is processing or settled.
async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    AuthedSubscription(subscription): AuthedSubscription,
    Path(id): Path<String>,
) -> AppResult<Json<CancelResponse>> {
    let cancelled = state.intake.cancel(&subscription, &id).await?;
    Ok(Json(CancelResponse {
        notification_id: cancelled.id,
        status: cancelled.status,
        message: "notification cancelled".to_string(),
    }))
}
