//! Intake API tests: router-level behavior against in-memory SQLite.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

use notification_dispatch::config::Config;
use notification_dispatch::db::models::{Subscription, SubscriptionStatus};
use notification_dispatch::db::repository::SubscriptionRepository;
use notification_dispatch::{build_router, AppState};

async fn test_state() -> Arc<AppState> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Arc::new(AppState::new(pool, Config::default()))
}

async fn seed_subscription(state: &AppState, key: &str, daily_limit: i64) -> Subscription {
    let subscription = SubscriptionRepository::new_active("user-1", key, daily_limit, 10_000);
    SubscriptionRepository::create(&state.db, &subscription)
        .await
        .unwrap()
}

fn email_request() -> Value {
    json!({
        "type": "email",
        "recipient": "a@b.test",
        "subject": "S",
        "body": "B",
        "priority": "high",
    })
}

async fn post_json(state: &Arc<AppState>, uri: &str, key: &str, body: Value) -> (StatusCode, Value) {
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("X-Subscription-Key", key)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn get_json(state: &Arc<AppState>, uri: &str, key: &str) -> (StatusCode, Value) {
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .header("X-Subscription-Key", key)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn accept_persists_and_charges_quota() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let (status, body) = post_json(&state, "/api/notifications", "key-1", email_request()).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["wasIdempotent"], false);
    let id = body["notificationId"].as_str().unwrap();

    // Quota charged exactly once.
    let sub = SubscriptionRepository::find_by_key(&state.db, "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.daily_used, 1);
    assert_eq!(sub.monthly_used, 1);

    // Exactly one accepted outbox row for the aggregate.
    let outbox: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox_messages WHERE aggregate_id = ? AND message_type = 'notification_accepted'",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await
    .unwrap();
    assert_eq!(outbox, 1);

    // Queue holds the routing snapshot.
    assert_eq!(state.queue.depth(), 1);
}

#[tokio::test]
async fn unknown_key_is_unauthorized() {
    let state = test_state().await;

    let (status, body) = post_json(&state, "/api/notifications", "nope", email_request()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SUBSCRIPTION_KEY");
}

#[tokio::test]
async fn suspended_subscription_is_forbidden() {
    let state = test_state().await;
    let mut subscription = SubscriptionRepository::new_active("user-1", "key-1", 10, 100);
    subscription.status = SubscriptionStatus::Suspended;
    SubscriptionRepository::create(&state.db, &subscription)
        .await
        .unwrap();

    let (status, body) = post_json(&state, "/api/notifications", "key-1", email_request()).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "SUBSCRIPTION_INVALID");
}

#[tokio::test]
async fn channel_permission_is_enforced() {
    let state = test_state().await;
    let mut subscription = SubscriptionRepository::new_active("user-1", "key-1", 10, 100);
    subscription.allow_sms = false;
    SubscriptionRepository::create(&state.db, &subscription)
        .await
        .unwrap();

    let request = json!({
        "type": "sms",
        "recipient": "+15551234567",
        "subject": "",
        "body": "hi",
    });
    let (status, body) = post_json(&state, "/api/notifications", "key-1", request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "SUBSCRIPTION_INVALID");
}

#[tokio::test]
async fn quota_exhaustion_rejects_without_side_effects() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 1).await;

    let (first, _) = post_json(&state, "/api/notifications", "key-1", email_request()).await;
    assert_eq!(first, StatusCode::CREATED);

    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/notifications")
                .header("X-Subscription-Key", "key-1")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(email_request().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // No second row, no extra charge, no extra outbox entry.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let sub = SubscriptionRepository::find_by_key(&state.db, "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.daily_used, 1);
    let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages")
        .fetch_one(&state.db)
        .await
        .unwrap();
    assert_eq!(outbox, 1);
}

#[tokio::test]
async fn sms_body_over_160_is_rejected() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let request = json!({
        "type": "sms",
        "recipient": "+15551234567",
        "subject": "",
        "body": "x".repeat(161),
    });
    let (status, body) = post_json(&state, "/api/notifications", "key-1", request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn past_scheduled_at_is_rejected() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let mut request = email_request();
    request["scheduledAt"] = json!((chrono::Utc::now() - chrono::Duration::minutes(2)).to_rfc3339());

    let (status, body) = post_json(&state, "/api/notifications", "key-1", request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn future_scheduled_notification_is_not_queued() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let mut request = email_request();
    request["scheduledAt"] = json!((chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339());

    let (status, _) = post_json(&state, "/api/notifications", "key-1", request).await;

    assert_eq!(status, StatusCode::CREATED);
    // Left for the scheduled releaser, not the queue.
    assert_eq!(state.queue.depth(), 0);
}

#[tokio::test]
async fn idempotent_replay_returns_same_id_and_charges_once() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let mut request = email_request();
    request["idempotencyKey"] = json!("order-42");

    let (s1, b1) = post_json(&state, "/api/notifications", "key-1", request.clone()).await;
    let (s2, b2) = post_json(&state, "/api/notifications", "key-1", request).await;

    assert_eq!(s1, StatusCode::CREATED);
    assert_eq!(s2, StatusCode::CREATED);
    assert_eq!(b1["notificationId"], b2["notificationId"]);
    assert_eq!(b1["wasIdempotent"], false);
    assert_eq!(b2["wasIdempotent"], true);

    let sub = SubscriptionRepository::find_by_key(&state.db, "key-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.daily_used, 1);
    assert_eq!(state.queue.depth(), 1);
}

#[tokio::test]
async fn batch_reports_per_entry_results() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let batch = json!({
        "notifications": [
            email_request(),
            {
                "type": "sms",
                "recipient": "+15551234567",
                "subject": "",
                "body": "x".repeat(161),
            },
            email_request(),
        ]
    });

    let (status, body) = post_json(&state, "/api/notifications/batch", "key-1", batch).await;

    assert_eq!(status, StatusCode::OK);
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["accepted"], true);
    assert_eq!(results[1]["accepted"], false);
    assert_eq!(results[1]["errorCode"], "VALIDATION_FAILED");
    assert_eq!(results[2]["accepted"], true);
}

#[tokio::test]
async fn cancel_pending_succeeds_then_rejects() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    let (_, body) = post_json(&state, "/api/notifications", "key-1", email_request()).await;
    let id = body["notificationId"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &state,
        &format!("/api/notifications/{id}/cancel"),
        "key-1",
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    // Terminal: a second cancel is a client error.
    let (status, body) = post_json(
        &state,
        &format!("/api/notifications/{id}/cancel"),
        "key-1",
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn reads_are_owner_scoped() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;
    seed_subscription(&state, "key-2", 10).await;

    let (_, body) = post_json(&state, "/api/notifications", "key-1", email_request()).await;
    let id = body["notificationId"].as_str().unwrap().to_string();

    let (status, body) = get_json(&state, &format!("/api/notifications/{id}"), "key-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "email");
    assert_eq!(body["priority"], "high");

    let (status, _) = get_json(&state, &format!("/api/notifications/{id}"), "key-2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_and_stats_cover_the_tenant() {
    let state = test_state().await;
    seed_subscription(&state, "key-1", 10).await;

    for _ in 0..3 {
        post_json(&state, "/api/notifications", "key-1", email_request()).await;
    }

    let (status, body) = get_json(&state, "/api/notifications?perPage=2", "key-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["totalPages"], 2);

    let (status, body) = get_json(&state, "/api/notifications/stats", "key-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["byStatus"]["pending"], 3);
    assert_eq!(body["byType"]["email"], 3);
}
