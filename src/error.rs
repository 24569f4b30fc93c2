use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Subscription invalid: {0}")]
    SubscriptionInvalid(String),

    #[error("Quota exceeded")]
    QuotaExceeded {
        /// Seconds until the next quota window opens.
        retry_after_seconds: u64,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dispatch queue at capacity")]
    QueueOverloaded,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No provider registered for channel: {0}")]
    NoProviderForType(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl AppError {
    /// Stable machine-readable code, shared between HTTP responses and
    /// batch entry results.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "INVALID_SUBSCRIPTION_KEY",
            AppError::SubscriptionInvalid(_) => "SUBSCRIPTION_INVALID",
            AppError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::QueueOverloaded => "QUEUE_OVERLOADED",
            AppError::Cancelled => "CANCELLED",
            AppError::NoProviderForType(_) => "NO_PROVIDER",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Request(_) => "EXTERNAL_REQUEST_FAILED",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Database conflicts that a transaction-level retry can resolve
    /// (SQLite busy/locked under concurrent writers).
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message().to_lowercase();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            AppError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Unique-index violation on (subscription_id, idempotency_key),
    /// raised when two intakes with the same key race past the pre-check.
    pub fn is_idempotency_conflict(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db)) => {
                db.message().contains("idx_notifications_idempotency")
            }
            _ => false,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::SubscriptionInvalid(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::QuotaExceeded { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::QueueOverloaded => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::Cancelled => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NoProviderForType(channel) => {
                tracing::error!("No provider registered for channel: {}", channel);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "No provider registered for the requested channel".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: None,
            },
        };

        let mut response = (status, Json(body)).into_response();

        if let AppError::QuotaExceeded {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
