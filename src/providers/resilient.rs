//! Resilience pipeline wrapped around every channel adapter:
//! timeout ⊃ circuit breaker ⊃ in-call retry ⊃ provider send.
//!
//! The in-call retry applies only to transport errors (`Err` from the
//! adapter). A provider that answers with `success=false` has spoken; the
//! worker-level retry policy owns that case.

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::db::models::Notification;
use crate::providers::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use crate::providers::{DeliveryState, NotificationProvider, ProviderError, ProviderResponse};

/// What the worker sees from one outer send call. Never an `Err`: every
/// failure mode is folded into `success=false` plus a retryability verdict
/// for the worker's state machine.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub external_id: Option<String>,
    pub message: Option<String>,
    pub provider_response: Option<String>,
    /// False only for rejections no retry can fix (bad recipient and the
    /// like); the worker goes straight to Failed.
    pub retryable: bool,
}

impl SendOutcome {
    fn failure(message: String, retryable: bool) -> Self {
        Self {
            success: false,
            external_id: None,
            message: Some(message),
            provider_response: None,
            retryable,
        }
    }
}

/// Heuristics over provider rejection messages for failures that retrying
/// cannot fix. Conservative default: retry.
fn is_permanent_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("invalid recipient")
        || m.contains("recipient invalid")
        || m.contains("unknown recipient")
        || m.contains("recipient blocked")
        || m.contains("unsubscribed")
        || m.contains("message rejected")
}

pub struct ResilientProvider {
    inner: Arc<dyn NotificationProvider>,
    breaker: CircuitBreaker,
    config: ProviderConfig,
}

impl std::fmt::Debug for ResilientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientProvider")
            .field("inner", &self.inner.name())
            .field("breaker", &self.breaker)
            .field("config", &self.config)
            .finish()
    }
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn NotificationProvider>, config: ProviderConfig) -> Self {
        let breaker = CircuitBreaker::new(
            inner.name().to_string(),
            CircuitConfig {
                window: config.circuit_window,
                min_throughput: config.circuit_min_throughput,
                failure_ratio: config.circuit_failure_ratio,
                break_for: config.circuit_break,
            },
        );
        Self {
            inner,
            breaker,
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub async fn send(&self, notification: &Notification) -> SendOutcome {
        let name = self.inner.name();

        if !self.breaker.try_acquire() {
            tracing::debug!(provider = name, notification_id = %notification.id, "circuit open, rejecting send");
            return SendOutcome::failure(format!("{name} temporarily unavailable"), true);
        }

        match tokio::time::timeout(self.config.timeout, self.send_with_retry(notification)).await {
            Ok(Ok(response)) => {
                self.breaker.record(response.success);
                let retryable = match response.message.as_deref() {
                    Some(message) if !response.success => !is_permanent_message(message),
                    _ => true,
                };
                SendOutcome {
                    success: response.success,
                    external_id: response.external_id,
                    message: response.message,
                    provider_response: response.provider_response,
                    retryable,
                }
            }
            Ok(Err(error)) => {
                self.breaker.record(false);
                SendOutcome::failure(error.to_string(), error.is_retryable())
            }
            Err(_) => {
                // The inner future was dropped mid-flight; the provider may
                // or may not have accepted the message (at-most-once per
                // successful attempt still holds: without an external id we
                // treat it as not sent).
                self.breaker.record(false);
                tracing::warn!(provider = name, notification_id = %notification.id, "send timed out");
                SendOutcome::failure(format!("{name} temporarily unavailable"), true)
            }
        }
    }

    async fn send_with_retry(
        &self,
        notification: &Notification,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.inner.send(notification).await {
                Ok(response) => return Ok(response),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) if attempt >= self.config.retry_attempts => return Err(error),
                Err(error) => {
                    let delay = self.config.retry_base * 2u32.pow(attempt);
                    attempt += 1;
                    tracing::debug!(
                        provider = self.inner.name(),
                        notification_id = %notification.id,
                        attempt,
                        "transient send error, retrying in {:?}: {}",
                        delay,
                        error,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn get_status(&self, external_id: &str) -> Result<DeliveryState, ProviderError> {
        self.inner.get_status(external_id).await
    }

    pub async fn health(&self) -> bool {
        self.breaker.state() != CircuitState::Open && self.inner.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::Config;
    use crate::db::models::{NotificationChannel, NotificationPriority, NotificationStatus};

    fn notification() -> Notification {
        let now = crate::db::now_utc();
        Notification {
            id: "n-1".to_string(),
            user_id: "u-1".to_string(),
            subscription_id: "s-1".to_string(),
            channel: NotificationChannel::Email,
            status: NotificationStatus::Processing,
            priority: NotificationPriority::Normal,
            recipient: "a@b".to_string(),
            subject: "S".to_string(),
            body: "B".to_string(),
            metadata: None,
            correlation_id: None,
            idempotency_key: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            external_id: None,
            scheduled_at: None,
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Plays back a scripted sequence of results, then repeats the last.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NotificationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _: &Notification) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ProviderError::Transient("script exhausted".to_string())))
        }

        async fn get_status(&self, _: &str) -> Result<DeliveryState, ProviderError> {
            Ok(DeliveryState::Unknown)
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn wrap(provider: Arc<ScriptedProvider>) -> ResilientProvider {
        ResilientProvider::new(provider, Config::default().provider)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_in_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Transient("connection reset".to_string())),
            Err(ProviderError::Transient("connection reset".to_string())),
            Ok(ProviderResponse::accepted("X1".to_string(), None)),
        ]));
        let resilient = wrap(provider.clone());

        let outcome = resilient.send(&notification()).await;

        assert!(outcome.success);
        assert_eq!(outcome.external_id.as_deref(), Some("X1"));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_responses_are_not_retried_in_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ProviderResponse::rejected(
            "mailbox over quota",
        ))]));
        let resilient = wrap(provider.clone());

        let outcome = resilient.send(&notification()).await;

        assert!(!outcome.success);
        assert!(outcome.retryable);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_skip_retries_and_mark_non_retryable() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Permanent(
            "invalid recipient address".to_string(),
        ))]));
        let resilient = wrap(provider.clone());

        let outcome = resilient.send(&notification()).await;

        assert!(!outcome.success);
        assert!(!outcome.retryable);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_rejection_message_marks_non_retryable() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ProviderResponse::rejected(
            "550 invalid recipient",
        ))]));
        let resilient = wrap(provider);

        let outcome = resilient.send(&notification()).await;

        assert!(!outcome.success);
        assert!(!outcome.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exhausted_after_two_extra_attempts() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Transient("reset".to_string())),
            Err(ProviderError::Transient("reset".to_string())),
            Err(ProviderError::Transient("reset".to_string())),
            Ok(ProviderResponse::accepted("never".to_string(), None)),
        ]));
        let resilient = wrap(provider.clone());

        let outcome = resilient.send(&notification()).await;

        assert!(!outcome.success);
        assert!(outcome.retryable);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_touching_the_provider() {
        let script: Vec<_> = (0..10)
            .map(|_| Err(ProviderError::Transient("down".to_string())))
            .collect();
        let provider = Arc::new(ScriptedProvider::new(script));
        let resilient = wrap(provider.clone());

        // Each outer call burns 3 scripted errors (1 + 2 retries); two
        // failed outer calls are enough once min throughput allows, so
        // keep sending until the breaker opens.
        for _ in 0..5 {
            resilient.send(&notification()).await;
            if resilient.circuit_state() == CircuitState::Open {
                break;
            }
        }
        assert_eq!(resilient.circuit_state(), CircuitState::Open);

        let calls_before = provider.calls();
        let outcome = resilient.send(&notification()).await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.message.as_deref(),
            Some("scripted temporarily unavailable")
        );
        assert_eq!(provider.calls(), calls_before);
    }
}
