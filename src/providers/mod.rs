//! Channel provider adapters and the resilience pipeline around them.

pub mod circuit;
pub mod email;
pub mod resilient;
pub mod sms;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::db::models::{Notification, NotificationChannel};
use crate::error::{AppError, AppResult};

pub use circuit::{CircuitBreaker, CircuitState};
pub use email::EmailProvider;
pub use resilient::{ResilientProvider, SendOutcome};
pub use sms::SmsProvider;

/// Errors raised by a provider transport. `success=false` responses are a
/// different thing entirely: the provider answered, the answer was a
/// rejection. Errors here mean the call itself failed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("send timed out")]
    Timeout,

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Permanent(_))
    }
}

/// Delivery state reported by `get_status` lookups against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Accepted,
    Delivered,
    Failed,
    Unknown,
}

/// Raw provider answer for a single send.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub success: bool,
    pub external_id: Option<String>,
    pub message: Option<String>,
    /// Opaque provider payload kept for the audit log.
    pub provider_response: Option<String>,
}

impl ProviderResponse {
    pub fn accepted(external_id: String, provider_response: Option<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id),
            message: None,
            provider_response,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            message: Some(message.into()),
            provider_response: None,
        }
    }
}

/// Capability set every channel adapter implements. Adapters are
/// registered once per channel per process and must be internally
/// concurrency-safe.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<ProviderResponse, ProviderError>;

    async fn get_status(&self, external_id: &str) -> Result<DeliveryState, ProviderError>;

    async fn health(&self) -> bool;
}

/// Maps a notification channel to its (resilience-wrapped) adapter.
pub struct ProviderRegistry {
    providers: HashMap<NotificationChannel, Arc<ResilientProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Standard production wiring: simulated email + SMS transports.
    pub fn with_default_providers(config: &ProviderConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            NotificationChannel::Email,
            Arc::new(EmailProvider::new()),
            config,
        );
        registry.register(
            NotificationChannel::Sms,
            Arc::new(SmsProvider::new()),
            config,
        );
        registry
    }

    pub fn register(
        &mut self,
        channel: NotificationChannel,
        provider: Arc<dyn NotificationProvider>,
        config: &ProviderConfig,
    ) {
        self.providers.insert(
            channel,
            Arc::new(ResilientProvider::new(provider, config.clone())),
        );
    }

    pub fn get(&self, channel: NotificationChannel) -> AppResult<Arc<ResilientProvider>> {
        self.providers
            .get(&channel)
            .cloned()
            .ok_or_else(|| AppError::NoProviderForType(channel.as_str().to_string()))
    }

    pub fn channels(&self) -> impl Iterator<Item = NotificationChannel> + '_ {
        self.providers.keys().copied()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn registry_rejects_unmapped_channel() {
        let registry = ProviderRegistry::new();
        let err = registry.get(NotificationChannel::Email).unwrap_err();
        assert!(matches!(err, AppError::NoProviderForType(channel) if channel == "email"));
    }

    #[test]
    fn default_wiring_covers_both_channels() {
        let config = Config::default();
        let registry = ProviderRegistry::with_default_providers(&config.provider);
        assert!(registry.get(NotificationChannel::Email).is_ok());
        assert!(registry.get(NotificationChannel::Sms).is_ok());
    }
}
