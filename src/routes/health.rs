use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::queue::PriorityClass;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub queue: QueueHealth,
    pub providers: HashMap<String, ProviderHealth>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub circuit: &'static str,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let depth = state.queue.depth();
    let degraded = depth >= state.config.dispatch.queue_degraded_threshold;

    let mut providers = HashMap::new();
    for channel in state.registry.channels() {
        if let Ok(provider) = state.registry.get(channel) {
            providers.insert(
                channel.as_str().to_string(),
                ProviderHealth {
                    healthy: provider.health().await,
                    circuit: provider.circuit_state().as_str(),
                },
            );
        }
    }

    let response = HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        queue: QueueHealth {
            depth,
            high: state.queue.depth_of(PriorityClass::High),
            normal: state.queue.depth_of(PriorityClass::Normal),
            low: state.queue.depth_of(PriorityClass::Low),
        },
        providers,
    };

    (StatusCode::OK, Json(response))
}
