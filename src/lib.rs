//! Multi-tenant notification dispatch service.
//!
//! Accepts email and SMS send requests, durably records them, enqueues by
//! priority and delivers through provider adapters with retries, circuit
//! breaking and a transactional outbox feeding tenant webhooks.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod db;
pub mod error;
pub mod providers;
pub mod queue;
pub mod routes;
pub mod services;
pub mod store;

use config::Config;
use providers::ProviderRegistry;
use queue::PriorityQueue;
use services::intake::IntakeService;
use services::scheduler::Scheduler;
use store::Store;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub store: Store,
    pub queue: Arc<PriorityQueue>,
    pub registry: Arc<ProviderRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub intake: IntakeService,
}

impl AppState {
    pub fn new(db: sqlx::SqlitePool, config: Config) -> Self {
        Self::with_registry(
            db,
            ProviderRegistry::with_default_providers(&config.provider),
            config,
        )
    }

    /// Wiring seam for tests and alternative channel stacks.
    pub fn with_registry(db: sqlx::SqlitePool, registry: ProviderRegistry, config: Config) -> Self {
        let store = Store::new(db.clone());
        let queue = Arc::new(PriorityQueue::new(config.dispatch.queue_capacity));
        let intake = IntakeService::new(store.clone(), queue.clone(), config.clone());

        Self {
            db,
            store,
            queue,
            registry: Arc::new(registry),
            scheduler: Arc::new(Scheduler::new()),
            intake,
            config,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api/notifications", routes::notifications::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
