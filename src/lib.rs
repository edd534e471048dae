//! fedcore - server-to-server ActivityPub federation core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor, inbox and collection endpoints        │
//! │  - WebFinger, health, metrics                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Federation / Service                       │
//! │  - Key vault, HTTP signatures                               │
//! │  - Actor directory, relationship ledger                     │
//! │  - Delivery dispatcher and durable queue                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `federation`: keys, signatures, actors, follows, delivery, inbox
//! - `service`: local accounts and idempotency
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// Cloned for each request; everything inside is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Remote actor discovery and cache
    pub directory: Arc<federation::ActorDirectory>,

    /// Signed single-shot deliveries
    pub dispatcher: federation::DeliveryDispatcher,

    /// Producer side of the delivery queue
    pub queue: federation::SqliteDeliveryQueue,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the federation HTTP client, shared by directory and dispatcher
    /// 3. Wire the actor directory, dispatcher and queue
    /// 4. Create configured local actors that do not exist yet
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect_with_pool_size(
            &config.database.path,
            config.database.max_connections,
        )
        .await?;
        let db = Arc::new(db);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("fedcore/", env!("CARGO_PKG_VERSION")))
            .timeout(config.federation.fetch_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 3. Federation services
        let directory = federation::ActorDirectory::new(
            db.clone(),
            http_client.clone(),
            config.server.domain.clone(),
            config.federation.actor_refresh_after(),
            config.federation.allow_private_hosts,
        );
        let dispatcher = federation::DeliveryDispatcher::new(
            http_client,
            config.federation.fetch_timeout(),
            config.federation.allow_private_hosts,
        );
        let queue = federation::SqliteDeliveryQueue::new(db.clone());

        // 4. Configured local actors
        service::ensure_local_actors(
            &db,
            &config.federation.kek(),
            &config.server,
            &config.accounts,
            config.federation.key_bits,
        )
        .await?;

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            directory: Arc::new(directory),
            dispatcher,
            queue,
        })
    }

    /// Build a queue consumer over this state
    ///
    /// The secret is passed in rather than read from `config` so the
    /// caller decides where the consumer gets its key material.
    pub fn delivery_worker(&self, kek: federation::Kek) -> federation::DeliveryWorker {
        federation::DeliveryWorker::new(
            self.queue.clone(),
            self.db.clone(),
            self.directory.clone(),
            self.dispatcher.clone(),
            kek,
            self.config.delivery.clone(),
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
