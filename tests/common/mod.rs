//! Common test utilities for E2E tests
//!
//! Every `TestServer` is a full instance on `127.0.0.1:<port>`; two of them
//! federate with each other over loopback HTTP.

#![allow(dead_code)]

use fedcore::data::Actor;
use fedcore::federation::{DeliveryWorker, OutgoingRequest, sign_at, unwrap_key};
use fedcore::{AppState, config};
use rsa::RsaPrivateKey;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_accounts(config::AccountsConfig::default()).await
    }

    /// Test server that bootstraps `accounts` on startup
    pub async fn with_accounts(accounts: config::AccountsConfig) -> Self {
        // Bind first: the public domain carries the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let domain = local_addr.to_string();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: local_addr.port(),
                domain: domain.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path,
                max_connections: 4,
            },
            federation: config::FederationConfig {
                key_encryption_secret: fedcore::federation::Kek::new(TEST_SECRET),
                key_bits: 2048,
                signature_max_skew_seconds: 300,
                actor_refresh_seconds: 86_400,
                fetch_timeout_seconds: 10,
                allow_private_hosts: true,
            },
            delivery: config::DeliveryConfig {
                worker_enabled: false,
                base_backoff_seconds: 0,
                max_backoff_seconds: 0,
                ..config::DeliveryConfig::default()
            },
            accounts,
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config).await.unwrap();
        let app = fedcore::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", domain),
            domain,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Register a local actor on this instance
    pub async fn create_actor(&self, username: &str) -> Actor {
        fedcore::service::create_local_actor(
            &self.state.db,
            &self.state.config.federation.kek(),
            &self.state.config.server,
            username,
            None,
            self.state.config.federation.key_bits,
        )
        .await
        .unwrap()
    }

    /// Unwrapped signing key of a local actor
    pub fn signing_key(&self, actor: &Actor) -> RsaPrivateKey {
        let material = actor.key_material.as_ref().expect("local actor has a key");
        unwrap_key(
            &self.state.config.federation.kek(),
            &material.wrapped_private_key,
            &material.salt,
        )
        .unwrap()
    }

    /// Queue consumer for this instance; tests drive it with `run_once`
    pub fn worker(&self) -> DeliveryWorker {
        self.state
            .delivery_worker(self.state.config.federation.kek())
    }

    /// POST `activity` to `inbox_url` signed by `key` under `key_id`
    pub async fn post_signed(
        &self,
        inbox_url: &str,
        activity: &serde_json::Value,
        key: &RsaPrivateKey,
        key_id: &str,
        created: i64,
    ) -> reqwest::Response {
        let url = url::Url::parse(inbox_url).unwrap();
        let body = serde_json::to_vec(activity).unwrap();
        let request = OutgoingRequest::post_activity(url, body);
        let signed = sign_at(request, key, key_id, created).unwrap();

        self.client
            .post(signed.url)
            .headers(signed.headers)
            .body(signed.body)
            .send()
            .await
            .unwrap()
    }
}
