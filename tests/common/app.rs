use std::sync::Arc;

use axum_test::TestServer;
use fleet_scheduler::build_router;
use fleet_scheduler::config::Config;
use fleet_scheduler::queue::InMemoryStore;
use fleet_scheduler::state::AppState;

/// Test configuration
pub fn test_config() -> Config {
    Config {
        redis_url: None,
        host: "127.0.0.1".to_string(),
        port: 0,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Config::default()
    }
}

/// Test application wrapper
pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
}

impl TestApp {
    /// Create a new test application
    pub async fn new() -> Self {
        // In-memory store keeps HTTP tests independent of Redis
        let state = AppState::with_store(test_config(), Arc::new(InMemoryStore::new()));

        let router = build_router(state.clone());
        let server = TestServer::new(router).expect("Failed to create test server");

        Self { server, state }
    }
}
