//! Common test utilities for service discovery integration tests

#![allow(dead_code)]

use service_discovery::{DiscoveryConfig, MemoryCoordinator, ServiceDiscovery, ServiceInstance};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for background convergence
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect grace used by tests instead of the production 5 seconds
pub const TEST_GRACE: Duration = Duration::from_millis(100);

/// In-memory tree plus a registration manager on top of it
pub struct TestEnvironment {
    /// Coordination tree
    pub tree: Arc<MemoryCoordinator>,
    /// Registration manager
    pub discovery: Arc<ServiceDiscovery>,
}

impl TestEnvironment {
    /// Fresh environment with the test grace period
    pub fn new() -> Self {
        Self::with_grace(TEST_GRACE)
    }

    /// Fresh environment with a custom reconnect grace period
    pub fn with_grace(grace: Duration) -> Self {
        init_tracing();
        let tree = Arc::new(MemoryCoordinator::new());
        let config = DiscoveryConfig::default().with_reconnect_grace(grace);
        let discovery = Arc::new(ServiceDiscovery::new(tree.clone(), &config));
        Self { tree, discovery }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// An `api` instance with a host/port payload
pub fn api_instance(id: &str, host: &str, port: u16) -> ServiceInstance {
    ServiceInstance::builder("api")
        .id(id)
        .address(host)
        .port(port)
        .payload(json!({"host": host, "port": port}))
        .build()
        .expect("valid instance")
}

/// Poll `condition` until it holds or the test timeout passes
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(10)).await;
    }
    condition()
}

/// Sorted ids of a snapshot
pub fn ids(instances: &[ServiceInstance]) -> Vec<String> {
    let mut ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    ids.sort();
    ids
}
