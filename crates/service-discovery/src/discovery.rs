//! Registration manager
//!
//! [`ServiceDiscovery`] owns the instances this process advertises. Every
//! successful [`register`](ServiceDiscovery::register) is remembered in the
//! owned-registration set, which is the source of truth for what should exist
//! in the tree. Ephemeral nodes vanish with the session, so the recovery loop
//! returned by [`maintain_registrations`](ServiceDiscovery::maintain_registrations)
//! replays the whole set after every reconnect.

use crate::{
    cache::InstanceCache,
    config::DiscoveryConfig,
    coordinator::{Coordinator, CoordinatorError, CreateMode},
    error::Result,
    mailbox::Mailbox,
    models::ServiceInstance,
    paths::ServicePaths,
    runtime,
    serializer::{InstanceSerializer, JsonInstanceSerializer},
};
use futures::future::BoxFuture;
use futures::lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Connection state as seen by the recovery loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionChange {
    connected: bool,
    /// Disconnects observed so far; a coalesced flap still shows up here
    disconnects: u64,
}

/// Connection-state hand-off shared with the coordinator's listener
struct ConnectionSignal {
    changes: Mailbox<ConnectionChange>,
    disconnects: AtomicU64,
}

impl ConnectionSignal {
    fn post(&self, connected: bool) {
        let disconnects = if connected {
            self.disconnects.load(Ordering::SeqCst)
        } else {
            self.disconnects.fetch_add(1, Ordering::SeqCst) + 1
        };
        if !self.changes.post(ConnectionChange {
            connected,
            disconnects,
        }) {
            debug!("Dropping connection state {}: recovery loop closed", connected);
        }
    }
}

/// Registers service instances and keeps them registered across reconnects
pub struct ServiceDiscovery {
    coordinator: Arc<dyn Coordinator>,
    paths: ServicePaths,
    serializer: Arc<dyn InstanceSerializer>,
    /// Owned registrations keyed by instance id
    maintain: Mutex<HashMap<String, ServiceInstance>>,
    conn_changes: Arc<ConnectionSignal>,
    connected_at_least_once: AtomicBool,
    register_attempts: u32,
    reconnect_grace: Duration,
}

impl ServiceDiscovery {
    /// Create a registration manager on top of `coordinator`
    pub fn new(coordinator: Arc<dyn Coordinator>, config: &DiscoveryConfig) -> Self {
        Self {
            coordinator,
            paths: ServicePaths::new(&config.base_path),
            serializer: Arc::new(JsonInstanceSerializer),
            maintain: Mutex::new(HashMap::new()),
            conn_changes: Arc::new(ConnectionSignal {
                changes: Mailbox::latest(),
                disconnects: AtomicU64::new(0),
            }),
            connected_at_least_once: AtomicBool::new(false),
            register_attempts: config.register_attempts.max(1),
            reconnect_grace: config.reconnect_grace(),
        }
    }

    /// Replace the default JSON serializer
    pub fn with_serializer(mut self, serializer: Arc<dyn InstanceSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Tree layout used for registrations
    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    /// Underlying coordination client
    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Serializer used for instance records
    pub fn serializer(&self) -> &Arc<dyn InstanceSerializer> {
        &self.serializer
    }

    /// Whether a connected state has ever been processed by the recovery loop
    pub fn has_connected(&self) -> bool {
        self.connected_at_least_once.load(Ordering::SeqCst)
    }

    /// Subscribe to connection changes and return the recovery loop.
    ///
    /// The returned future runs until [`close`](Self::close) is called; the
    /// caller decides which executor drives it.
    pub fn maintain_registrations(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let changes = self.conn_changes.clone();
        self.coordinator
            .add_connection_listener(Box::new(move |connected| changes.post(connected)));

        let this = self.clone();
        Box::pin(async move { this.maintain_conn().await })
    }

    /// Hand a connection-state change to the recovery loop. Never blocks.
    pub fn state_changed(&self, connected: bool) {
        self.conn_changes.post(connected);
    }

    async fn maintain_conn(&self) {
        let mut prev = false;
        let mut prev_disconnects = 0;
        while let Some(change) = self.conn_changes.changes.recv().await {
            let reconnected =
                change.connected && (!prev || change.disconnects != prev_disconnects);
            if reconnected {
                if self.has_connected() {
                    debug!(
                        "Waiting {:?} for stale sessions to clear before re-registering",
                        self.reconnect_grace
                    );
                    runtime::sleep(self.reconnect_grace).await;
                }
                info!("Reconnected. Re-registering services.");
                match self.reregister_all().await {
                    Ok(()) => info!("Re-registered all services"),
                    Err(e) => error!("Failed to re-register services: {}", e),
                }
                self.connected_at_least_once.store(true, Ordering::SeqCst);
            }
            prev = change.connected;
            prev_disconnects = change.disconnects;
        }
        info!("Done watching for connection changes");
    }

    /// Advertise an instance and remember it for re-registration
    pub async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let mut maintain = self.maintain.lock().await;
        self.register_locked(&mut maintain, instance).await
    }

    async fn register_locked(
        &self,
        maintain: &mut HashMap<String, ServiceInstance>,
        instance: ServiceInstance,
    ) -> Result<()> {
        let data = self.serializer.serialize(&instance)?;
        let path = self.paths.for_instance(&instance.name, &instance.id);
        let mode = CreateMode::from(instance.kind);

        let mut last_err = CoordinatorError::Other("no create attempted".to_string());
        for attempt in 1..=self.register_attempts {
            debug!(
                "Creating {} registration {} (attempt {}): {}",
                instance.name,
                instance.spec(),
                attempt,
                path
            );
            match self.coordinator.create(&path, &data, mode, true).await {
                Ok(()) => {
                    info!("Registered {} instance {} at {}", instance.name, instance.id, path);
                    maintain.insert(instance.id.clone(), instance);
                    return Ok(());
                }
                Err(CoordinatorError::NodeExists(existing)) => {
                    match self.coordinator.get_data(&path).await {
                        Ok(current) if current == data => {
                            // Live node with our record; leave it in place
                            debug!("Registration node {} already holds this record", existing);
                            maintain.insert(instance.id.clone(), instance);
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {
                            last_err = CoordinatorError::NodeExists(existing);
                            continue;
                        }
                        Err(e) => {
                            last_err = e;
                            continue;
                        }
                    }

                    // A different record is stored there; replace it with ours
                    debug!("Replacing existing registration node {}", existing);
                    match self.coordinator.delete(&path).await {
                        Ok(()) => last_err = CoordinatorError::NodeExists(existing),
                        Err(e) if e.is_not_found() => {
                            last_err = CoordinatorError::NodeExists(existing)
                        }
                        Err(e) => last_err = e,
                    }
                }
                Err(e) => {
                    debug!("Create of {} failed: {}", path, e);
                    last_err = e;
                }
            }
        }

        Err(last_err.into())
    }

    /// Forget an instance and delete its node.
    ///
    /// The in-memory removal is kept even when the delete fails.
    pub async fn unregister(&self, instance: &ServiceInstance) -> Result<()> {
        let mut maintain = self.maintain.lock().await;
        self.unregister_locked(&mut maintain, instance).await
    }

    async fn unregister_locked(
        &self,
        maintain: &mut HashMap<String, ServiceInstance>,
        instance: &ServiceInstance,
    ) -> Result<()> {
        let path = self.paths.for_instance(&instance.name, &instance.id);
        maintain.remove(&instance.id);

        info!(
            "Deleting {} registration {}: {}",
            instance.name,
            instance.spec(),
            path
        );
        self.coordinator.delete(&path).await?;
        Ok(())
    }

    /// Recreate every owned registration, stopping at the first failure
    pub async fn reregister_all(&self) -> Result<()> {
        let mut maintain = self.maintain.lock().await;
        let owned: Vec<ServiceInstance> = maintain.values().cloned().collect();
        for instance in owned {
            self.register_locked(&mut maintain, instance).await?;
        }
        Ok(())
    }

    /// Remove every owned registration, stopping at the first failure
    pub async fn unregister_all(&self) -> Result<()> {
        let mut maintain = self.maintain.lock().await;
        let owned: Vec<ServiceInstance> = maintain.values().cloned().collect();
        for instance in owned {
            self.unregister_locked(&mut maintain, &instance).await?;
        }
        Ok(())
    }

    /// Snapshot of the owned-registration set
    pub async fn owned_instances(&self) -> Vec<ServiceInstance> {
        self.maintain.lock().await.values().cloned().collect()
    }

    /// Ensure the base path exists and build an instance cache with its refresh loop
    pub async fn watch(&self) -> Result<(Arc<InstanceCache>, BoxFuture<'static, ()>)> {
        self.coordinator.ensure_path(self.paths.base()).await?;
        let cache = Arc::new(InstanceCache::new(self));
        let refresh = cache.start();
        Ok((cache, refresh))
    }

    /// Stop the recovery loop once pending state changes are processed
    pub fn close(&self) {
        self.conn_changes.changes.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::memory::MemoryCoordinator;
    use crate::models::RegistrationKind;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<MemoryCoordinator>, ServiceDiscovery) {
        let tree = Arc::new(MemoryCoordinator::new());
        let discovery = ServiceDiscovery::new(tree.clone(), &DiscoveryConfig::default());
        (tree, discovery)
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::builder("api")
            .id(id)
            .address("10.0.0.1")
            .port(8080)
            .build()
            .unwrap()
    }

    #[smol_potat::test]
    async fn test_register_creates_node() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();

        let data = tree.data("/services/api/1").unwrap();
        let stored = discovery.serializer().deserialize(&data).unwrap();
        assert_eq!(stored, instance_with_time("1", &stored));
        assert_eq!(discovery.owned_instances().await.len(), 1);
    }

    fn instance_with_time(id: &str, like: &ServiceInstance) -> ServiceInstance {
        let mut expected = instance(id);
        expected.registration_time_utc = like.registration_time_utc;
        expected
    }

    #[smol_potat::test]
    async fn test_register_retries_three_times() {
        let (tree, discovery) = setup();

        tree.fail_next_creates(2);
        discovery.register(instance("1")).await.unwrap();
        assert_eq!(tree.create_calls(), 3);

        tree.fail_next_creates(3);
        let err = discovery.register(instance("2")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Coordinator(CoordinatorError::ConnectionLoss)
        ));
        assert_eq!(tree.create_calls(), 6);
        assert_eq!(discovery.owned_instances().await.len(), 1);
    }

    #[smol_potat::test]
    async fn test_register_twice_keeps_one_node() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();

        let updated = ServiceInstance::builder("api")
            .id("1")
            .address("10.0.0.2")
            .port(9090)
            .build()
            .unwrap();
        discovery.register(updated).await.unwrap();

        assert_eq!(tree.children("/services/api").unwrap(), vec!["1"]);
        let stored = discovery
            .serializer()
            .deserialize(&tree.data("/services/api/1").unwrap())
            .unwrap();
        assert_eq!(stored.spec(), "10.0.0.2:9090");
        assert_eq!(discovery.owned_instances().await.len(), 1);
    }

    #[smol_potat::test]
    async fn test_reregister_keeps_live_nodes() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tree.get_children(
            "/services/api",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        let creates = tree.create_calls();

        // Same session, nodes still alive
        discovery.reregister_all().await.unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(tree.create_calls(), creates + 1);
        assert_eq!(tree.children("/services/api").unwrap(), vec!["1"]);
        assert_eq!(discovery.owned_instances().await.len(), 1);
    }

    #[smol_potat::test]
    async fn test_unregister_all_stops_at_first_error() {
        let (tree, discovery) = setup();
        for id in ["1", "2", "3"] {
            discovery.register(instance(id)).await.unwrap();
        }

        tree.disconnect();
        assert!(discovery.unregister_all().await.is_err());
        // Only the failed entry left the owned set; the rest were never attempted
        assert_eq!(discovery.owned_instances().await.len(), 2);

        tree.connect();
        assert_eq!(tree.children("/services/api").unwrap().len(), 3);
    }

    #[smol_potat::test]
    async fn test_durable_registration_survives_expiry() {
        let (tree, discovery) = setup();
        let durable = ServiceInstance::builder("db")
            .id("primary")
            .kind(RegistrationKind::Durable)
            .build()
            .unwrap();
        discovery.register(durable).await.unwrap();
        discovery.register(instance("1")).await.unwrap();

        tree.expire_session();

        assert!(tree.exists("/services/db/primary"));
        assert!(!tree.exists("/services/api/1"));
    }

    #[smol_potat::test]
    async fn test_unregister_missing_is_not_found() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();

        discovery.unregister(&instance("1")).await.unwrap();
        assert!(!tree.exists("/services/api/1"));

        let err = discovery.unregister(&instance("1")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(discovery.owned_instances().await.is_empty());
    }

    #[smol_potat::test]
    async fn test_unregister_keeps_removal_on_delete_failure() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();

        tree.disconnect();
        assert!(discovery.unregister(&instance("1")).await.is_err());
        assert!(discovery.owned_instances().await.is_empty());
    }

    #[smol_potat::test]
    async fn test_reregister_and_unregister_all() {
        let (tree, discovery) = setup();
        for id in ["1", "2", "3"] {
            discovery.register(instance(id)).await.unwrap();
        }

        tree.expire_session();
        assert!(tree.children("/services/api").unwrap().is_empty());

        discovery.reregister_all().await.unwrap();
        assert_eq!(tree.children("/services/api").unwrap().len(), 3);

        discovery.unregister_all().await.unwrap();
        assert!(tree.children("/services/api").unwrap().is_empty());
        assert!(discovery.owned_instances().await.is_empty());
    }

    #[smol_potat::test]
    async fn test_reregister_all_stops_at_first_error() {
        let (tree, discovery) = setup();
        discovery.register(instance("1")).await.unwrap();
        discovery.register(instance("2")).await.unwrap();

        tree.disconnect();
        assert!(discovery.reregister_all().await.is_err());
        assert_eq!(discovery.owned_instances().await.len(), 2);
    }

    #[smol_potat::test]
    async fn test_close_ends_recovery_loop() {
        let (_tree, discovery) = setup();
        let discovery = Arc::new(discovery);
        let recovery = smol::spawn(discovery.maintain_registrations());

        discovery.state_changed(true);
        discovery.close();
        recovery.await;

        assert!(discovery.has_connected());
    }
}
