//! Watch-driven instance cache
//!
//! Each watched service goes through a read-and-arm cycle: list the children
//! of its node while arming a one-shot watch, then reconcile the child ids
//! against the records already known. When the watch fires, the service name
//! lands in a coalescing mailbox and the single refresh loop repeats the cycle,
//! which also arms the next watch:
//!
//! ```text
//! Unarmed --read--> Armed --change--> Firing --refresh--> Armed
//!    ^                                  |
//!    +-------------- read failed -------+
//! ```
//!
//! Snapshots are published as whole immutable lists, so readers never see a
//! partially reconciled service.

use crate::{
    coordinator::{Coordinator, WatchEvent, Watcher},
    discovery::ServiceDiscovery,
    error::Result,
    mailbox::Mailbox,
    models::ServiceInstance,
    paths::ServicePaths,
    provider::{InstanceProvider, Snapshot},
    serializer::InstanceSerializer,
    strategy::{ProviderStrategy, RandomStrategy},
};
use futures::future::BoxFuture;
use futures::lock::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle of the one-shot children watch for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No watch is armed; the last read failed
    Unarmed,
    /// A watch is armed and waiting for a change
    Armed,
    /// The watch fired and a refresh is pending
    Firing,
}

/// Published per-service snapshots
#[derive(Default)]
pub(crate) struct SnapshotStore {
    services: RwLock<HashMap<String, Snapshot>>,
}

impl SnapshotStore {
    /// Current snapshot, empty if the service is unknown
    pub(crate) fn get(&self, name: &str) -> Snapshot {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    fn contains(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn publish(&self, name: &str, instances: Vec<ServiceInstance>) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::from(instances));
    }

    /// Drop snapshots whose name fails `keep`, returning the dropped names
    fn retain(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let removed: Vec<String> = services.keys().filter(|n| !keep(n)).cloned().collect();
        for name in &removed {
            services.remove(name);
        }
        removed
    }

    fn names(&self) -> Vec<String> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

type WatchStates = Arc<std::sync::Mutex<HashMap<String, WatchState>>>;

/// Start tracking `service` in `state`
fn set_watch_state(states: &WatchStates, service: &str, state: WatchState) {
    states
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(service.to_string(), state);
}

/// Move a tracked service to `state`; untracked services stay untracked
fn update_watch_state(states: &WatchStates, service: &str, state: WatchState) {
    if let Some(current) = states
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(service)
    {
        *current = state;
    }
}

/// Lazily populated, watch-maintained cache of service instances
pub struct InstanceCache {
    coordinator: Arc<dyn Coordinator>,
    paths: ServicePaths,
    serializer: Arc<dyn InstanceSerializer>,
    snapshots: Arc<SnapshotStore>,
    /// Records already fetched, by service then instance id
    existing: Mutex<HashMap<String, HashMap<String, ServiceInstance>>>,
    watches: WatchStates,
    instance_changes: Arc<Mailbox<String>>,
    service_changes: Arc<Mailbox<()>>,
}

impl InstanceCache {
    /// Create a cache sharing the coordinator, layout and serializer of `discovery`
    pub fn new(discovery: &ServiceDiscovery) -> Self {
        Self {
            coordinator: discovery.coordinator().clone(),
            paths: discovery.paths().clone(),
            serializer: discovery.serializer().clone(),
            snapshots: Arc::new(SnapshotStore::default()),
            existing: Mutex::new(HashMap::new()),
            watches: Arc::new(std::sync::Mutex::new(HashMap::new())),
            instance_changes: Arc::new(Mailbox::per_key()),
            service_changes: Arc::new(Mailbox::latest()),
        }
    }

    /// Return the refresh loop.
    ///
    /// The loop re-reads every service whose watch fired and runs until
    /// [`close`](Self::close). Watched services are also refreshed after each
    /// reconnect, since watches do not outlive an expired session.
    pub fn start(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let changes = self.instance_changes.clone();
        let watches = self.watches.clone();
        self.coordinator
            .add_connection_listener(Box::new(move |connected| {
                if !connected {
                    return;
                }
                let watched: Vec<String> = watches
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect();
                for service in watched {
                    changes.post(service);
                }
            }));

        let this = self.clone();
        Box::pin(async move { this.process_instance_changes().await })
    }

    async fn process_instance_changes(&self) {
        while let Some(service) = self.instance_changes.recv().await {
            if self.watch_state(&service).is_none() {
                debug!("Ignoring change to {}: no longer watched", service);
                continue;
            }
            self.read_and_watch(&service, "restarting").await;
        }
        info!("Done watching for instance changes");
    }

    /// Start watching `service` unless a snapshot already exists.
    ///
    /// Nothing is written to the tree. If the service node does not exist yet,
    /// the base path is watched instead and the service is read once it appears.
    pub async fn watch_service(&self, service: &str) {
        if self.snapshots.contains(service) {
            return;
        }
        set_watch_state(&self.watches, service, WatchState::Armed);
        self.read_and_watch(service, "watch").await;
    }

    fn watcher_for(&self, service: &str) -> Watcher {
        let changes = self.instance_changes.clone();
        let watches = self.watches.clone();
        let service = service.to_string();
        Box::new(move |event: WatchEvent| {
            debug!("Watch fired for {}: {:?}", service, event);
            update_watch_state(&watches, &service, WatchState::Firing);
            if !changes.post(service.clone()) {
                debug!("Ignoring change to {}: cache closed", service);
            }
        })
    }

    /// Read-and-arm cycle for a tracked service
    async fn read_and_watch(&self, service: &str, verb: &str) {
        let path = self.paths.for_name(service);
        update_watch_state(&self.watches, service, WatchState::Armed);

        match self
            .coordinator
            .get_children(&path, self.watcher_for(service))
            .await
        {
            Ok(children) => self.read_instance_list(service, children).await,
            Err(e) if e.is_not_found() => self.watch_for_creation(service).await,
            Err(e) => {
                update_watch_state(&self.watches, service, WatchState::Unarmed);
                warn!("Error {} watch for {}: {}", verb, service, e);
            }
        }
    }

    /// Arm a base-path watch that re-reads `service` once its node exists
    async fn watch_for_creation(&self, service: &str) {
        match self
            .coordinator
            .get_children(self.paths.base(), self.watcher_for(service))
            .await
        {
            Ok(services) if services.iter().any(|s| s == service) => {
                // Created between the two reads
                self.instance_changes.post(service.to_string());
            }
            Ok(_) => debug!("Waiting for {} to be registered", service),
            Err(e) => {
                update_watch_state(&self.watches, service, WatchState::Unarmed);
                warn!("Error watching for creation of {}: {}", service, e);
            }
        }
    }

    /// Reconcile fresh child ids against known records and publish the result
    async fn read_instance_list(&self, service: &str, children: Vec<String>) {
        let mut existing = self.existing.lock().await;
        let known = existing.entry(service.to_string()).or_default();

        let mut instances = Vec::with_capacity(children.len());
        for id in children {
            if let Some(instance) = known.get(&id) {
                instances.push(instance.clone());
                continue;
            }

            let path = self.paths.for_instance(service, &id);
            let data = match self.coordinator.get_data(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        "Error fetching instance info for {}-{} ({}): {}",
                        service, id, path, e
                    );
                    continue;
                }
            };

            let mut instance = match self.serializer.deserialize(&data) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(
                        "Error decoding instance info for {}-{} ({}): {}",
                        service, id, path, e
                    );
                    continue;
                }
            };
            // The tree path is the cache key, so it wins over the payload
            instance.id = id.clone();

            known.insert(id, instance.clone());
            instances.push(instance);
        }

        debug!("Publishing {} instances of {}", instances.len(), service);
        self.snapshots.publish(service, instances);
    }

    /// Watch the base path and follow every service that appears under it.
    ///
    /// Services that disappear from the base path lose their snapshot. The
    /// returned loop runs until [`close`](Self::close).
    pub async fn watch_all_services(self: &Arc<Self>) -> Result<BoxFuture<'static, ()>> {
        self.coordinator.ensure_path(self.paths.base()).await?;

        let mut watching = HashSet::new();
        self.read_services(&mut watching).await;

        let this = self.clone();
        Ok(Box::pin(async move {
            while this.service_changes.recv().await.is_some() {
                this.read_services(&mut watching).await;
            }
            info!("Done watching for service changes");
        }))
    }

    async fn read_services(&self, watching: &mut HashSet<String>) {
        let changes = self.service_changes.clone();
        let watcher: Watcher = Box::new(move |_| {
            changes.post(());
        });

        let children = match self
            .coordinator
            .get_children(self.paths.base(), watcher)
            .await
        {
            Ok(children) => children,
            Err(e) => {
                warn!("Error reading service list: {}", e);
                return;
            }
        };

        let found: HashSet<String> = children.into_iter().collect();
        for service in &found {
            if watching.insert(service.clone()) {
                set_watch_state(&self.watches, service, WatchState::Armed);
                self.read_and_watch(service, "starting").await;
            }
        }

        watching.retain(|s| found.contains(s));
        let removed = self.snapshots.retain(|s| found.contains(s));
        if !removed.is_empty() {
            let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            for service in &removed {
                watches.remove(service);
            }
            info!("Services removed: {:?}", removed);
        }
    }

    /// Provider for `name` using uniform random selection
    pub async fn provider(&self, name: &str) -> InstanceProvider {
        self.provider_with_strategy(name, Arc::new(RandomStrategy::new()))
            .await
    }

    /// Provider for `name` using `strategy`; starts watching `name` if needed
    pub async fn provider_with_strategy(
        &self,
        name: &str,
        strategy: Arc<dyn ProviderStrategy>,
    ) -> InstanceProvider {
        self.watch_service(name).await;
        InstanceProvider::new(name, self.snapshots.clone(), strategy)
    }

    /// Current snapshot for `name`
    pub fn instances(&self, name: &str) -> Snapshot {
        self.snapshots.get(name)
    }

    /// Services that currently have a snapshot
    pub fn watched_services(&self) -> Vec<String> {
        let mut names = self.snapshots.names();
        names.sort();
        names
    }

    /// Watch state for `name`, if it was ever watched
    pub fn watch_state(&self, name: &str) -> Option<WatchState> {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Number of records remembered for `name`, including departed instances
    pub async fn known_instance_count(&self, name: &str) -> usize {
        self.existing
            .lock()
            .await
            .get(name)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Stop both refresh loops once pending notifications are processed
    pub fn close(&self) {
        self.instance_changes.close();
        self.service_changes.close();
    }
}
