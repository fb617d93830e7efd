//! Application-facing instance lookup

use crate::{
    cache::SnapshotStore, error::Result, models::ServiceInstance, strategy::ProviderStrategy,
};
use std::sync::Arc;

/// Immutable point-in-time list of a service's instances
pub type Snapshot = Arc<[ServiceInstance]>;

/// Lookup of live instances for one service
pub trait ServiceProvider: Send + Sync {
    /// Service name the provider is bound to
    fn name(&self) -> &str;

    /// Current snapshot; empty when the service is unknown or has no instances
    fn get_all_instances(&self) -> Snapshot;

    /// One instance chosen by the provider's strategy
    fn get_instance(&self) -> Result<ServiceInstance>;
}

/// Provider reading from an [`InstanceCache`](crate::InstanceCache)
///
/// Providers for the same name share the cache entry, so creating many of
/// them never adds watches.
#[derive(Clone)]
pub struct InstanceProvider {
    name: String,
    snapshots: Arc<SnapshotStore>,
    strategy: Arc<dyn ProviderStrategy>,
}

impl InstanceProvider {
    pub(crate) fn new(
        name: &str,
        snapshots: Arc<SnapshotStore>,
        strategy: Arc<dyn ProviderStrategy>,
    ) -> Self {
        Self {
            name: name.to_string(),
            snapshots,
            strategy,
        }
    }

    /// Same cache entry, different strategy
    pub fn with_strategy(&self, strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self {
            name: self.name.clone(),
            snapshots: self.snapshots.clone(),
            strategy,
        }
    }
}

impl std::fmt::Debug for InstanceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceProvider")
            .field("name", &self.name)
            .finish()
    }
}

impl ServiceProvider for InstanceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_all_instances(&self) -> Snapshot {
        self.snapshots.get(&self.name)
    }

    fn get_instance(&self) -> Result<ServiceInstance> {
        self.strategy.get_instance(self)
    }
}
