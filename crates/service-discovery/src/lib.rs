//! Runtime-agnostic service discovery over a hierarchical coordination service
//!
//! Processes advertise themselves by writing instance records under
//! `base/service/instance-id`, and observe live instances of any service
//! through watch-maintained snapshots.
//!
//! # Architecture
//!
//! - [`ServiceDiscovery`] registers instances and re-registers them after a
//!   reconnect, since ephemeral nodes do not survive session loss.
//! - [`InstanceCache`] arms one-shot children watches and keeps per-service
//!   snapshots current.
//! - [`InstanceProvider`] hands out instances through a pluggable
//!   [`ProviderStrategy`].
//!
//! The coordination service sits behind the [`Coordinator`] trait. Background
//! loops are returned as futures, so the caller chooses the executor.
//!
//! # Example
//!
//! ```no_run
//! use service_discovery::{
//!     DiscoveryConfig, MemoryCoordinator, ServiceDiscovery, ServiceInstance, ServiceProvider,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let coordinator = Arc::new(MemoryCoordinator::new());
//! let discovery = Arc::new(ServiceDiscovery::new(coordinator, &DiscoveryConfig::default()));
//!
//! // Keep registrations alive across reconnects
//! smol::spawn(discovery.maintain_registrations()).detach();
//!
//! let instance = ServiceInstance::builder("api")
//!     .address("10.0.0.1")
//!     .port(8080)
//!     .build()?;
//! discovery.register(instance).await?;
//!
//! // Watch the tree and look instances up
//! let (cache, refresh) = discovery.watch().await?;
//! smol::spawn(refresh).detach();
//!
//! let provider = cache.provider("api").await;
//! let chosen = provider.get_instance()?;
//! println!("talking to {}", chosen.spec());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
mod mailbox;
pub mod models;
pub mod paths;
pub mod provider;
mod runtime;
pub mod serializer;
pub mod strategy;

pub use cache::{InstanceCache, WatchState};
pub use config::DiscoveryConfig;
pub use coordinator::memory::MemoryCoordinator;
pub use coordinator::{
    ConnectionListener, Coordinator, CoordinatorError, CoordinatorResult, CreateMode, WatchEvent,
    Watcher,
};
pub use discovery::ServiceDiscovery;
pub use error::{Error, Result};
pub use models::{RegistrationKind, ServiceInstance, ServiceInstanceBuilder};
pub use paths::ServicePaths;
pub use provider::{InstanceProvider, ServiceProvider, Snapshot};
pub use serializer::{InstanceSerializer, JsonInstanceSerializer};
pub use strategy::{ProviderStrategy, RandomStrategy, RoundRobinStrategy};

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        Coordinator, DiscoveryConfig, Error, InstanceCache, InstanceProvider, ProviderStrategy,
        RegistrationKind, Result, ServiceDiscovery, ServiceInstance, ServiceProvider,
    };
}
