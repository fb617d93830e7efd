//! Coordination service boundary
//!
//! Discovery only consumes a small capability set from the hierarchical,
//! watch-capable store it runs on: node create/delete/read, one-shot children
//! watches and connection-state notifications. [`Coordinator`] captures that
//! set so that any client (ZooKeeper, etcd with a tree shim, the bundled
//! in-memory tree) can back a [`ServiceDiscovery`](crate::ServiceDiscovery).

pub mod memory;

use crate::models::RegistrationKind;
use async_trait::async_trait;
use thiserror::Error;

/// Lifetime of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session
    Durable,
    /// Removed when the creating session ends
    Ephemeral,
}

impl From<RegistrationKind> for CreateMode {
    fn from(kind: RegistrationKind) -> Self {
        match kind {
            RegistrationKind::Durable => CreateMode::Durable,
            RegistrationKind::Ephemeral => CreateMode::Ephemeral,
        }
    }
}

/// Notification delivered to a one-shot watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The children of the watched node changed
    ChildrenChanged(String),
    /// The watched node was deleted
    NodeDeleted(String),
    /// The watch was dropped by the service (e.g. session expiry)
    NotWatching(String),
}

impl WatchEvent {
    /// Path the event refers to
    pub fn path(&self) -> &str {
        match self {
            Self::ChildrenChanged(p) | Self::NodeDeleted(p) | Self::NotWatching(p) => p,
        }
    }
}

/// One-shot watch callback, invoked at most once from the client's context
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

/// Connection-state callback, invoked with `true` on connect and `false` on loss
pub type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;

/// Errors reported by the coordination service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The node does not exist
    #[error("Node does not exist: {0}")]
    NoNode(String),

    /// The node already exists
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// The node still has children
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// The client is not connected
    #[error("Connection lost")]
    ConnectionLoss,

    /// Any other client failure
    #[error("{0}")]
    Other(String),
}

impl CoordinatorError {
    /// Whether the error reports a missing node
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoNode(_))
    }
}

/// Result type for coordination calls
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// Capabilities discovery needs from the coordination service
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create `path` and all of its ancestors as durable nodes if missing
    async fn ensure_path(&self, path: &str) -> CoordinatorResult<()>;

    /// Create a node holding `data`
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> CoordinatorResult<()>;

    /// Delete a childless node
    async fn delete(&self, path: &str) -> CoordinatorResult<()>;

    /// List child names, arming `watcher` for the next change of the set
    async fn get_children(&self, path: &str, watcher: Watcher) -> CoordinatorResult<Vec<String>>;

    /// Read node data
    async fn get_data(&self, path: &str) -> CoordinatorResult<Vec<u8>>;

    /// Subscribe to connection-state changes
    fn add_connection_listener(&self, listener: ConnectionListener);
}

/// Join path segments into an absolute, slash-normalized tree path
pub fn join_path(base: &str, segment: &str) -> String {
    let mut path = String::from("/");
    for part in base.split('/').chain(segment.split('/')) {
        if part.is_empty() {
            continue;
        }
        if path.len() > 1 {
            path.push('/');
        }
        path.push_str(part);
    }
    path
}
