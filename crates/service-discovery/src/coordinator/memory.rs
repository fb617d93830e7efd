//! In-memory coordination tree
//!
//! A single-process stand-in for a ZooKeeper-style service: durable and
//! ephemeral nodes, per-session ephemeral ownership, one-shot children
//! watches and connection-state listeners. Test hooks simulate connection
//! loss, session expiry and corrupted node data.

use super::{
    ConnectionListener, Coordinator, CoordinatorError, CoordinatorResult, CreateMode, WatchEvent,
    Watcher,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Fired = Vec<(Watcher, WatchEvent)>;

struct Node {
    data: Vec<u8>,
    /// Session owning an ephemeral node
    owner: Option<u64>,
    /// Child names in creation order
    children: Vec<String>,
}

struct Tree {
    nodes: HashMap<String, Node>,
    child_watches: HashMap<String, Vec<Watcher>>,
    connected: bool,
    session: u64,
    failing_creates: u32,
    create_calls: u64,
}

/// In-memory coordination backend
pub struct MemoryCoordinator {
    tree: Mutex<Tree>,
    listeners: Mutex<Vec<Arc<dyn Fn(bool) + Send + Sync>>>,
}

impl MemoryCoordinator {
    /// Create a connected, empty tree
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
                children: Vec::new(),
            },
        );

        Self {
            tree: Mutex::new(Tree {
                nodes,
                child_watches: HashMap::new(),
                connected: true,
                session: 1,
                failing_creates: 0,
                create_calls: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, connected: bool) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(connected);
        }
    }

    /// Mark the client connected and notify listeners
    pub fn connect(&self) {
        self.tree().connected = true;
        debug!("Memory coordinator connected");
        self.notify(true);
    }

    /// Mark the client disconnected and notify listeners
    pub fn disconnect(&self) {
        self.tree().connected = false;
        debug!("Memory coordinator disconnected");
        self.notify(false);
    }

    /// End the current session: drop its ephemeral nodes and all armed watches
    pub fn expire_session(&self) {
        let fired = {
            let mut tree = self.tree();
            let session = tree.session;
            let mut expired: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, node)| node.owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            // Deepest first so parents are never removed before their children
            expired.sort_by_key(|p| std::cmp::Reverse(p.len()));

            let mut fired = Vec::new();
            for path in expired {
                fired.extend(tree.remove(&path));
            }
            for (path, watchers) in tree.child_watches.drain() {
                for watcher in watchers {
                    fired.push((watcher, WatchEvent::NotWatching(path.clone())));
                }
            }
            tree.session += 1;
            debug!("Memory coordinator session {} expired", session);
            fired
        };
        fire(fired);
    }

    /// Overwrite node data without firing watches
    pub fn set_data(&self, path: &str, data: &[u8]) -> CoordinatorResult<()> {
        let mut tree = self.tree();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        Ok(())
    }

    /// Fail the next `count` create calls with a connection loss
    pub fn fail_next_creates(&self, count: u32) {
        self.tree().failing_creates = count;
    }

    /// Whether a node exists
    pub fn exists(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(path)
    }

    /// Data held by a node
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree().nodes.get(path).map(|n| n.data.clone())
    }

    /// Child names of a node
    pub fn children(&self, path: &str) -> Option<Vec<String>> {
        self.tree().nodes.get(path).map(|n| n.children.clone())
    }

    /// Number of create calls received, including failed ones
    pub fn create_calls(&self) -> u64 {
        self.tree().create_calls
    }

    /// Current session id
    pub fn session_id(&self) -> u64 {
        self.tree().session
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    fn check_connected(&self) -> CoordinatorResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CoordinatorError::ConnectionLoss)
        }
    }

    fn insert(&mut self, path: &str, data: &[u8], owner: Option<u64>) -> Fired {
        let (parent, name) = split_path(path);
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                owner,
                children: Vec::new(),
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.push(name.to_string());
        }
        self.take_watches(parent, WatchEvent::ChildrenChanged(parent.to_string()))
    }

    fn create_ancestors(&mut self, path: &str) -> Fired {
        let mut fired = Vec::new();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if !self.nodes.contains_key(&current) {
                fired.extend(self.insert(&current, &[], None));
            }
        }
        fired
    }

    fn remove(&mut self, path: &str) -> Fired {
        self.nodes.remove(path);
        let (parent, name) = split_path(path);
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.retain(|c| c != name);
        }
        let mut fired = self.take_watches(parent, WatchEvent::ChildrenChanged(parent.to_string()));
        fired.extend(self.take_watches(path, WatchEvent::NodeDeleted(path.to_string())));
        fired
    }

    fn take_watches(&mut self, path: &str, event: WatchEvent) -> Fired {
        self.child_watches
            .remove(path)
            .unwrap_or_default()
            .into_iter()
            .map(|w| (w, event.clone()))
            .collect()
    }
}

/// Split `/a/b/c` into (`/a/b`, `c`)
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", path),
    }
}

/// Invoke watchers outside of the tree lock
fn fire(fired: Fired) {
    for (watcher, event) in fired {
        watcher(event);
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn ensure_path(&self, path: &str) -> CoordinatorResult<()> {
        let fired = {
            let mut tree = self.tree();
            tree.check_connected()?;
            tree.create_ancestors(path)
        };
        fire(fired);
        Ok(())
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        create_parents: bool,
    ) -> CoordinatorResult<()> {
        let fired = {
            let mut tree = self.tree();
            tree.create_calls += 1;
            tree.check_connected()?;
            if tree.failing_creates > 0 {
                tree.failing_creates -= 1;
                return Err(CoordinatorError::ConnectionLoss);
            }
            if tree.nodes.contains_key(path) {
                return Err(CoordinatorError::NodeExists(path.to_string()));
            }

            let mut fired = Vec::new();
            let (parent, _) = split_path(path);
            if !tree.nodes.contains_key(parent) {
                if !create_parents {
                    return Err(CoordinatorError::NoNode(parent.to_string()));
                }
                fired.extend(tree.create_ancestors(parent));
            }

            let owner = match mode {
                CreateMode::Durable => None,
                CreateMode::Ephemeral => Some(tree.session),
            };
            fired.extend(tree.insert(path, data, owner));
            fired
        };
        fire(fired);
        Ok(())
    }

    async fn delete(&self, path: &str) -> CoordinatorResult<()> {
        let fired = {
            let mut tree = self.tree();
            tree.check_connected()?;
            let has_children = match tree.nodes.get(path) {
                None => return Err(CoordinatorError::NoNode(path.to_string())),
                Some(node) => !node.children.is_empty(),
            };
            if has_children {
                return Err(CoordinatorError::NotEmpty(path.to_string()));
            }
            tree.remove(path)
        };
        fire(fired);
        Ok(())
    }

    async fn get_children(&self, path: &str, watcher: Watcher) -> CoordinatorResult<Vec<String>> {
        let mut tree = self.tree();
        tree.check_connected()?;
        let children = tree
            .nodes
            .get(path)
            .map(|n| n.children.clone())
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))?;
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push(watcher);
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> CoordinatorResult<Vec<u8>> {
        let tree = self.tree();
        tree.check_connected()?;
        tree.nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordinatorError::NoNode(path.to_string()))
    }

    fn add_connection_listener(&self, listener: ConnectionListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(listener));
    }
}
