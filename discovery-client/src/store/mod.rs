//! Coordination store abstraction.
//!
//! The registry talks to a hierarchical store with ephemeral and persistent
//! nodes, one-shot child watches and session semantics. `MemoryStore` keeps the
//! tree in process; `ZooKeeperStore` (feature `zookeeper`) talks to a real
//! ensemble.

pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use crate::error::StoreError;

pub use memory::MemoryStore;
#[cfg(feature = "zookeeper")]
pub use self::zookeeper::ZooKeeperStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Channel on which a session delivers its state and watch events
pub type EventSender = mpsc::UnboundedSender<WatchedEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WatchedEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Removed when the creating session ends
    Ephemeral,
    /// Survives until explicitly deleted
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    SyncConnected,
    Disconnected,
    Expired,
    AuthFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Pure session state change
    None,
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub state: KeeperState,
    pub kind: EventKind,
    pub path: Option<String>,
}

impl WatchedEvent {
    pub fn session(state: KeeperState) -> Self {
        Self {
            state,
            kind: EventKind::None,
            path: None,
        }
    }

    pub fn node(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            state: KeeperState::SyncConnected,
            kind,
            path: Some(path.into()),
        }
    }
}

/// A live session with the coordination store.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> u64;

    /// Lists the children of `path`. With `watch` set, the next change of the
    /// children fires a `NodeChildrenChanged` event on this session.
    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>>;

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String>;

    /// Deletes `path`; `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()>;

    async fn close(&self) -> StoreResult<()>;
}

/// Factory for sessions.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn connect(
        &self,
        session_timeout: Duration,
        events: EventSender,
    ) -> StoreResult<Arc<dyn Session>>;
}

/// Parent of an absolute node path; the root is its own parent.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last element of an absolute node path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("/ness/srvc/a"), "/ness/srvc");
        assert_eq!(parent_path("/ness"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(node_name("/ness/srvc/a"), "a");
        assert_eq!(node_name("/ness"), "ness");
    }
}
