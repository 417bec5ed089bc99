//! In-process coordination store.
//!
//! Keeps a flat map of absolute paths to nodes. Sessions own their ephemeral
//! nodes; expiring or closing a session drops them and fires the child watches
//! of their parents. Also used as the test backend, so it counts mutating calls
//! and can inject failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use crate::error::{StoreError, StoreErrorCode};
use super::{
    parent_path, CoordinationStore, CreateMode, EventKind, EventSender, KeeperState, Session,
    StoreResult, WatchedEvent,
};

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    GetChildren,
    GetData,
    Exists,
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub connects: usize,
    pub get_children: usize,
    pub get_data: usize,
    pub creates: usize,
    pub deletes: usize,
}

struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

struct SessionEntry {
    events: EventSender,
    connected: bool,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<u64, SessionEntry>,
    /// path -> sessions watching its children
    child_watches: HashMap<String, HashSet<u64>>,
    next_session: u64,
    counters: StoreCounters,
    failures: HashMap<StoreOp, VecDeque<StoreErrorCode>>,
    data_delay: Option<Duration>,
}

impl Inner {
    fn check_session(&self, id: u64, path: &str) -> StoreResult<()> {
        match self.sessions.get(&id) {
            None => Err(StoreError::session_expired(path)),
            Some(entry) if !entry.connected => Err(StoreError::connection_loss(path)),
            Some(_) => Ok(()),
        }
    }

    fn injected(&mut self, op: StoreOp, path: &str) -> StoreResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(code) => Err(StoreError::new(code, path)),
            None => Ok(()),
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|candidate| candidate.as_str() != path && parent_path(candidate) == path)
            .map(|child| super::node_name(child).to_string())
            .collect()
    }

    fn fire_child_watches(&mut self, path: &str) {
        let Some(watchers) = self.child_watches.remove(path) else {
            return;
        };
        for id in watchers {
            if let Some(entry) = self.sessions.get(&id) {
                let _ = entry
                    .events
                    .send(WatchedEvent::node(EventKind::NodeChildrenChanged, path));
            }
        }
    }

    fn remove_ephemerals(&mut self, id: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire_child_watches(parent_path(&path));
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&id);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a persistent node with arbitrary payload, bypassing sessions.
    /// Missing parents are created.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        let mut inner = self.lock();
        let mut prefix = String::new();
        for element in path.split('/').filter(|e| !e.is_empty()) {
            prefix.push('/');
            prefix.push_str(element);
            if !inner.nodes.contains_key(&prefix) {
                inner.nodes.insert(
                    prefix.clone(),
                    Node {
                        data: Vec::new(),
                        ephemeral_owner: None,
                    },
                );
                let parent = parent_path(&prefix).to_string();
                inner.fire_child_watches(&parent);
            }
        }
        if let Some(node) = inner.nodes.get_mut(path) {
            node.data = data;
        }
    }

    /// Removes a node, bypassing sessions.
    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.nodes.remove(path).is_some();
        if removed {
            inner.fire_child_watches(parent_path(path));
        }
        removed
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    pub fn is_ephemeral(&self, path: &str) -> bool {
        self.lock()
            .nodes
            .get(path)
            .is_some_and(|node| node.ephemeral_owner.is_some())
    }

    pub fn counters(&self) -> StoreCounters {
        self.lock().counters
    }

    /// Ids of the live sessions
    pub fn sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Makes the next call of `op` fail with `code`.
    pub fn fail_next(&self, op: StoreOp, code: StoreErrorCode) {
        self.lock().failures.entry(op).or_default().push_back(code);
    }

    /// Delays every data read, e.g. to exceed the read timeout.
    pub fn set_data_delay(&self, delay: Option<Duration>) {
        self.lock().data_delay = delay;
    }

    /// Expires a session: its ephemeral nodes vanish and it receives `Expired`.
    pub fn expire_session(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.remove(&id) {
            let _ = entry.events.send(WatchedEvent::session(KeeperState::Expired));
            inner.remove_ephemerals(id);
        }
    }

    /// Drops the connection of a session without ending it.
    pub fn disconnect_session(&self, id: u64) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.connected = false;
            let _ = entry.events.send(WatchedEvent::session(KeeperState::Disconnected));
        }
    }

    pub fn reconnect_session(&self, id: u64) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.connected = true;
            let _ = entry.events.send(WatchedEvent::session(KeeperState::SyncConnected));
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(
        &self,
        _session_timeout: Duration,
        events: EventSender,
    ) -> StoreResult<Arc<dyn Session>> {
        let mut inner = self.lock();
        inner.counters.connects += 1;
        inner.injected(StoreOp::Connect, "/")?;

        inner.next_session += 1;
        let id = inner.next_session;
        let _ = events.send(WatchedEvent::session(KeeperState::SyncConnected));
        inner.sessions.insert(
            id,
            SessionEntry {
                events,
                connected: true,
            },
        );

        Ok(Arc::new(MemorySession {
            id,
            store: self.clone(),
        }))
    }
}

pub struct MemorySession {
    id: u64,
    store: MemoryStore,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let mut inner = self.store.lock();
        inner.counters.get_children += 1;
        inner.check_session(self.id, path)?;
        inner.injected(StoreOp::GetChildren, path)?;
        if !inner.exists(path) {
            return Err(StoreError::no_node(path));
        }
        if watch {
            inner
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.id);
        }
        Ok(inner.children(path))
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        let delay = {
            let mut inner = self.store.lock();
            inner.counters.get_data += 1;
            inner.check_session(self.id, path)?;
            inner.injected(StoreOp::GetData, path)?;
            inner.data_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.store.lock();
        inner
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::no_node(path))
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let mut inner = self.store.lock();
        inner.check_session(self.id, path)?;
        inner.injected(StoreOp::Exists, path)?;
        Ok(inner.exists(path))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let mut inner = self.store.lock();
        inner.counters.creates += 1;
        inner.check_session(self.id, path)?;
        inner.injected(StoreOp::Create, path)?;

        if inner.exists(path) {
            return Err(StoreError::new(StoreErrorCode::NodeExists, path));
        }
        let parent = parent_path(path).to_string();
        if !inner.exists(&parent) {
            return Err(StoreError::no_node(path));
        }

        let ephemeral_owner = match mode {
            CreateMode::Ephemeral => Some(self.id),
            CreateMode::Persistent => None,
        };
        inner.nodes.insert(
            path.to_string(),
            Node {
                data,
                ephemeral_owner,
            },
        );
        inner.fire_child_watches(&parent);
        Ok(path.to_string())
    }

    async fn delete(&self, path: &str, _version: Option<i32>) -> StoreResult<()> {
        let mut inner = self.store.lock();
        inner.counters.deletes += 1;
        inner.check_session(self.id, path)?;
        inner.injected(StoreOp::Delete, path)?;

        if !inner.nodes.contains_key(path) {
            return Err(StoreError::no_node(path));
        }
        if !inner.children(path).is_empty() {
            return Err(StoreError::new(StoreErrorCode::Other("NotEmpty".to_string()), path));
        }
        inner.nodes.remove(path);
        inner.fire_child_watches(parent_path(path));
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.store.lock();
        if inner.sessions.remove(&self.id).is_some() {
            inner.remove_ephemerals(self.id);
        }
        Ok(())
    }
}
