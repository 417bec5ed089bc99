//! ZooKeeper backed coordination store.
//!
//! The `zookeeper` crate is synchronous, so every call runs on the blocking
//! pool. Watch notifications arrive through the connect watcher, session
//! state changes through a state listener. Both are forwarded to the event
//! channel handed to `connect`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tracing::debug;
use zookeeper::{Acl, WatchedEventType, ZkError, ZkState, ZooKeeper};
use crate::error::{StoreError, StoreErrorCode};
use super::{
    CoordinationStore, CreateMode, EventKind, EventSender, KeeperState, Session, StoreResult,
    WatchedEvent,
};

pub struct ZooKeeperStore {
    connect_string: String,
    next_session: AtomicU64,
}

impl ZooKeeperStore {
    /// `connect_string` is a comma separated `host:port` list.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            next_session: AtomicU64::new(0),
        }
    }
}

fn map_error(error: ZkError, path: &str) -> StoreError {
    let code = match error {
        ZkError::ConnectionLoss => StoreErrorCode::ConnectionLoss,
        ZkError::SessionExpired => StoreErrorCode::SessionExpired,
        ZkError::NoNode => StoreErrorCode::NoNode,
        ZkError::NodeExists => StoreErrorCode::NodeExists,
        ZkError::OperationTimeout => StoreErrorCode::OperationTimeout,
        other => StoreErrorCode::Other(format!("{:?}", other)),
    };
    StoreError::new(code, path)
}

fn map_event(event: zookeeper::WatchedEvent) -> Option<WatchedEvent> {
    let state = match event.keeper_state {
        zookeeper::KeeperState::SyncConnected | zookeeper::KeeperState::ConnectedReadOnly => {
            KeeperState::SyncConnected
        }
        zookeeper::KeeperState::Disconnected => KeeperState::Disconnected,
        zookeeper::KeeperState::Expired => KeeperState::Expired,
        zookeeper::KeeperState::AuthFailed => KeeperState::AuthFailed,
        _ => return None,
    };
    let kind = match event.event_type {
        WatchedEventType::None => EventKind::None,
        WatchedEventType::NodeCreated => EventKind::NodeCreated,
        WatchedEventType::NodeDeleted => EventKind::NodeDeleted,
        WatchedEventType::NodeDataChanged => EventKind::NodeDataChanged,
        WatchedEventType::NodeChildrenChanged => EventKind::NodeChildrenChanged,
        _ => return None,
    };
    Some(WatchedEvent {
        state,
        kind,
        path: event.path,
    })
}

/// Session state reported by the client library. `Closed` only means expiry
/// when the session was not closed by us.
fn map_state(state: ZkState, closing: bool) -> Option<KeeperState> {
    match state {
        ZkState::Connected | ZkState::ConnectedReadOnly => Some(KeeperState::SyncConnected),
        ZkState::Connecting | ZkState::NotConnected => Some(KeeperState::Disconnected),
        ZkState::AuthFailed => Some(KeeperState::AuthFailed),
        ZkState::Closed if !closing => Some(KeeperState::Expired),
        _ => None,
    }
}

async fn blocking<T, F>(path: &str, call: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ZkError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(|e| map_error(e, path)),
        Err(e) => Err(StoreError::new(StoreErrorCode::Other(e.to_string()), path)),
    }
}

#[async_trait]
impl CoordinationStore for ZooKeeperStore {
    async fn connect(
        &self,
        session_timeout: Duration,
        events: EventSender,
    ) -> StoreResult<Arc<dyn Session>> {
        let connect_string = self.connect_string.clone();
        let watch_events = events.clone();
        let watcher = move |event: zookeeper::WatchedEvent| {
            if let Some(event) = map_event(event) {
                let _ = watch_events.send(event);
            }
        };

        let zk = blocking("/", move || {
            ZooKeeper::connect(&connect_string, session_timeout, watcher)
        })
        .await?;

        // A transition that happened before this point is missed; the loop
        // confirms the connection with its first successful call instead.
        let closing = Arc::new(AtomicBool::new(false));
        let listener_closing = Arc::clone(&closing);
        zk.add_listener(move |state: ZkState| {
            let closing = listener_closing.load(Ordering::SeqCst);
            if let Some(state) = map_state(state, closing) {
                let _ = events.send(WatchedEvent::session(state));
            }
        });

        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Connected to ZooKeeper at {} (session {})", self.connect_string, id);
        Ok(Arc::new(ZooKeeperSession {
            id,
            zk: Arc::new(zk),
            closing,
        }))
    }
}

pub struct ZooKeeperSession {
    id: u64,
    zk: Arc<ZooKeeper>,
    /// Set before our own close so the resulting `Closed` is not taken for expiry
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl Session for ZooKeeperSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn get_children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let zk = Arc::clone(&self.zk);
        let owned = path.to_string();
        blocking(path, move || zk.get_children(&owned, watch)).await
    }

    async fn get_data(&self, path: &str) -> StoreResult<Vec<u8>> {
        let zk = Arc::clone(&self.zk);
        let owned = path.to_string();
        blocking(path, move || zk.get_data(&owned, false).map(|(data, _)| data)).await
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let zk = Arc::clone(&self.zk);
        let owned = path.to_string();
        blocking(path, move || zk.exists(&owned, false).map(|stat| stat.is_some())).await
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        let zk = Arc::clone(&self.zk);
        let owned = path.to_string();
        let mode = match mode {
            CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
            CreateMode::Persistent => zookeeper::CreateMode::Persistent,
        };
        blocking(path, move || {
            zk.create(&owned, data, Acl::open_unsafe().clone(), mode)
        })
        .await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        let zk = Arc::clone(&self.zk);
        let owned = path.to_string();
        blocking(path, move || zk.delete(&owned, version)).await
    }

    async fn close(&self) -> StoreResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        let zk = Arc::clone(&self.zk);
        blocking("/", move || zk.close()).await
    }
}
