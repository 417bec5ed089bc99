//! The locally cached state of the world.
//!
//! The snapshot is only ever replaced as a whole. Readers load it without
//! locking and never observe a partially built map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use arc_swap::ArcSwap;
use tokio::sync::watch;
use crate::ring_group::RingGroup;

/// Service name -> ring group
pub type WorldSnapshot = HashMap<String, Arc<RingGroup>>;

pub struct WorldState {
    snapshot: ArcSwap<WorldSnapshot>,
    /// Flips to true on the first `set_state`
    changed_tx: watch::Sender<bool>,
}

impl WorldState {
    /// `blocking` decides whether waiters have to wait for a first change.
    /// A disabled client never changes its world, so it starts out open.
    pub fn new(blocking: bool) -> Self {
        let (changed_tx, _) = watch::channel(!blocking);
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            changed_tx,
        }
    }

    pub fn set_state(&self, state: WorldSnapshot) {
        self.snapshot.store(Arc::new(state));
        self.changed_tx.send_replace(true);
    }

    pub fn state(&self) -> Arc<WorldSnapshot> {
        self.snapshot.load_full()
    }

    /// Current group of `service_name`, if any.
    pub fn group(&self, service_name: &str) -> Option<Arc<RingGroup>> {
        self.snapshot.load().get(service_name).cloned()
    }

    /// Waits until the world changed at least once. Returns false if `timeout`
    /// elapsed first.
    pub async fn wait_for_world_change(&self, timeout: Duration) -> bool {
        let mut rx = self.changed_tx.subscribe();
        let changed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|changed| *changed)).await,
            Ok(Ok(_))
        );
        changed
    }

    pub fn has_changed(&self) -> bool {
        *self.changed_tx.borrow()
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new(true)
    }
}
