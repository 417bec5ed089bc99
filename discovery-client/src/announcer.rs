//! Keeps the remote directory in line with the local announcements.
//!
//! Callers mutate `Announcements` from any task without blocking; the
//! `AnnouncementReconciler` runs on the coordination loop and converges the
//! store towards the desired set with a generation stamped mark and sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashSet;
use shared::{codec, ServiceRecord};
use tracing::{debug, info, trace, warn};
use crate::coordination::Visitor;
use crate::store::{CreateMode, Session, StoreResult};

/// The records this process wants visible.
pub struct Announcements {
    desired: DashSet<ServiceRecord>,
    /// Bumped on every change; starts at 1 so the reconciler runs right away
    generation: AtomicU64,
    static_to_remove: DashSet<ServiceRecord>,
}

impl Announcements {
    pub fn new() -> Self {
        Self {
            desired: DashSet::new(),
            generation: AtomicU64::new(1),
            static_to_remove: DashSet::new(),
        }
    }

    pub fn announce(&self, record: ServiceRecord) {
        self.static_to_remove.remove(&record);
        self.desired.insert(record);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Static records are also queued for explicit remote deletion.
    pub fn unannounce(&self, record: &ServiceRecord) {
        self.desired.remove(record);
        self.generation.fetch_add(1, Ordering::SeqCst);

        if record.is_static_announcement() {
            self.static_to_remove.insert(record.clone());
        }
    }

    pub fn unannounce_all(&self) {
        self.desired.retain(|record| {
            if record.is_static_announcement() {
                self.static_to_remove.insert(record.clone());
            }
            false
        });
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn desired(&self) -> Vec<ServiceRecord> {
        self.desired.iter().map(|record| record.key().clone()).collect()
    }

    pub fn pending_static_removals(&self) -> Vec<ServiceRecord> {
        self.static_to_remove
            .iter()
            .map(|record| record.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

impl Default for Announcements {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AnnouncementReconciler {
    root: String,
    announcements: Arc<Announcements>,
    last_announcement_generation: u64,
    /// Announcement name -> last generation it was confirmed in.
    /// Static announcements are never swept.
    last_seen: HashMap<String, u64>,
}

impl AnnouncementReconciler {
    pub fn new(root: impl Into<String>, announcements: Arc<Announcements>) -> Self {
        Self {
            root: root.into(),
            announcements,
            last_announcement_generation: 0,
            last_seen: HashMap::new(),
        }
    }

    fn node_path(&self, announcement_name: &str) -> String {
        format!("{}/{}", self.root, announcement_name)
    }

    async fn announce_missing(
        &mut self,
        children: &[String],
        session: &dyn Session,
        generation: u64,
    ) -> StoreResult<()> {
        for record in self.announcements.desired() {
            let name = record.announcement_name();
            if !record.is_static_announcement() {
                self.last_seen.insert(name.to_string(), generation);
            }
            if children.iter().any(|child| child == name) {
                continue;
            }

            debug!("Need to announce {}", name);
            let payload = match codec::encode(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("While generating announcement for {}: {}", name, e);
                    continue;
                }
            };
            let mode = if record.is_static_announcement() {
                CreateMode::Persistent
            } else {
                CreateMode::Ephemeral
            };
            match session.create(&self.node_path(name), payload, mode).await {
                Ok(_) => debug!("Created {:?} announcement for {}", mode, name),
                Err(e) if e.is_node_exists() => trace!("Announcement {} already present", name),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn sweep(&mut self, session: &dyn Session, generation: u64) -> StoreResult<()> {
        let stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| **seen != generation)
            .map(|(name, _)| name.clone())
            .collect();

        for name in stale {
            trace!("Announcement {} no longer present in generation {}", name, generation);
            match session.delete(&self.node_path(&name), None).await {
                Ok(()) => debug!("Removed announcement for {}", name),
                Err(e) if e.is_no_node() => trace!("Node {} was already removed", name),
                Err(e) => return Err(e),
            }
            self.last_seen.remove(&name);
        }
        Ok(())
    }

    async fn remove_static(&mut self, session: &dyn Session) {
        for record in self.announcements.pending_static_removals() {
            let name = record.announcement_name();
            info!("Removing static announcement {}", name);
            match session.delete(&self.node_path(name), None).await {
                Ok(()) => debug!("Removed announcement for {}", name),
                Err(e) if e.is_no_node() => trace!("Node {} was already removed", name),
                Err(e) => {
                    warn!("Could not remove static announcement {}, will retry: {}", name, e);
                    continue;
                }
            }
            self.announcements.static_to_remove.remove(&record);
        }
    }
}

#[async_trait]
impl Visitor for AnnouncementReconciler {
    fn determine_generation(&mut self, generation: &AtomicU64, _tick: u64) {
        let current = self.announcements.generation();
        if self.last_announcement_generation < current {
            generation.fetch_add(1, Ordering::SeqCst);
            self.last_announcement_generation = current;
        }
    }

    async fn visit(
        &mut self,
        children: &[String],
        session: &dyn Session,
        generation: u64,
    ) -> StoreResult<()> {
        self.announce_missing(children, session, generation).await?;
        self.sweep(session, generation).await?;
        self.remove_static(session).await;
        Ok(())
    }
}
