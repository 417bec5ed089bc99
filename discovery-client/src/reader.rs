//! Follows the remote directory and publishes it as the state of the world.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use shared::{codec, ServiceRecord};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::coordination::Visitor;
use crate::ring_group::RingGroup;
use crate::store::{Session, StoreResult};
use crate::world::{WorldSnapshot, WorldState};

pub struct DirectoryReader {
    root: String,
    rpc_timeout: Duration,
    penalty_time: Duration,
    world: Arc<WorldState>,
    /// Node path -> end of its quarantine
    bad_nodes: HashMap<String, Instant>,
}

impl DirectoryReader {
    pub fn new(
        root: impl Into<String>,
        rpc_timeout: Duration,
        penalty_time: Duration,
        world: Arc<WorldState>,
    ) -> Self {
        Self {
            root: root.into(),
            rpc_timeout,
            penalty_time,
            world,
            bad_nodes: HashMap::new(),
        }
    }

    pub fn is_quarantined(&self, path: &str) -> bool {
        self.bad_nodes
            .get(path)
            .is_some_and(|until| Instant::now() < *until)
    }

    fn build_world(&self, records: Vec<ServiceRecord>) -> WorldSnapshot {
        let mut by_name: HashMap<String, Vec<ServiceRecord>> = HashMap::new();
        for record in records {
            by_name
                .entry(record.service_name().to_string())
                .or_default()
                .push(record);
        }

        let current = self.world.state();
        let mut world = WorldSnapshot::with_capacity(by_name.len());
        for (name, records) in by_name {
            if let Some(group) = current.get(&name).filter(|g| g.same_records(&records)) {
                world.insert(name, Arc::clone(group));
                continue;
            }
            match RingGroup::new(records) {
                Ok(group) => {
                    debug!("Rebuilt ring group for {} ({} instances)", name, group.len());
                    world.insert(name, Arc::new(group));
                }
                Err(e) => warn!("Could not build ring group for {}: {}", name, e),
            }
        }
        world
    }
}

#[async_trait]
impl Visitor for DirectoryReader {
    async fn visit(
        &mut self,
        children: &[String],
        session: &dyn Session,
        generation: u64,
    ) -> StoreResult<()> {
        trace!("Reading {} nodes for generation {}", children.len(), generation);
        let now = Instant::now();

        let mut fetches = FuturesUnordered::new();
        for child in children {
            let path = format!("{}/{}", self.root, child);
            if let Some(until) = self.bad_nodes.get(&path) {
                if now < *until {
                    trace!("Skipping quarantined node {}", path);
                    continue;
                }
                info!("Releasing {} from quarantine", path);
                self.bad_nodes.remove(&path);
            }
            fetches.push(async move {
                let result = session.get_data(&path).await;
                (path, result)
            });
        }

        // Deleted nodes leave the quarantine once their penalty is served
        let listed: HashSet<String> = children
            .iter()
            .map(|child| format!("{}/{}", self.root, child))
            .collect();
        self.bad_nodes
            .retain(|path, until| listed.contains(path) || now < *until);

        let penalty_time = self.penalty_time;
        let bad_nodes = &mut self.bad_nodes;
        let mut records = Vec::with_capacity(fetches.len());
        let mut failure = None;

        let collected = tokio::time::timeout(self.rpc_timeout, async {
            while let Some((path, result)) = fetches.next().await {
                let data = match result {
                    Ok(data) => data,
                    Err(e) if e.is_no_node() => {
                        trace!("Node {} vanished while reading", path);
                        continue;
                    }
                    Err(e) if e.is_connection_loss() || e.is_session_expired() => {
                        failure = Some(e);
                        return;
                    }
                    Err(e) => {
                        warn!("Could not read {}: {}", path, e);
                        continue;
                    }
                };
                if data.is_empty() {
                    trace!("Node {} has no data", path);
                    continue;
                }
                match codec::decode(&data) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        info!(
                            "Quarantining {} for {:?}, could not decode record: {}",
                            path, penalty_time, e
                        );
                        bad_nodes.insert(path, Instant::now() + penalty_time);
                    }
                }
            }
        })
        .await;

        if let Some(e) = failure {
            return Err(e);
        }
        if collected.is_err() {
            warn!(
                "Timed out reading service nodes, {} records available this cycle",
                records.len()
            );
        }

        let world = self.build_world(records);
        debug!("Publishing {} services", world.len());
        self.world.set_state(world);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorCode;
    use crate::store::memory::StoreOp;
    use crate::store::{CoordinationStore, MemoryStore};
    use tokio::sync::mpsc;

    const ROOT: &str = "/ness/srvc";
    const PENALTY: Duration = Duration::from_secs(600);

    struct Fixture {
        store: MemoryStore,
        session: Arc<dyn Session>,
        world: Arc<WorldState>,
        reader: DirectoryReader,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryStore::new();
            store.put(ROOT, Vec::new());
            let (tx, _rx) = mpsc::unbounded_channel();
            let session = store.connect(Duration::from_secs(3), tx).await.unwrap();
            let world = Arc::new(WorldState::new(true));
            let reader =
                DirectoryReader::new(ROOT, Duration::from_millis(500), PENALTY, Arc::clone(&world));
            Self {
                store,
                session,
                world,
                reader,
            }
        }

        fn publish(&self, record: &ServiceRecord) {
            let path = format!("{}/{}", ROOT, record.announcement_name());
            self.store.put(&path, codec::encode(record).unwrap());
        }

        async fn visit(&mut self) -> StoreResult<()> {
            let children = self.store.children(ROOT);
            self.reader.visit(&children, self.session.as_ref(), 1).await
        }
    }

    fn record(name: &str, service_type: &str, port: u16) -> ServiceRecord {
        ServiceRecord::for_service(name, Some(service_type), "http", "10.0.0.1", port).unwrap()
    }

    #[tokio::test]
    async fn test_groups_records_by_name() {
        let mut fixture = Fixture::new().await;
        fixture.publish(&record("user", "http", 80));
        fixture.publish(&record("user", "https", 443));
        fixture.publish(&record("billing", "http", 80));

        fixture.visit().await.unwrap();

        let world = fixture.world.state();
        assert_eq!(world.len(), 2);
        assert_eq!(world["user"].len(), 2);
        assert_eq!(world["billing"].len(), 1);
        assert!(fixture.world.has_changed());
    }

    #[tokio::test]
    async fn test_empty_and_vanished_nodes_are_skipped() {
        let mut fixture = Fixture::new().await;
        fixture.publish(&record("user", "http", 80));
        fixture.store.put(&format!("{}/empty", ROOT), Vec::new());

        let mut children = fixture.store.children(ROOT);
        children.push("ghost".to_string());
        fixture
            .reader
            .visit(&children, fixture.session.as_ref(), 1)
            .await
            .unwrap();

        let world = fixture.world.state();
        assert_eq!(world.len(), 1);
        assert!(!fixture.reader.is_quarantined(&format!("{}/empty", ROOT)));
        assert!(!fixture.reader.is_quarantined(&format!("{}/ghost", ROOT)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_node_quarantined_for_penalty_time() {
        let mut fixture = Fixture::new().await;
        let bad = format!("{}/bad", ROOT);
        fixture.store.put(&bad, b"not a record".to_vec());
        fixture.publish(&record("user", "http", 80));

        fixture.visit().await.unwrap();
        assert!(fixture.reader.is_quarantined(&bad));
        assert_eq!(fixture.world.state().len(), 1);
        let reads = fixture.store.counters().get_data;

        // Fixed in the meantime, but still serving its penalty
        let good = record("fixed", "http", 80);
        fixture.store.put(&bad, codec::encode(&good).unwrap());
        tokio::time::advance(PENALTY - Duration::from_millis(1)).await;
        fixture.visit().await.unwrap();
        assert_eq!(fixture.store.counters().get_data, reads + 1);
        assert!(fixture.world.group("fixed").is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        fixture.visit().await.unwrap();
        assert!(!fixture.reader.is_quarantined(&bad));
        assert!(fixture.world.group("fixed").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_bad_node_leaves_quarantine() {
        let mut fixture = Fixture::new().await;
        let bad = format!("{}/bad", ROOT);
        fixture.store.put(&bad, b"not a record".to_vec());

        fixture.visit().await.unwrap();
        assert!(fixture.reader.is_quarantined(&bad));

        fixture.store.remove(&bad);
        fixture.visit().await.unwrap();
        assert_eq!(fixture.reader.bad_nodes.len(), 1);

        tokio::time::advance(PENALTY).await;
        fixture.visit().await.unwrap();
        assert!(fixture.reader.bad_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_group_is_reused() {
        let mut fixture = Fixture::new().await;
        fixture.publish(&record("user", "http", 80));
        fixture.publish(&record("billing", "http", 80));

        fixture.visit().await.unwrap();
        let user = fixture.world.group("user").unwrap();
        let billing = fixture.world.group("billing").unwrap();

        fixture.publish(&record("billing", "https", 443));
        fixture.visit().await.unwrap();

        assert!(Arc::ptr_eq(&user, &fixture.world.group("user").unwrap()));
        assert!(!Arc::ptr_eq(&billing, &fixture.world.group("billing").unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_time_out() {
        let mut fixture = Fixture::new().await;
        fixture.publish(&record("user", "http", 80));
        fixture.store.set_data_delay(Some(Duration::from_secs(5)));

        fixture.visit().await.unwrap();

        assert!(fixture.world.has_changed());
        assert!(fixture.world.state().is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_keeps_previous_world() {
        let mut fixture = Fixture::new().await;
        fixture.publish(&record("user", "http", 80));
        fixture.visit().await.unwrap();

        fixture
            .store
            .fail_next(StoreOp::GetData, StoreErrorCode::ConnectionLoss);
        let result = fixture.visit().await;

        assert!(result.unwrap_err().is_connection_loss());
        assert!(fixture.world.group("user").is_some());
    }
}
