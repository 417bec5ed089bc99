//! Consistent hash ring over the instances of one service type.
//!
//! Every record is placed at a fixed number of points on a 32 bit ring. The
//! offsets of those points come from a pseudo-random sequence that restarts
//! from the same seed for every record, so two rings built from overlapping
//! sets of records agree on the placement of most keys. Removing one of N
//! records only remaps the keys that record owned (~1/N).

use std::collections::BTreeMap;
use std::sync::Arc;
use rand::{rngs::StdRng, Rng, SeedableRng};
use shared::ServiceRecord;
use crate::error::{DiscoveryError, DiscoveryResult};

/// Number of points each record occupies on the ring
const POINTS_PER_RECORD: usize = 100;

/// Seed of the per-record offset sequence
const RING_SEED: u64 = 0;

#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Ring: point -> record
    ring: BTreeMap<u32, Arc<ServiceRecord>>,
    /// Records sorted by service id
    records: Vec<Arc<ServiceRecord>>,
}

impl ConsistentHashRing {
    pub fn new(records: impl IntoIterator<Item = ServiceRecord>) -> Self {
        let mut records: Vec<Arc<ServiceRecord>> = records.into_iter().map(Arc::new).collect();
        // Insertion order decides point collisions, keep it stable
        records.sort_by_key(|record| record.service_id());

        let mut ring = BTreeMap::new();
        for record in &records {
            let id = record.service_id().to_string();
            let mut rng = StdRng::seed_from_u64(RING_SEED);
            for _ in 0..POINTS_PER_RECORD {
                let offset: i32 = rng.random();
                ring.insert(hash_point(&format!("{}{}", id, offset)), Arc::clone(record));
            }
        }

        Self { ring, records }
    }

    /// Returns the record serving `key`: the first point at or after the
    /// key's hash, wrapping around to the start of the ring.
    ///
    /// O(log n) in the number of points.
    pub fn get(&self, key: &str) -> DiscoveryResult<&ServiceRecord> {
        let hash = hash_point(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, record)| record.as_ref())
            .ok_or(DiscoveryError::EmptyRing)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.records.iter().map(|record| record.as_ref())
    }
}

/// Hash a string to a ring point (first four bytes of blake3).
fn hash_point(s: &str) -> u32 {
    let hash = blake3::hash(s.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
