use std::collections::{HashMap, HashSet};
use rand::Rng;
use shared::ServiceRecord;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::ring::ConsistentHashRing;

/// All instances of one service, partitioned into one ring per service type.
#[derive(Debug, Clone)]
pub struct RingGroup {
    service_name: Option<String>,
    /// Ring of the records without a type
    untyped: Option<ConsistentHashRing>,
    typed: HashMap<String, ConsistentHashRing>,
    total: usize,
}

impl RingGroup {
    pub fn new(records: impl IntoIterator<Item = ServiceRecord>) -> DiscoveryResult<Self> {
        let mut service_name: Option<String> = None;
        let mut untyped = Vec::new();
        let mut typed: HashMap<String, Vec<ServiceRecord>> = HashMap::new();
        let mut total = 0;

        for record in records {
            match &service_name {
                Some(name) if name != record.service_name() => {
                    return Err(DiscoveryError::InvalidArgument(format!(
                        "All services must have the same name: {} != {}",
                        name,
                        record.service_name()
                    )));
                }
                Some(_) => {}
                None => service_name = Some(record.service_name().to_string()),
            }

            total += 1;
            match record.service_type() {
                Some(service_type) => typed
                    .entry(service_type.to_string())
                    .or_default()
                    .push(record),
                None => untyped.push(record),
            }
        }

        Ok(Self {
            service_name,
            untyped: (!untyped.is_empty()).then(|| ConsistentHashRing::new(untyped)),
            typed: typed
                .into_iter()
                .map(|(service_type, records)| (service_type, ConsistentHashRing::new(records)))
                .collect(),
            total,
        })
    }

    /// Ring serving `service_type`.
    ///
    /// - an exact match wins;
    /// - without a type and no untyped ring, any typed ring will do, picked at
    ///   random weighted by the number of instances in each ring;
    /// - an unknown type falls back to the untyped ring.
    pub fn ring(&self, service_type: Option<&str>) -> Option<&ConsistentHashRing> {
        match service_type {
            Some(service_type) => self.typed.get(service_type).or(self.untyped.as_ref()),
            None => self.untyped.as_ref().or_else(|| self.weighted_random_ring()),
        }
    }

    fn weighted_random_ring(&self) -> Option<&ConsistentHashRing> {
        if self.total == 0 {
            return None;
        }
        let mut selection = rand::rng().random_range(0..self.total);
        for ring in self.typed.values() {
            if selection < ring.len() {
                return Some(ring);
            }
            selection -= ring.len();
        }
        None
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn rings(&self) -> impl Iterator<Item = &ConsistentHashRing> {
        self.untyped.iter().chain(self.typed.values())
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.rings().flat_map(ConsistentHashRing::records)
    }

    pub fn all(&self) -> Vec<ServiceRecord> {
        self.records().cloned().collect()
    }

    /// Whether this group was built from exactly `records` (as a set).
    pub fn same_records(&self, records: &[ServiceRecord]) -> bool {
        let current: HashSet<&ServiceRecord> = self.records().collect();
        let candidate: HashSet<&ServiceRecord> = records.iter().collect();
        current == candidate
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(name: &str, service_type: Option<&str>) -> ServiceRecord {
        ServiceRecord::new(name, service_type, None, BTreeMap::new()).unwrap()
    }

    fn group() -> RingGroup {
        RingGroup::new(vec![
            record("fake", Some("type1")),
            record("fake", Some("type2")),
            record("fake", None),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_type() {
        let group = group();
        let ring = group.ring(Some("type1")).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.records().next().unwrap().service_type(), Some("type1"));
    }

    #[test]
    fn test_unknown_type_falls_back_to_untyped() {
        let group = group();
        let ring = group.ring(Some("type3")).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.records().next().unwrap().service_type(), None);
    }

    #[test]
    fn test_unknown_type_without_untyped_ring() {
        let group = RingGroup::new(vec![record("fake", Some("type1"))]).unwrap();
        assert!(group.ring(Some("type3")).is_none());
    }

    #[test]
    fn test_untyped_lookup_picks_weighted_typed_ring() {
        let group = RingGroup::new(vec![
            record("fake", Some("big")),
            record("fake", Some("big")),
            record("fake", Some("big")),
            record("fake", Some("small")),
        ])
        .unwrap();

        let mut big = 0;
        for _ in 0..4000 {
            let ring = group.ring(None).unwrap();
            if ring.records().next().unwrap().service_type() == Some("big") {
                big += 1;
            }
        }
        // 3 out of 4 instances serve "big"
        assert!(big > 2700 && big < 3300, "big picked {} times", big);
    }

    #[test]
    fn test_empty_group() {
        let group = RingGroup::new(Vec::new()).unwrap();
        assert!(group.is_empty());
        assert!(group.ring(None).is_none());
        assert!(group.ring(Some("http")).is_none());
    }

    #[test]
    fn test_mixed_names_rejected() {
        let result = RingGroup::new(vec![record("a", None), record("b", None)]);
        assert!(matches!(result, Err(DiscoveryError::InvalidArgument(_))));
    }

    #[test]
    fn test_same_records_ignores_order() {
        let records = vec![record("fake", Some("a")), record("fake", None)];
        let group = RingGroup::new(records.clone()).unwrap();

        let mut reversed = records.clone();
        reversed.reverse();
        assert!(group.same_records(&reversed));
        assert!(!group.same_records(&records[..1]));
        assert_eq!(group.all().len(), 2);
    }
}
