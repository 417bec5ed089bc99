//! Client side service discovery over a hierarchical coordination store.
//!
//! Every process announces itself as a node below a shared root and follows
//! the children of that root to keep a local, lock-free view of all service
//! instances. Lookups are served from that view through consistent hash
//! rings.

pub mod announcer;
pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod jobs;
pub mod reader;
pub mod ring;
pub mod ring_group;
pub mod store;
pub mod world;

pub use client::{DiscoveryClient, ReadOnlyDiscoveryClient, ServiceDiscovery, ServiceHint};
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult, JobError, StoreError, StoreErrorCode};
pub use jobs::{BuildPathJob, CoordinationJob, JobHandle, JobProcessor, JobState};
pub use ring::ConsistentHashRing;
pub use ring_group::RingGroup;
pub use store::{CoordinationStore, MemoryStore, Session};
pub use world::WorldState;
