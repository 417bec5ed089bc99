//! Caller facing discovery API.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rand::Rng;
use shared::protocol::{PROP_SERVICE_ADDRESS, PROP_SERVICE_PORT, PROP_SERVICE_SCHEME};
use shared::{ServiceRecord, ServiceUri};
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use crate::announcer::{AnnouncementReconciler, Announcements};
use crate::config::DiscoveryConfig;
use crate::coordination::{CoordinationLoop, DiscoveryTask, LoopHandle, Visitor};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::reader::DirectoryReader;
use crate::ring::ConsistentHashRing;
use crate::store::CoordinationStore;
use crate::world::WorldState;

/// Narrows down which instance serves a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHint {
    /// Instances are picked by hashing this key
    ConsistentHash(String),
    Qualifier(String),
    Version(u32),
}

impl ServiceHint {
    pub fn serves_key(key: impl Into<String>) -> Self {
        ServiceHint::ConsistentHash(key.into())
    }
}

#[async_trait]
pub trait ReadOnlyDiscoveryClient: Send + Sync {
    /// `scheme://address:port` of an instance of the service.
    fn find_service_uri(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        hints: &[ServiceHint],
    ) -> DiscoveryResult<Url>;

    fn find_service_information(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        hints: &[ServiceHint],
    ) -> DiscoveryResult<ServiceRecord>;

    /// Every instance of the service, whatever its type.
    fn find_all_service_information(&self, service_name: &str) -> Vec<ServiceRecord>;

    /// Instances of the ring that serves `service_type`.
    fn find_all_service_information_of_type(
        &self,
        service_name: &str,
        service_type: Option<&str>,
    ) -> Vec<ServiceRecord>;

    /// Service name -> all of its instances.
    fn find_all_services(&self) -> HashMap<String, Vec<ServiceRecord>>;

    /// Waits until the registry was read at least once.
    async fn wait_for_world_change(&self, timeout: Duration) -> bool;
}

pub trait DiscoveryClient: ReadOnlyDiscoveryClient {
    fn is_writable(&self) -> bool;

    fn announce(&self, record: ServiceRecord) -> DiscoveryResult<()>;

    fn unannounce(&self, record: &ServiceRecord) -> DiscoveryResult<()>;

    fn unannounce_all(&self) -> DiscoveryResult<()>;
}

fn describe(service_name: &str, service_type: Option<&str>) -> String {
    match service_type {
        Some(service_type) => format!("{}/{}", service_name, service_type),
        None => service_name.to_string(),
    }
}

fn select_hinted(ring: &ConsistentHashRing, hints: &[ServiceHint]) -> DiscoveryResult<ServiceRecord> {
    let key = hints
        .iter()
        .find_map(|hint| match hint {
            ServiceHint::ConsistentHash(key) => Some(key.clone()),
            _ => None,
        })
        .unwrap_or_else(|| rand::rng().random::<i32>().to_string());
    ring.get(&key).cloned()
}

/// Scheme, address and port of a record.
fn endpoint(record: &ServiceRecord, description: &str) -> DiscoveryResult<(String, String, u16)> {
    let scheme = record.property(PROP_SERVICE_SCHEME).filter(|s| !s.is_empty());
    let address = record.property(PROP_SERVICE_ADDRESS).filter(|s| !s.is_empty());
    let port = record.property(PROP_SERVICE_PORT).filter(|s| !s.is_empty());

    let (Some(scheme), Some(address), Some(port)) = (scheme, address, port) else {
        return Err(DiscoveryError::ServiceNotAvailable(format!(
            "Service {} exists but misses address information ({:?}/{:?})",
            description, address, port
        )));
    };
    let port = port.parse::<u16>().map_err(|_| {
        DiscoveryError::ServiceNotAvailable(format!(
            "Bad port ({}) in service information for {}",
            port, description
        ))
    })?;
    Ok((scheme.to_string(), address.to_string(), port))
}

/// Host part of a URL; IPv6 literals need brackets.
fn url_host(address: &str) -> String {
    if address.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}

/// Discovery client over an injected coordination store.
///
/// Read-only and read/write clients share this type; writing is a capability
/// checked by `is_writable`.
pub struct ServiceDiscovery {
    config: DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    world: Arc<WorldState>,
    announcements: Option<Arc<Announcements>>,
    handle: Mutex<Option<LoopHandle>>,
}

impl ServiceDiscovery {
    fn new(
        store: Arc<dyn CoordinationStore>,
        config: DiscoveryConfig,
        announcements: Option<Arc<Announcements>>,
    ) -> Self {
        // Only wait for the first update if there will be one
        let world = Arc::new(WorldState::new(config.enabled));
        Self {
            config,
            store,
            world,
            announcements,
            handle: Mutex::new(None),
        }
    }

    pub fn read_only(store: Arc<dyn CoordinationStore>, config: DiscoveryConfig) -> Self {
        Self::new(store, config, None)
    }

    pub fn read_write(store: Arc<dyn CoordinationStore>, config: DiscoveryConfig) -> Self {
        Self::new(store, config, Some(Arc::new(Announcements::new())))
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn world(&self) -> &Arc<WorldState> {
        &self.world
    }

    /// Starts following the registry and waits briefly for the first
    /// snapshot. Does nothing when discovery is disabled.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Service discovery is disabled");
            return;
        }

        {
            let mut handle = self.handle.lock().await;
            if handle.is_some() {
                warn!("Service discovery was already started");
                return;
            }

            let mut visitors: Vec<Box<dyn Visitor>> = vec![Box::new(DirectoryReader::new(
                self.config.root.clone(),
                self.config.rpc_timeout(),
                self.config.penalty_time(),
                Arc::clone(&self.world),
            ))];
            match &self.announcements {
                Some(_) if !self.config.announce_enabled => {
                    info!("Announcing is administratively disabled");
                }
                Some(announcements) => visitors.push(Box::new(AnnouncementReconciler::new(
                    self.config.root.clone(),
                    Arc::clone(announcements),
                ))),
                None => {}
            }

            let task = DiscoveryTask::new(self.config.root.clone(), self.config.scan_ticks(), visitors);
            let driver = CoordinationLoop::new(
                "discovery",
                Arc::clone(&self.store),
                task,
                self.config.tick_interval(),
                self.config.session_timeout(),
            );
            *handle = Some(driver.spawn());
        }

        if !self.world.wait_for_world_change(self.config.startup_wait()).await {
            info!(
                "No service information after {:?}, continuing",
                self.config.startup_wait()
            );
        }
    }

    /// Stops the loop and closes its session, which retracts every
    /// ephemeral announcement.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
            info!("Service discovery stopped");
        }
    }

    fn find_ring<T>(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        f: impl FnOnce(&ConsistentHashRing) -> T,
    ) -> Option<T> {
        let group = self.world.group(service_name)?;
        group
            .ring(service_type)
            .filter(|ring| !ring.is_empty())
            .map(f)
    }

    /// Resolves a `srvc://` URI to the URL of a service instance.
    ///
    /// Default ports of http and https are left out.
    pub fn convert_service_uri(
        &self,
        service_uri: &ServiceUri,
        hints: &[ServiceHint],
    ) -> DiscoveryResult<Url> {
        if !self.config.enabled {
            return Err(DiscoveryError::ServiceNotAvailable(
                "Service discovery is disabled".to_string(),
            ));
        }

        let description = describe(service_uri.service_name(), service_uri.service_type());
        let record = self.find_service_information(
            service_uri.service_name(),
            service_uri.service_type(),
            hints,
        )?;
        let (scheme, address, port) = endpoint(&record, &description)?;

        let mut target = format!("{}://{}", scheme, url_host(&address));
        let default_port = matches!((scheme.as_str(), port), ("http", 80) | ("https", 443));
        if !default_port {
            target.push_str(&format!(":{}", port));
        }
        if !service_uri.path().trim().is_empty() {
            target.push_str(service_uri.path());
        }
        if let Some(query) = service_uri.query().filter(|q| !q.trim().is_empty()) {
            target.push('?');
            target.push_str(query);
        }
        if let Some(fragment) = service_uri.fragment().filter(|f| !f.trim().is_empty()) {
            target.push('#');
            target.push_str(fragment);
        }

        Url::parse(&target).map_err(|e| {
            DiscoveryError::ServiceNotAvailable(format!("Could not create URL from {}: {}", target, e))
        })
    }
}

#[async_trait]
impl ReadOnlyDiscoveryClient for ServiceDiscovery {
    fn find_service_uri(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        hints: &[ServiceHint],
    ) -> DiscoveryResult<Url> {
        let description = describe(service_name, service_type);
        let record = self.find_service_information(service_name, service_type, hints)?;
        let (scheme, address, port) = endpoint(&record, &description)?;

        Url::parse(&format!("{}://{}:{}", scheme, url_host(&address), port)).map_err(|e| {
            DiscoveryError::ServiceNotAvailable(format!(
                "Could not create URL for {}: {}",
                description, e
            ))
        })
    }

    fn find_service_information(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        hints: &[ServiceHint],
    ) -> DiscoveryResult<ServiceRecord> {
        let not_found = || {
            DiscoveryError::ServiceNotAvailable(format!(
                "No {} service found",
                describe(service_name, service_type)
            ))
        };
        self.find_ring(service_name, service_type, |ring| select_hinted(ring, hints))
            .ok_or_else(not_found)?
            .map_err(|_| not_found())
    }

    fn find_all_service_information(&self, service_name: &str) -> Vec<ServiceRecord> {
        self.world
            .group(service_name)
            .map(|group| group.all())
            .unwrap_or_default()
    }

    fn find_all_service_information_of_type(
        &self,
        service_name: &str,
        service_type: Option<&str>,
    ) -> Vec<ServiceRecord> {
        self.find_ring(service_name, service_type, |ring| {
            ring.records().cloned().collect()
        })
        .unwrap_or_default()
    }

    fn find_all_services(&self) -> HashMap<String, Vec<ServiceRecord>> {
        self.world
            .state()
            .iter()
            .map(|(name, group)| (name.clone(), group.all()))
            .collect()
    }

    async fn wait_for_world_change(&self, timeout: Duration) -> bool {
        self.world.wait_for_world_change(timeout).await
    }
}

impl DiscoveryClient for ServiceDiscovery {
    fn is_writable(&self) -> bool {
        self.announcements.is_some()
    }

    fn announce(&self, record: ServiceRecord) -> DiscoveryResult<()> {
        let announcements = self.announcements.as_ref().ok_or(DiscoveryError::ReadOnly)?;
        announcements.announce(record);
        Ok(())
    }

    fn unannounce(&self, record: &ServiceRecord) -> DiscoveryResult<()> {
        let announcements = self.announcements.as_ref().ok_or(DiscoveryError::ReadOnly)?;
        announcements.unannounce(record);
        Ok(())
    }

    fn unannounce_all(&self) -> DiscoveryResult<()> {
        let announcements = self.announcements.as_ref().ok_or(DiscoveryError::ReadOnly)?;
        announcements.unannounce_all();
        Ok(())
    }
}
