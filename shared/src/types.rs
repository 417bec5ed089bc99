use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::protocol::{
    ANNOUNCEMENT_SEPARATOR, PROP_SERVICE_ADDRESS, PROP_SERVICE_PORT, PROP_SERVICE_SCHEME,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("Service name can not be empty")]
    EmptyServiceName,
}

/// A single announced instance of a service.
/// This is the canonical data model shared by the registry, the announcer and the daemon.
///
/// Records are immutable once built. Equality covers every field, so two records
/// for the same instance that differ only in their properties are different records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireRecord")]
pub struct ServiceRecord {
    /// Service name, e.g. "user-service"
    service_name: String,

    /// Service type, e.g. "http" or "vip". `None` is a type of its own.
    service_type: Option<String>,

    /// Identity of this instance
    service_id: Uuid,

    /// Free-form properties, e.g. address and port
    properties: BTreeMap<String, String>,

    /// Static announcements outlive the announcing session
    static_announcement: bool,

    /// Name of the node holding this record in the coordination store
    #[serde(skip)]
    announcement_name: String,
}

impl ServiceRecord {
    pub fn new(
        service_name: impl Into<String>,
        service_type: Option<&str>,
        service_id: Option<Uuid>,
        properties: BTreeMap<String, String>,
    ) -> Result<Self, RecordError> {
        Self::build(
            service_name.into(),
            service_type.map(str::to_string),
            service_id,
            properties,
            false,
        )
    }

    /// Record carrying the well-known scheme, address and port properties.
    pub fn for_service(
        service_name: impl Into<String>,
        service_type: Option<&str>,
        scheme: &str,
        address: &str,
        port: u16,
    ) -> Result<Self, RecordError> {
        Self::new(service_name, service_type, None, address_properties(scheme, address, port))
    }

    /// Record that is persisted remotely and must be explicitly unannounced.
    pub fn static_announcement(
        service_id: Option<Uuid>,
        service_name: impl Into<String>,
        service_type: Option<&str>,
        scheme: &str,
        address: &str,
        port: u16,
    ) -> Result<Self, RecordError> {
        Self::build(
            service_name.into(),
            service_type.map(str::to_string),
            service_id,
            address_properties(scheme, address, port),
            true,
        )
    }

    fn build(
        service_name: String,
        service_type: Option<String>,
        service_id: Option<Uuid>,
        properties: BTreeMap<String, String>,
        static_announcement: bool,
    ) -> Result<Self, RecordError> {
        if service_name.is_empty() {
            return Err(RecordError::EmptyServiceName);
        }
        let service_id = service_id.unwrap_or_else(Uuid::new_v4);
        let announcement_name = [
            service_name.as_str(),
            service_type.as_deref().unwrap_or(""),
            &service_id.to_string(),
        ]
        .join(ANNOUNCEMENT_SEPARATOR);

        Ok(Self {
            service_name,
            service_type,
            service_id,
            properties,
            static_announcement,
            announcement_name,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_type(&self) -> Option<&str> {
        self.service_type.as_deref()
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_static_announcement(&self) -> bool {
        self.static_announcement
    }

    pub fn announcement_name(&self) -> &str {
        &self.announcement_name
    }
}

fn address_properties(scheme: &str, address: &str, port: u16) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PROP_SERVICE_SCHEME.to_string(), scheme.to_string()),
        (PROP_SERVICE_ADDRESS.to_string(), address.to_string()),
        (PROP_SERVICE_PORT.to_string(), port.to_string()),
    ])
}

/// On-the-wire shape; every field but the name is optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    service_name: String,
    #[serde(default)]
    service_type: Option<String>,
    #[serde(default)]
    service_id: Option<Uuid>,
    #[serde(default)]
    properties: Option<BTreeMap<String, String>>,
    #[serde(default)]
    static_announcement: Option<bool>,
}

impl TryFrom<WireRecord> for ServiceRecord {
    type Error = RecordError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        Self::build(
            wire.service_name,
            wire.service_type,
            wire.service_id,
            wire.properties.unwrap_or_default(),
            wire.static_announcement.unwrap_or(false),
        )
    }
}
