//! `srvc://serviceName[:serviceType]/path?query#fragment` URIs.

use std::fmt;
use std::str::FromStr;
use crate::protocol::SERVICE_URI_SCHEME;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("ServiceUri only supports srvc:// URIs: {0}")]
    UnsupportedScheme(String),

    #[error("ServiceUri requires a slash after the service: {0}")]
    MissingPath(String),

    #[error("ServiceUri has an empty service name: {0}")]
    EmptyServiceName(String),
}

/// A URI that names a service instead of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUri {
    service_name: String,
    service_type: Option<String>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl ServiceUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let rest = uri
            .strip_prefix(SERVICE_URI_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| UriError::UnsupportedScheme(uri.to_string()))?;

        let (rest, fragment) = match rest.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (rest, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| UriError::MissingPath(uri.to_string()))?;
        let (authority, path) = rest.split_at(slash);

        let (service_name, service_type) = match authority.split_once(':') {
            Some((name, kind)) => (name, Some(kind.to_string())),
            None => (authority, None),
        };
        if service_name.is_empty() {
            return Err(UriError::EmptyServiceName(uri.to_string()));
        }

        Ok(Self {
            service_name: service_name.to_string(),
            service_type,
            path: path.to_string(),
            query,
            fragment,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_type(&self) -> Option<&str> {
        self.service_type.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }
}

impl FromStr for ServiceUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", SERVICE_URI_SCHEME, self.service_name)?;
        if let Some(service_type) = &self.service_type {
            write!(f, ":{}", service_type)?;
        }
        f.write_str(&self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}
