//! Endpoint records exposed by an open tunnel

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection details for one endpoint of a tunneled service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// The URL as reported by the Tunnel CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Keys reported by `describe` that have no typed field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ServiceEndpoint {
    /// `host:port`, when the port is known
    pub fn address(&self) -> Option<String> {
        self.port.map(|port| format!("{}:{}", self.host, port))
    }
}

/// Service name -> ordered endpoints of one tunnel
///
/// Records are replaced wholesale when a tunnel is recreated, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelRecord {
    services: BTreeMap<String, Vec<ServiceEndpoint>>,
}

impl TunnelRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Number of services in the record
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn get(&self, service: &str) -> Option<&[ServiceEndpoint]> {
        self.services.get(service).map(Vec::as_slice)
    }

    /// First endpoint of a service
    pub fn primary(&self, service: &str) -> Option<&ServiceEndpoint> {
        self.get(service).and_then(|endpoints| endpoints.first())
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Append an endpoint, skipping exact duplicates
    pub fn push(&mut self, service: impl Into<String>, endpoint: ServiceEndpoint) {
        let endpoints = self.services.entry(service.into()).or_default();
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }

    /// A record holding only `service`, if present
    pub fn only(&self, service: &str) -> Option<TunnelRecord> {
        self.services.get_key_value(service).map(|(name, endpoints)| {
            let mut services = BTreeMap::new();
            services.insert(name.clone(), endpoints.clone());
            TunnelRecord { services }
        })
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<ServiceEndpoint>> {
        self.services
    }
}

impl From<BTreeMap<String, Vec<ServiceEndpoint>>> for TunnelRecord {
    fn from(services: BTreeMap<String, Vec<ServiceEndpoint>>) -> Self {
        Self { services }
    }
}
