//! Health probes for tunnel records
//!
//! A probe performs one cheap check against a designated service of a
//! record. Probes never fail: timeouts, refused connections and unexpected
//! replies all report `false`.

use crate::endpoint::TunnelRecord;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Liveness check for a candidate tunnel record
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `true` if the record can be handed out to callers
    async fn check(&self, record: &TunnelRecord) -> bool;
}

/// Probe used when a deployment defines none
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeHealthy;

#[async_trait]
impl HealthProbe for AssumeHealthy {
    async fn check(&self, _record: &TunnelRecord) -> bool {
        true
    }
}

/// Opens a TCP connection to the first endpoint of one service
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    service: String,
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpConnectProbe {
    async fn check(&self, record: &TunnelRecord) -> bool {
        // Nothing to probe: the deployment does not expose this service
        let Some(endpoint) = record.primary(&self.service) else {
            return true;
        };
        let Some(address) = endpoint.address() else {
            warn!(service = %self.service, "Endpoint has no port, cannot probe");
            return false;
        };

        match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(service = %self.service, %address, "Probe connect failed: {}", e);
                false
            }
            Err(_) => {
                debug!(service = %self.service, %address, "Probe timed out after {:?}", self.timeout);
                false
            }
        }
    }
}
