//! `PING` probe for a tunnelled Redis service

use async_trait::async_trait;
use envtunnel_core::endpoint::{ServiceEndpoint, TunnelRecord};
use envtunnel_core::probe::HealthProbe;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::time::Duration;
use tracing::{debug, warn};

/// Reports healthy when the service's first endpoint answers `PONG`
#[derive(Debug, Clone)]
pub struct RedisPingProbe {
    service: String,
    timeout: Duration,
}

impl RedisPingProbe {
    pub fn new(service: impl Into<String>, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            timeout,
        }
    }

    async fn ping(&self, info: ConnectionInfo) -> redis::RedisResult<String> {
        let client = Client::open(info)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async(&mut conn).await
    }
}

/// Connection parameters for an endpoint; `None` without a port
fn connection_info(endpoint: &ServiceEndpoint) -> Option<ConnectionInfo> {
    let port = endpoint.port?;
    Some(ConnectionInfo {
        addr: ConnectionAddr::Tcp(endpoint.host.clone(), port),
        redis: RedisConnectionInfo {
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            ..Default::default()
        },
    })
}

#[async_trait]
impl HealthProbe for RedisPingProbe {
    async fn check(&self, record: &TunnelRecord) -> bool {
        let Some(endpoint) = record.primary(&self.service) else {
            return true;
        };
        let Some(info) = connection_info(endpoint) else {
            warn!(service = %self.service, "Endpoint has no port, cannot probe");
            return false;
        };

        match tokio::time::timeout(self.timeout, self.ping(info)).await {
            Ok(Ok(reply)) if reply == "PONG" => true,
            Ok(Ok(reply)) => {
                debug!(service = %self.service, %reply, "Unexpected PING reply");
                false
            }
            Ok(Err(e)) => {
                debug!(service = %self.service, "PING failed: {}", e);
                false
            }
            Err(_) => {
                debug!(service = %self.service, "PING timed out after {:?}", self.timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: Option<u16>) -> ServiceEndpoint {
        ServiceEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            password: Some("s3cret".to_string()),
            ..ServiceEndpoint::default()
        }
    }

    fn record(port: Option<u16>) -> TunnelRecord {
        let mut record = TunnelRecord::new();
        record.push("cache", endpoint(port));
        record
    }

    #[test]
    fn test_connection_info_carries_credentials() {
        let info = connection_info(&endpoint(Some(30001))).unwrap();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 30001) if host == "127.0.0.1"));
        assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
        assert_eq!(info.redis.username, None);
        assert_eq!(info.redis.db, 0);
    }

    #[test]
    fn test_connection_info_requires_port() {
        assert!(connection_info(&endpoint(None)).is_none());
    }

    #[tokio::test]
    async fn test_absent_service_is_healthy() {
        let probe = RedisPingProbe::new("search", Duration::from_millis(200));
        assert!(probe.check(&record(Some(30001))).await);
    }

    #[tokio::test]
    async fn test_missing_port_is_unhealthy() {
        let probe = RedisPingProbe::new("cache", Duration::from_millis(200));
        assert!(!probe.check(&record(None)).await);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = RedisPingProbe::new("cache", Duration::from_secs(2));
        assert!(!probe.check(&record(Some(port))).await);
    }
}
