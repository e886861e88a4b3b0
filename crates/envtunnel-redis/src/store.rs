//! Lock store backed by Redis `SET NX EX`

use async_trait::async_trait;
use envtunnel_core::error::LockStoreError;
use envtunnel_core::lock::LockStore;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::{debug, info};
use url::Url;

fn backend(e: RedisError) -> LockStoreError {
    LockStoreError::Backend(e.to_string())
}

/// Lock store shared through one Redis instance
///
/// The connection manager reconnects on its own; each call works on a cheap
/// clone of it.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> Result<Self, LockStoreError> {
        let client = Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        info!("Connected to lock store at {}", redact(url));
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        // Reply is "OK" when set, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        debug!(key, ttl_secs, acquired = reply.is_some(), "SET NX");
        Ok(reply.is_some())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), LockStoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(backend)?;
        debug!(key, removed, "DEL");
        Ok(())
    }
}

/// Strip credentials from a connection URL for logging
fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            // Both setters only fail for URLs without a host
            let _ = url.set_password(None);
            let _ = url.set_username("");
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
