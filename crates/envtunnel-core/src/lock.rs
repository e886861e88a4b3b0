//! Cross-process locking over a shared key-value store
//!
//! The store only needs two atomic primitives: "set if absent, with expiry"
//! and "delete". `LockCoordinator` turns them into bounded `acquire` and
//! idempotent `release`.

use crate::error::LockStoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Networked key-value store reachable by every process
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` unless it exists; `true` if this call set it
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, LockStoreError>;

    /// Unconditionally set `key` with an expiry
    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), LockStoreError>;

    /// Delete `key`; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), LockStoreError>;
}

/// In-process store honouring expiry
///
/// Shared through an `Arc`, it stands in for the networked store on a single
/// host and in tests.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live (unexpired) entry
    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn poisoned() -> LockStoreError {
        LockStoreError::Backend("memory lock store mutex poisoned".to_string())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, LockStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let now = Instant::now();

        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            (value.to_string(), now + Duration::from_secs(ttl_secs)),
        );
        Ok(true)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), LockStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert(
            key.to_string(),
            (
                value.to_string(),
                Instant::now() + Duration::from_secs(ttl_secs),
            ),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

/// Lock TTL in seconds: `ceil(timeout) + margin`
///
/// The entry must outlive the longest time its holder may need, so a slow
/// holder is never preempted by its own lock expiring.
pub fn lock_ttl_secs(timeout: Duration, margin: Duration) -> u64 {
    let timeout_ms = timeout.as_millis() as u64;
    let margin_secs = margin.as_millis().div_ceil(1000) as u64;
    timeout_ms.div_ceil(1000) + margin_secs
}

/// Bounded-retry locking on top of a `LockStore`
#[derive(Clone)]
pub struct LockCoordinator {
    store: std::sync::Arc<dyn LockStore>,
    owner_id: String,
    retry_delay: Duration,
    ttl_margin: Duration,
}

impl LockCoordinator {
    pub fn new(
        store: std::sync::Arc<dyn LockStore>,
        retry_delay: Duration,
        ttl_margin: Duration,
    ) -> Self {
        Self {
            store,
            owner_id: uuid::Uuid::new_v4().to_string(),
            retry_delay,
            ttl_margin,
        }
    }

    /// Opaque marker written as the lock value
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn store(&self) -> &std::sync::Arc<dyn LockStore> {
        &self.store
    }

    /// Try to take `key`, retrying every `retry_delay` until `timeout`
    ///
    /// Returns `Ok(false)` when the budget runs out. A zero timeout makes
    /// exactly one attempt.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, LockStoreError> {
        let ttl_secs = lock_ttl_secs(timeout, self.ttl_margin);
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self
                .store
                .set_if_absent(key, &self.owner_id, ttl_secs)
                .await?
            {
                info!(lock = %key, owner = %self.owner_id, ttl = ttl_secs, "Acquired lock");
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %key, attempts, "Lock still held, giving up");
                return Ok(false);
            }

            let remaining = deadline - now;
            tokio::time::sleep(self.retry_delay.min(remaining)).await;
        }
    }

    /// Delete `key`; safe whether or not this process holds it
    pub async fn release(&self, key: &str) -> Result<(), LockStoreError> {
        self.store.delete(key).await?;
        info!(lock = %key, owner = %self.owner_id, "Released lock");
        Ok(())
    }
}
