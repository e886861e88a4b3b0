//! Tunnel lifecycle orchestration
//!
//! `TunnelManager` is the only public entry point. It guarantees at most one
//! live tunnel per (project, environment) across processes by funnelling
//! every open and close through the shared lock store, hands out only
//! records that pass the health probe, and tears tunnels down after a period
//! without lookups.
//!
//! Within one process, calls for the same key are serialized on a per-key
//! gate so that concurrent callers reuse the first caller's result instead of
//! contending on the lock store.

use crate::backoff::LinearBackoff;
use crate::cli::TunnelCli;
use crate::config::ManagerConfig;
use crate::endpoint::TunnelRecord;
use crate::error::{CliError, Result, TunnelError};
use crate::key::TunnelKey;
use crate::lock::{LockCoordinator, LockStore};
use crate::opener::TunnelOpener;
use crate::parser::parse_describe_output;
use crate::probe::HealthProbe;
use crate::reaper::IdleReaper;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Distributed tunnel lifecycle manager
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    cli: Arc<dyn TunnelCli>,
    probe: Arc<dyn HealthProbe>,
    locks: LockCoordinator,
    opener: TunnelOpener,
    reaper: IdleReaper,
    /// Per-key in-process serialization
    gates: Mutex<HashMap<TunnelKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TunnelManager {
    pub fn new(
        config: ManagerConfig,
        cli: Arc<dyn TunnelCli>,
        store: Arc<dyn LockStore>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let locks = LockCoordinator::new(store, config.lock.retry_delay, config.lock.ttl_margin);
        let opener = TunnelOpener::new(cli.clone(), config.opener.clone());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                cli,
                probe,
                locks,
                opener,
                reaper: IdleReaper::new(),
                gates: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Return a healthy tunnel record, opening the tunnel if needed
    pub async fn open_tunnel(&self, project_id: &str, environment: &str) -> Result<TunnelRecord> {
        let key = TunnelKey::new(project_id, environment)?;
        self.inner.open_tunnel(&key).await
    }

    /// Current record for the tunnel; renews its idle timer
    pub async fn get_tunnel_info(
        &self,
        project_id: &str,
        environment: &str,
    ) -> Result<TunnelRecord> {
        self.open_tunnel(project_id, environment).await
    }

    /// Endpoints of one service
    ///
    /// A service missing from an open tunnel is taken as a sign the tunnel
    /// was built from a stale configuration: it is closed and reopened once
    /// before giving up with `ServiceNotAvailable`.
    pub async fn get_service_tunnel_info(
        &self,
        project_id: &str,
        environment: &str,
        service: &str,
    ) -> Result<TunnelRecord> {
        let key = TunnelKey::new(project_id, environment)?;

        let record = self.inner.open_tunnel(&key).await?;
        if let Some(found) = record.only(service) {
            return Ok(found);
        }

        warn!(
            key = %key,
            service,
            "Service missing from open tunnel, recreating it"
        );
        self.inner.close_tunnel(&key).await?;

        let record = self.inner.open_tunnel(&key).await?;
        record.only(service).ok_or_else(|| TunnelError::ServiceNotAvailable {
            key: key.to_string(),
            service: service.to_string(),
        })
    }

    /// Close the tunnel unless another process currently holds its lock
    pub async fn close_tunnel(&self, project_id: &str, environment: &str) -> Result<()> {
        let key = TunnelKey::new(project_id, environment)?;
        self.inner.close_tunnel(&key).await
    }

    /// Whether an idle timer is armed for the tunnel
    pub fn has_idle_timer(&self, project_id: &str, environment: &str) -> bool {
        TunnelKey::new(project_id, environment)
            .map(|key| self.inner.reaper.is_armed(&key))
            .unwrap_or(false)
    }

    /// Cancel every idle timer; open tunnels are left as they are
    pub fn shutdown(&self) {
        info!(
            timers = self.inner.reaper.armed_count(),
            "Shutting down tunnel manager"
        );
        self.inner.reaper.disarm_all();
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

impl ManagerInner {
    fn gate(&self, key: &TunnelKey) -> Arc<tokio::sync::Mutex<()>> {
        match self.gates.lock() {
            Ok(mut gates) => gates.entry(key.clone()).or_default().clone(),
            // Poisoned registry: proceed uncoalesced
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Forget the gate of a closed tunnel unless another caller holds it
    fn prune_gate(&self, key: &TunnelKey, gate: Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut gates) = self.gates.lock() else {
            return;
        };
        // One reference in the map, one in `gate`
        let unused = gates
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &gate) && Arc::strong_count(&gate) == 2);
        if unused {
            gates.remove(key);
        }
    }

    async fn open_tunnel(self: &Arc<Self>, key: &TunnelKey) -> Result<TunnelRecord> {
        let gate = self.gate(key);
        let _guard = gate.lock().await;

        if let Some(record) = self.find_existing(key).await? {
            debug!(key = %key, "Reusing open tunnel");
            self.touch(key).await;
            return Ok(record);
        }

        let mut backoff = LinearBackoff::new(self.config.retry_backoff, self.config.max_attempts);
        let mut last_error = None;

        while backoff.next_attempt() {
            match self.attempt_open(key).await {
                Ok(record) => {
                    self.touch(key).await;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        key = %key,
                        attempt = backoff.attempt(),
                        max_attempts = self.config.max_attempts,
                        "Tunnel setup attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                    if backoff.has_remaining() {
                        backoff.wait().await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(TunnelError::SetupFailed {
            key: key.to_string(),
            attempts: backoff.attempt(),
            source: Box::new(last_error.unwrap_or_else(|| TunnelError::SetupIncomplete {
                key: key.to_string(),
            })),
        })
    }

    /// One pass of: re-check, lock, open + verify (or wait for the holder)
    async fn attempt_open(&self, key: &TunnelKey) -> Result<TunnelRecord> {
        if let Some(record) = self.find_existing(key).await? {
            return Ok(record);
        }

        let lock_key = key.lock_key();
        if !self
            .locks
            .acquire(&lock_key, self.config.lock.acquire_timeout)
            .await?
        {
            info!(key = %key, "Another process holds the tunnel lock, waiting for its tunnel");
            return self.wait_for_peer(key).await;
        }

        let result = self.open_while_locked(key).await;

        if let Err(e) = self.locks.release(&lock_key).await {
            warn!(key = %key, "Failed to release tunnel lock: {}", e);
        }
        result
    }

    async fn open_while_locked(&self, key: &TunnelKey) -> Result<TunnelRecord> {
        // The previous holder may have finished between our check and acquire
        if let Some(record) = self.describe(key).await? {
            if self.probe.check(&record).await {
                debug!(key = %key, "Tunnel appeared while acquiring lock");
                return Ok(record);
            }
            warn!(key = %key, "Existing tunnel failed health check, recreating");
            self.teardown(key).await?;
        }

        let record = self.opener.open(key).await?;

        if !self.probe.check(&record).await {
            warn!(key = %key, "Freshly opened tunnel failed health check");
            return Err(TunnelError::HealthCheckFailed {
                key: key.to_string(),
            });
        }

        info!(key = %key, "✅ Tunnel ready");
        Ok(record)
    }

    /// Healthy existing record; an unhealthy one is closed and ignored
    async fn find_existing(&self, key: &TunnelKey) -> Result<Option<TunnelRecord>> {
        let Some(record) = self.describe(key).await? else {
            return Ok(None);
        };

        if self.probe.check(&record).await {
            return Ok(Some(record));
        }

        warn!(key = %key, "Existing tunnel failed health check, closing it");
        self.close_locked(key).await?;
        Ok(None)
    }

    /// Poll describe while another process opens the tunnel
    async fn wait_for_peer(&self, key: &TunnelKey) -> Result<TunnelRecord> {
        let deadline = Instant::now() + self.config.peer_wait_timeout;

        loop {
            if let Some(record) = self.describe(key).await? {
                if self.probe.check(&record).await {
                    info!(key = %key, "Tunnel opened by another process");
                    return Ok(record);
                }
                debug!(key = %key, "Peer tunnel not healthy yet");
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TunnelError::LockTimeout {
                    key: key.lock_key(),
                });
            }
            tokio::time::sleep(self.config.peer_poll_interval.min(deadline - now)).await;
        }
    }

    async fn describe(&self, key: &TunnelKey) -> Result<Option<TunnelRecord>> {
        match self.cli.describe(key).await {
            Ok(text) => {
                let record = parse_describe_output(&text);
                Ok((!record.is_empty()).then_some(record))
            }
            Err(CliError::NotFound) => Ok(None),
            Err(e) => Err(TunnelError::Describe(e)),
        }
    }

    /// Renew the idle timer and the advisory activity marker
    async fn touch(self: &Arc<Self>, key: &TunnelKey) {
        let weak = Arc::downgrade(self);
        let fire_key = key.clone();
        self.reaper
            .renew(key.clone(), self.config.idle_timeout, move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.close_idle(&fire_key).await;
                }
            });

        let ttl_secs = self.config.idle_timeout.as_secs().max(1);
        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self
            .locks
            .store()
            .set_with_expiry(&key.activity_key(), &now, ttl_secs)
            .await
        {
            warn!(key = %key, "Failed to record tunnel activity: {}", e);
        }
    }

    async fn close_tunnel(&self, key: &TunnelKey) -> Result<()> {
        let gate = self.gate(key);
        let result = {
            let _guard = gate.lock().await;
            self.close_locked(key).await
        };
        self.prune_gate(key, gate);
        result
    }

    /// Idle timer callback
    async fn close_idle(&self, key: &TunnelKey) {
        let gate = self.gate(key);
        {
            let _guard = gate.lock().await;

            // A lookup that finished while we waited for the gate re-armed the timer
            if self.reaper.is_armed(key) {
                debug!(key = %key, "Tunnel used again before idle teardown, keeping it");
                return;
            }

            if let Err(e) = self.close_locked(key).await {
                warn!(key = %key, "Idle teardown failed: {}", e);
            }
        }
        self.prune_gate(key, gate);
    }

    /// Close under the lock store lock; skipped if another process holds it
    async fn close_locked(&self, key: &TunnelKey) -> Result<()> {
        let lock_key = key.lock_key();
        if !self
            .locks
            .acquire(&lock_key, self.config.lock.close_timeout)
            .await?
        {
            info!(key = %key, "Tunnel lock held elsewhere, skipping close");
            return Ok(());
        }

        let result = self.teardown(key).await;

        if let Err(e) = self.locks.release(&lock_key).await {
            warn!(key = %key, "Failed to release tunnel lock: {}", e);
        }
        result
    }

    /// CLI close plus bookkeeping; caller holds the lock
    async fn teardown(&self, key: &TunnelKey) -> Result<()> {
        info!(key = %key, "Closing tunnel");
        self.cli.close(key).await.map_err(TunnelError::Cli)?;

        if let Err(e) = self.locks.store().delete(&key.activity_key()).await {
            warn!(key = %key, "Failed to clear tunnel activity marker: {}", e);
        }
        self.reaper.disarm(key);
        Ok(())
    }
}
