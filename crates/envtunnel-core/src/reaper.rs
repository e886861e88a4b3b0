//! Idle timers for open tunnels
//!
//! Holds at most one timer per tunnel key. Arming a key that already has a
//! timer cancels the old one first, so a renewal can never cause a double
//! teardown.

use crate::key::TunnelKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct IdleTimer {
    id: u64,
    handle: JoinHandle<()>,
}

/// Per-key idle timers owned by one manager
pub struct IdleReaper {
    timers: Arc<Mutex<HashMap<TunnelKey, IdleTimer>>>,
    next_id: AtomicU64,
}

impl IdleReaper {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule `on_fire` after `duration`, replacing any timer for `key`
    pub fn arm<F, Fut>(&self, key: TunnelKey, duration: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Held across spawn + insert so the task cannot look itself up early
        let Ok(mut timers) = self.timers.lock() else {
            return;
        };

        let registry = Arc::clone(&self.timers);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            // Unregister without aborting this task; a different id means
            // the timer was replaced and this one must not fire
            let still_current = match registry.lock() {
                Ok(mut timers) => {
                    if timers.get(&timer_key).map(|t| t.id) == Some(id) {
                        timers.remove(&timer_key);
                        true
                    } else {
                        false
                    }
                }
                Err(_) => false,
            };

            if still_current {
                info!(key = %timer_key, "Tunnel idle for {:?}, tearing down", duration);
                on_fire().await;
            }
        });

        if let Some(old) = timers.insert(key.clone(), IdleTimer { id, handle }) {
            old.handle.abort();
            debug!(key = %key, "Replaced idle timer ({:?})", duration);
        } else {
            debug!(key = %key, "Armed idle timer ({:?})", duration);
        }
    }

    /// Cancel the timer for `key`; `true` if one was armed
    pub fn disarm(&self, key: &TunnelKey) -> bool {
        let Ok(mut timers) = self.timers.lock() else {
            return false;
        };
        match timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                debug!(key = %key, "Disarmed idle timer");
                true
            }
            None => false,
        }
    }

    /// Cancel then re-arm
    pub fn renew<F, Fut>(&self, key: TunnelKey, duration: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm(&key);
        self.arm(key, duration, on_fire);
    }

    pub fn is_armed(&self, key: &TunnelKey) -> bool {
        self.timers
            .lock()
            .map(|timers| timers.contains_key(key))
            .unwrap_or(false)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().map(|timers| timers.len()).unwrap_or(0)
    }

    /// Cancel every timer
    pub fn disarm_all(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, timer) in timers.drain() {
                timer.handle.abort();
            }
        }
    }
}

impl Default for IdleReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
