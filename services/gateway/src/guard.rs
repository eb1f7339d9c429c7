//! Per-address failure counting and temporary blocking.
//!
//! Expiry is lazy: an expired block is purged, together with the failure
//! counter, the next time the address is checked. Both maps sit behind one
//! lock so that purge is atomic.

use crate::config::GuardConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Default)]
struct GuardState {
    failures: HashMap<IpAddr, u32>,
    blocked_until: HashMap<IpAddr, Instant>,
}

impl GuardState {
    /// Drop an expired block and its counter. Returns whether a block is
    /// still in force.
    fn purge_expired(&mut self, addr: IpAddr, now: Instant) -> bool {
        match self.blocked_until.get(&addr) {
            Some(&until) if now < until => true,
            Some(_) => {
                self.blocked_until.remove(&addr);
                self.failures.remove(&addr);
                false
            }
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct AbuseGuard {
    state: Arc<Mutex<GuardState>>,
    max_failures: u32,
    block_for: Duration,
}

impl Default for AbuseGuard {
    fn default() -> Self {
        AbuseGuard::new(GuardConfig::default())
    }
}

impl AbuseGuard {
    pub fn new(cfg: GuardConfig) -> Self {
        AbuseGuard {
            state: Arc::new(Mutex::new(GuardState::default())),
            max_failures: cfg.max_failures,
            block_for: cfg.block_for,
        }
    }

    /// True while a block for `addr` is in force.
    pub async fn is_blocked(&self, addr: IpAddr) -> bool {
        self.state
            .lock()
            .await
            .purge_expired(addr, Instant::now())
    }

    /// Count one failure; installs a block when the threshold is reached.
    ///
    /// Returns whether the address is blocked afterwards.
    pub async fn record_failure(&self, addr: IpAddr) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let already = state.purge_expired(addr, now);
        let count = state.failures.entry(addr).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        if already {
            return true;
        }
        if count < self.max_failures {
            return false;
        }
        state.blocked_until.insert(addr, now + self.block_for);
        warn!(peer = %addr, failures = count, block_secs = self.block_for.as_secs(), "address blocked");
        true
    }

    /// Forget past failures for `addr` (a login was accepted).
    pub async fn record_success(&self, addr: IpAddr) {
        self.state.lock().await.failures.remove(&addr);
    }

    pub async fn failure_count(&self, addr: IpAddr) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }
}
