//! Target policy: which TCP targets a tunnel may dial, and how many tunnels
//! may be open at once.
//!
//! - [`TargetPolicy`] is the plain configuration.
//! - [`TargetPolicyEnforcer`] owns the policy plus an atomic connection
//!   counter and performs the checks at runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sprites_proxy_core::{InitRequest, ProxyError, ProxyResult};

/// Static access-control configuration for tunnel targets.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    /// When set, the only target port a tunnel may request.
    pub allowed_port: Option<u16>,
    /// Maximum number of concurrently open client connections.
    pub max_connections: usize,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            allowed_port: None,
            max_connections: 256,
        }
    }
}

/// Runtime policy enforcer with atomic connection tracking.
pub struct TargetPolicyEnforcer {
    policy: TargetPolicy,
    active_connections: Arc<AtomicUsize>,
}

impl TargetPolicyEnforcer {
    pub fn new(policy: TargetPolicy) -> Self {
        Self {
            policy,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Check an init request against the policy.
    ///
    /// Port restriction first, then loopback restriction.
    pub fn check_target(&self, init: &InitRequest) -> ProxyResult<()> {
        if let Some(allowed) = self.policy.allowed_port {
            if init.port != allowed {
                return Err(ProxyError::PolicyDenied(format!(
                    "port {} not allowed (only {allowed})",
                    init.port
                )));
            }
        }

        if !init.is_loopback() {
            return Err(ProxyError::PolicyDenied(format!(
                "host {:?} is not loopback",
                init.host
            )));
        }

        Ok(())
    }

    /// Claim a connection slot. Returns `None` when the limit is reached.
    ///
    /// The guard releases the slot on drop and is `Send`, so it can move into
    /// the spawned connection task.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let max = self.policy.max_connections;
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                counter: self.active_connections.clone(),
            })
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// RAII guard that decrements the connection count on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
