//! `SessionPortRegistry` - bound session ports and their accept policies.
//!
//! Port bindings live behind one short, non-async critical section.
//! Dispatching a join request copies the binding out first and consults
//! the listener's policy with no lock held, so a slow policy never blocks
//! bind or unbind on other ports.

use crate::actors::EngineMetrics;
use crate::errors::BusError;
use crate::listeners::SessionPortListener;

use common::types::{SessionOpts, SessionPort, SESSION_PORT_ANY};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A bound port.
#[derive(Clone)]
pub struct PortBinding {
    pub port: SessionPort,
    /// Options offered by the host; joiners must be compatible.
    pub opts: SessionOpts,
    pub listener: Arc<dyn SessionPortListener>,
}

impl fmt::Debug for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortBinding")
            .field("port", &self.port)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

/// Result of consulting a port's policy.
#[derive(Debug, Clone)]
pub enum JoinDecision {
    /// Policy accepted; carries the binding that accepted.
    Accepted(PortBinding),
    /// Policy declined.
    Declined,
    /// Nothing is bound to the port.
    UnregisteredPort,
    /// Joiner options do not overlap the host options; policy not consulted.
    IncompatibleOptions,
}

impl JoinDecision {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, JoinDecision::Accepted(_))
    }
}

#[derive(Default)]
struct PortTable {
    bindings: BTreeMap<SessionPort, PortBinding>,
    /// Last port handed out for `SESSION_PORT_ANY`.
    ephemeral_cursor: SessionPort,
}

impl PortTable {
    /// Next free port after the cursor, wrapping and skipping 0.
    ///
    /// Every port is tried once, the cursor itself last.
    fn allocate(&mut self) -> Option<SessionPort> {
        let mut candidate = self.ephemeral_cursor;
        for _ in 0..=u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == SESSION_PORT_ANY {
                continue;
            }
            if !self.bindings.contains_key(&candidate) {
                self.ephemeral_cursor = candidate;
                return Some(candidate);
            }
        }
        None
    }
}

/// Registry of bound session ports.
pub struct SessionPortRegistry {
    table: RwLock<PortTable>,
    metrics: Arc<EngineMetrics>,
}

impl SessionPortRegistry {
    #[must_use]
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            table: RwLock::new(PortTable::default()),
            metrics,
        }
    }

    /// Bind `port` (or a free port for `SESSION_PORT_ANY`).
    ///
    /// Returns the bound port.
    pub fn bind(
        &self,
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, BusError> {
        let mut table = self.table.write();
        let port = if port == SESSION_PORT_ANY {
            table
                .allocate()
                .ok_or_else(|| BusError::Internal("no free session ports".to_string()))?
        } else if table.bindings.contains_key(&port) {
            return Err(BusError::PortInUse(port));
        } else {
            port
        };

        table.bindings.insert(
            port,
            PortBinding {
                port,
                opts,
                listener,
            },
        );
        drop(table);

        self.metrics.port_bound();
        info!(
            target: "bus.ports",
            port,
            multipoint = opts.is_multipoint,
            transports = %opts.transports,
            "Session port bound"
        );
        Ok(port)
    }

    /// Unbind `port`, returning its binding.
    pub fn unbind(&self, port: SessionPort) -> Result<PortBinding, BusError> {
        let binding = self
            .table
            .write()
            .bindings
            .remove(&port)
            .ok_or_else(|| BusError::port_not_found(port))?;

        self.metrics.port_unbound();
        info!(target: "bus.ports", port, "Session port unbound");
        Ok(binding)
    }

    /// Unbind every port, returning the ports released.
    pub fn unbind_all(&self) -> Vec<SessionPort> {
        let bindings = std::mem::take(&mut self.table.write().bindings);
        for _ in &bindings {
            self.metrics.port_unbound();
        }
        bindings.into_keys().collect()
    }

    /// Consult the policy bound to `port` for a join from `joiner`.
    ///
    /// Never mutates the registry.
    pub async fn dispatch_join_request(
        &self,
        port: SessionPort,
        joiner: &str,
        opts: &SessionOpts,
    ) -> JoinDecision {
        let Some(binding) = self.binding(port) else {
            debug!(
                target: "bus.ports",
                port,
                joiner,
                "Rejecting join attempt to unregistered port"
            );
            return JoinDecision::UnregisteredPort;
        };

        if !opts.is_compatible(&binding.opts) {
            debug!(
                target: "bus.ports",
                port,
                joiner,
                "Rejecting join with incompatible session options"
            );
            return JoinDecision::IncompatibleOptions;
        }

        if binding
            .listener
            .accept_session_joiner(port, joiner, opts)
            .await
        {
            JoinDecision::Accepted(binding)
        } else {
            JoinDecision::Declined
        }
    }

    /// Current binding for `port`.
    #[must_use]
    pub fn binding(&self, port: SessionPort) -> Option<PortBinding> {
        self.table.read().bindings.get(&port).cloned()
    }

    #[must_use]
    pub fn is_bound(&self, port: SessionPort) -> bool {
        self.table.read().bindings.contains_key(&port)
    }

    /// Bound ports in ascending order.
    #[must_use]
    pub fn bound_ports(&self) -> Vec<SessionPort> {
        self.table.read().bindings.keys().copied().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::TransportMask;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Policy {
        accept: bool,
        calls: AtomicUsize,
    }

    impl Policy {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl SessionPortListener for Policy {
        async fn accept_session_joiner(&self, _p: SessionPort, _j: &str, _o: &SessionOpts) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    fn registry() -> SessionPortRegistry {
        SessionPortRegistry::new(EngineMetrics::new())
    }

    #[test]
    fn test_bind_and_unbind() {
        let registry = registry();
        let opts = SessionOpts::new(true);

        assert_eq!(registry.bind(42, opts, Policy::new(true)).unwrap(), 42);
        assert_eq!(
            registry.bind(42, opts, Policy::new(true)).unwrap_err(),
            BusError::PortInUse(42)
        );
        assert!(registry.is_bound(42));

        registry.unbind(42).unwrap();
        assert!(!registry.is_bound(42));
        assert!(matches!(registry.unbind(42), Err(BusError::NotFound(_))));
    }

    #[test]
    fn test_bind_any_allocates_distinct_ports() {
        let registry = registry();
        let opts = SessionOpts::default();

        registry.bind(1, opts, Policy::new(true)).unwrap();
        let a = registry.bind(SESSION_PORT_ANY, opts, Policy::new(true)).unwrap();
        let b = registry.bind(SESSION_PORT_ANY, opts, Policy::new(true)).unwrap();

        assert_ne!(a, SESSION_PORT_ANY);
        assert_ne!(a, 1, "explicitly bound port is skipped");
        assert_ne!(a, b);
        assert_eq!(registry.bound_ports().len(), 3);
    }

    #[test]
    fn test_bind_any_reuses_last_allocated_port_when_only_one_free() {
        let registry = registry();
        let opts = SessionOpts::default();
        let policy = Policy::new(true);

        let first = registry
            .bind(SESSION_PORT_ANY, opts, policy.clone())
            .unwrap();
        assert_eq!(first, 1);
        for port in 2..=u16::MAX {
            registry.bind(port, opts, policy.clone()).unwrap();
        }
        assert!(matches!(
            registry.bind(SESSION_PORT_ANY, opts, policy.clone()),
            Err(BusError::Internal(_))
        ));

        registry.unbind(first).unwrap();
        assert_eq!(
            registry.bind(SESSION_PORT_ANY, opts, policy).unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn test_dispatch_outcomes() {
        let registry = registry();
        let accept = Policy::new(true);
        let decline = Policy::new(false);
        let host = SessionOpts::new(true).with_transports(TransportMask::TCP);

        registry.bind(42, host, accept.clone()).unwrap();
        registry.bind(43, host, decline.clone()).unwrap();

        let joiner = SessionOpts::new(true);
        assert!(registry
            .dispatch_join_request(42, "peer.A", &joiner)
            .await
            .is_accepted());
        assert!(matches!(
            registry.dispatch_join_request(43, "peer.A", &joiner).await,
            JoinDecision::Declined
        ));
        assert!(matches!(
            registry.dispatch_join_request(44, "peer.A", &joiner).await,
            JoinDecision::UnregisteredPort
        ));

        let udp = SessionOpts::new(true).with_transports(TransportMask::UDP);
        assert!(matches!(
            registry.dispatch_join_request(42, "peer.A", &udp).await,
            JoinDecision::IncompatibleOptions
        ));
        assert_eq!(accept.calls.load(Ordering::SeqCst), 1);
        assert_eq!(decline.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_joinable_iff_bound() {
        let registry = registry();
        let opts = SessionOpts::default();

        for round in 0..3 {
            registry.bind(7, opts, Policy::new(true)).unwrap();
            assert!(
                registry
                    .dispatch_join_request(7, "peer.A", &opts)
                    .await
                    .is_accepted(),
                "round {round}: bound port must be joinable"
            );
            registry.unbind(7).unwrap();
            assert!(matches!(
                registry.dispatch_join_request(7, "peer.A", &opts).await,
                JoinDecision::UnregisteredPort
            ));
        }
    }

    #[test]
    fn test_unbind_all() {
        let registry = registry();
        registry.bind(5, SessionOpts::default(), Policy::new(true)).unwrap();
        registry.bind(6, SessionOpts::default(), Policy::new(true)).unwrap();

        assert_eq!(registry.unbind_all(), vec![5, 6]);
        assert!(registry.bound_ports().is_empty());
    }
}
