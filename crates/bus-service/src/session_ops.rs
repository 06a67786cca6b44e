//! `SessionOps` - application-side coordinator for the three listener roles.
//!
//! One `SessionOps` is registered once per role (bus, session, session port)
//! and keeps the application's view of the bus: names discovered, sessions
//! joined on its ports and their members. Its accept policy admits joiners
//! only on ports it was told to host.

use crate::listeners::{BusListener, SessionListener, SessionLostReason, SessionPortListener};

use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A session joined through one of the hosted ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedSession {
    pub port: SessionPort,
    pub members: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct OpsState {
    hosted_ports: BTreeSet<SessionPort>,
    discovered: BTreeMap<String, TransportMask>,
    sessions: BTreeMap<SessionId, JoinedSession>,
}

#[derive(Debug, Default)]
pub struct SessionOps {
    state: Mutex<OpsState>,
    bus_stopping: AtomicBool,
}

impl SessionOps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit joiners on `port`.
    pub fn host_port(&self, port: SessionPort) {
        self.state.lock().hosted_ports.insert(port);
    }

    /// Stop admitting joiners on `port`.
    pub fn stop_hosting(&self, port: SessionPort) -> bool {
        self.state.lock().hosted_ports.remove(&port)
    }

    #[must_use]
    pub fn is_hosting(&self, port: SessionPort) -> bool {
        self.state.lock().hosted_ports.contains(&port)
    }

    /// Names currently discovered and the transports they were seen on.
    #[must_use]
    pub fn discovered_names(&self) -> BTreeMap<String, TransportMask> {
        self.state.lock().discovered.clone()
    }

    #[must_use]
    pub fn sessions(&self) -> BTreeMap<SessionId, JoinedSession> {
        self.state.lock().sessions.clone()
    }

    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<JoinedSession> {
        self.state.lock().sessions.get(&session_id).cloned()
    }

    #[must_use]
    pub fn bus_stopping(&self) -> bool {
        self.bus_stopping.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BusListener for SessionOps {
    async fn found_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        info!(target: "bus.ops", name, transport = %transport, prefix, "Discovered name");
        *self
            .state
            .lock()
            .discovered
            .entry(name.to_string())
            .or_default() |= transport;
    }

    async fn lost_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        info!(target: "bus.ops", name, prefix, "Lost advertised name");
        let mut state = self.state.lock();
        let emptied = match state.discovered.get_mut(name) {
            Some(mask) => {
                *mask = mask.without(transport);
                mask.is_empty()
            }
            None => false,
        };
        if emptied {
            state.discovered.remove(name);
        }
    }

    async fn name_owner_changed(
        &self,
        bus_name: &str,
        previous_owner: Option<&str>,
        new_owner: Option<&str>,
    ) {
        debug!(
            target: "bus.ops",
            name = bus_name,
            old_owner = previous_owner.unwrap_or(""),
            new_owner = new_owner.unwrap_or(""),
            "Name owner changed"
        );
    }

    async fn bus_stopping(&self) {
        info!(target: "bus.ops", "Bus stopping");
        self.bus_stopping.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SessionListener for SessionOps {
    async fn session_lost(&self, session_id: SessionId, reason: SessionLostReason) {
        if self.state.lock().sessions.remove(&session_id).is_some() {
            info!(target: "bus.ops", session_id = %session_id, reason = %reason, "Session lost");
        } else {
            debug!(
                target: "bus.ops",
                session_id = %session_id,
                "Session lost for unknown session id"
            );
        }
    }

    async fn session_member_added(&self, session_id: SessionId, member: &str) {
        info!(target: "bus.ops", session_id = %session_id, member, "Member added to session");
        if let Some(session) = self.state.lock().sessions.get_mut(&session_id) {
            session.members.insert(member.to_string());
        }
    }

    async fn session_member_removed(&self, session_id: SessionId, member: &str) {
        info!(target: "bus.ops", session_id = %session_id, member, "Member removed from session");
        if let Some(session) = self.state.lock().sessions.get_mut(&session_id) {
            session.members.remove(member);
        }
    }
}

#[async_trait::async_trait]
impl SessionPortListener for SessionOps {
    async fn accept_session_joiner(
        &self,
        port: SessionPort,
        joiner: &str,
        _opts: &SessionOpts,
    ) -> bool {
        let accepted = self.is_hosting(port);
        if accepted {
            info!(target: "bus.ops", port, joiner, "Accepting join request");
        } else {
            info!(target: "bus.ops", port, joiner, "Rejecting join attempt to unregistered port");
        }
        accepted
    }

    async fn session_joined(&self, port: SessionPort, session_id: SessionId, joiner: &str) {
        info!(target: "bus.ops", port, session_id = %session_id, joiner, "Session joined");
        self.state
            .lock()
            .sessions
            .entry(session_id)
            .or_insert_with(|| JoinedSession {
                port,
                members: BTreeSet::new(),
            })
            .members
            .insert(joiner.to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_policy_follows_hosted_ports() {
        let ops = SessionOps::new();
        let opts = SessionOpts::default();
        assert!(!ops.accept_session_joiner(42, "peer.A", &opts).await);

        ops.host_port(42);
        assert!(ops.accept_session_joiner(42, "peer.A", &opts).await);
        assert!(!ops.accept_session_joiner(43, "peer.A", &opts).await);

        assert!(ops.stop_hosting(42));
        assert!(!ops.accept_session_joiner(42, "peer.A", &opts).await);
    }

    #[tokio::test]
    async fn test_tracks_discovered_names_per_transport() {
        let ops = SessionOps::new();
        ops.found_advertised_name("org.example.Foo", TransportMask::TCP, "org.")
            .await;
        ops.found_advertised_name("org.example.Foo", TransportMask::UDP, "org.")
            .await;
        assert_eq!(
            ops.discovered_names().get("org.example.Foo"),
            Some(&TransportMask::IP)
        );

        ops.lost_advertised_name("org.example.Foo", TransportMask::TCP, "org.")
            .await;
        assert_eq!(
            ops.discovered_names().get("org.example.Foo"),
            Some(&TransportMask::UDP)
        );
        ops.lost_advertised_name("org.example.Foo", TransportMask::UDP, "org.")
            .await;
        assert!(ops.discovered_names().is_empty());
    }

    #[tokio::test]
    async fn test_tracks_session_membership() {
        let ops = SessionOps::new();
        let id = SessionId(1);

        ops.session_joined(42, id, "peer.A").await;
        ops.session_member_added(id, "peer.B").await;
        assert_eq!(ops.session(id).unwrap().members.len(), 2);

        ops.session_member_removed(id, "peer.A").await;
        assert_eq!(
            ops.session(id).unwrap().members.into_iter().collect::<Vec<_>>(),
            vec!["peer.B".to_string()]
        );

        ops.session_lost(id, SessionLostReason::RemoteEndClosedAbruptly)
            .await;
        assert!(ops.sessions().is_empty());
        // Unknown ids are tolerated
        ops.session_lost(id, SessionLostReason::Other).await;
    }
}
