//! Message types for actor communication.
//!
//! Inter-actor communication uses strongly-typed messages over `tokio::sync::mpsc`.
//! Request-reply uses `tokio::sync::oneshot`.

use crate::errors::BusError;
use crate::listeners::{BusListener, SessionListener, SessionLostReason, SessionPortListener};
use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A notification routed to listeners.
///
/// Carries the same arguments as the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    FoundAdvertisedName {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    LostAdvertisedName {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    NameOwnerChanged {
        name: String,
        previous_owner: Option<String>,
        new_owner: Option<String>,
    },
    SessionLost {
        session_id: SessionId,
        reason: SessionLostReason,
    },
    SessionMemberAdded {
        session_id: SessionId,
        member: String,
    },
    SessionMemberRemoved {
        session_id: SessionId,
        member: String,
    },
    SessionJoined {
        port: SessionPort,
        session_id: SessionId,
        joiner: String,
    },
    BusStopping,
}

impl BusEvent {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            BusEvent::FoundAdvertisedName { .. } => "found_advertised_name",
            BusEvent::LostAdvertisedName { .. } => "lost_advertised_name",
            BusEvent::NameOwnerChanged { .. } => "name_owner_changed",
            BusEvent::SessionLost { .. } => "session_lost",
            BusEvent::SessionMemberAdded { .. } => "session_member_added",
            BusEvent::SessionMemberRemoved { .. } => "session_member_removed",
            BusEvent::SessionJoined { .. } => "session_joined",
            BusEvent::BusStopping => "bus_stopping",
        }
    }

    /// Advertised name the event concerns, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            BusEvent::FoundAdvertisedName { name, .. }
            | BusEvent::LostAdvertisedName { name, .. }
            | BusEvent::NameOwnerChanged { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Identifier handed out by `EventDispatcher::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A registered listener in one of its three roles.
#[derive(Clone)]
pub enum Subscriber {
    /// Receives name events and `BusStopping`.
    Bus(Arc<dyn BusListener>),
    /// Receives session loss and membership events.
    Session(Arc<dyn SessionListener>),
    /// Receives `SessionJoined` for one port.
    SessionPort {
        port: SessionPort,
        listener: Arc<dyn SessionPortListener>,
    },
}

impl Subscriber {
    /// Role label.
    #[must_use]
    pub const fn role(&self) -> &'static str {
        match self {
            Subscriber::Bus(_) => "bus",
            Subscriber::Session(_) => "session",
            Subscriber::SessionPort { .. } => "session_port",
        }
    }

    /// Whether this subscriber wants `event`.
    #[must_use]
    pub fn wants(&self, event: &BusEvent) -> bool {
        match (self, event) {
            (
                Subscriber::Bus(_),
                BusEvent::FoundAdvertisedName { .. }
                | BusEvent::LostAdvertisedName { .. }
                | BusEvent::NameOwnerChanged { .. }
                | BusEvent::BusStopping,
            ) => true,
            (
                Subscriber::Session(_),
                BusEvent::SessionLost { .. }
                | BusEvent::SessionMemberAdded { .. }
                | BusEvent::SessionMemberRemoved { .. },
            ) => true,
            (Subscriber::SessionPort { port, .. }, BusEvent::SessionJoined { port: p, .. }) => {
                port == p
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscriber::SessionPort { port, .. } => {
                f.debug_struct("SessionPort").field("port", port).finish()
            }
            other => f.write_str(other.role()),
        }
    }
}

/// Messages sent to the `EventDispatcher` router.
///
/// Registration and events share one channel so every listener observes
/// the same relative order.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Route an event to interested listeners.
    Event(BusEvent),

    /// Start a delivery actor for a new listener.
    Register {
        id: ListenerId,
        subscriber: Subscriber,
        /// Cancelled when the listener is unregistered.
        cancel_token: CancellationToken,
    },

    /// Stop routing to a listener.
    Unregister { id: ListenerId },

    /// Resolve once every delivery actor has processed everything queued before this.
    Flush { respond_to: oneshot::Sender<()> },
}

/// Messages sent to a `ListenerActor`.
#[derive(Debug)]
pub enum ListenerMessage {
    Deliver(BusEvent),
    Flush { respond_to: oneshot::Sender<()> },
}

/// Messages sent to a `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Add a joiner; idempotent for existing members.
    AddMember {
        member: String,
        port: SessionPort,
        respond_to: oneshot::Sender<Result<SessionInfo, BusError>>,
    },

    /// Remove a member, returning the remaining count.
    RemoveMember {
        member: String,
        respond_to: oneshot::Sender<Result<usize, BusError>>,
    },

    /// Current state.
    GetInfo {
        respond_to: oneshot::Sender<SessionInfo>,
    },

    /// Force destruction regardless of membership.
    Close {
        reason: SessionLostReason,
        respond_to: oneshot::Sender<SessionInfo>,
    },
}

/// Externally visible view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Unique name of the hosting attachment.
    pub host: String,
    pub host_port: SessionPort,
    pub opts: SessionOpts,
    pub is_multipoint: bool,
    /// Joined peers, excluding the host.
    pub members: BTreeSet<String>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl SessionInfo {
    #[must_use]
    pub fn has_member(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait::async_trait]
    impl SessionPortListener for Nop {}

    #[async_trait::async_trait]
    impl BusListener for Nop {}

    #[test]
    fn test_event_kinds_unique() {
        let events = [
            BusEvent::FoundAdvertisedName {
                name: "a.b".into(),
                transport: TransportMask::TCP,
                prefix: "a".into(),
            },
            BusEvent::LostAdvertisedName {
                name: "a.b".into(),
                transport: TransportMask::TCP,
                prefix: "a".into(),
            },
            BusEvent::NameOwnerChanged {
                name: "a.b".into(),
                previous_owner: None,
                new_owner: Some(":1.1".into()),
            },
            BusEvent::SessionLost {
                session_id: SessionId(1),
                reason: SessionLostReason::Other,
            },
            BusEvent::SessionMemberAdded {
                session_id: SessionId(1),
                member: "m".into(),
            },
            BusEvent::SessionMemberRemoved {
                session_id: SessionId(1),
                member: "m".into(),
            },
            BusEvent::SessionJoined {
                port: 1,
                session_id: SessionId(1),
                joiner: "j".into(),
            },
            BusEvent::BusStopping,
        ];
        let kinds: std::collections::HashSet<_> = events.iter().map(BusEvent::kind).collect();
        assert_eq!(kinds.len(), events.len());
        assert_eq!(events.first().and_then(BusEvent::name), Some("a.b"));
        assert_eq!(events.last().and_then(BusEvent::name), None);
    }

    #[test]
    fn test_session_port_subscriber_filters_by_port() {
        let sub = Subscriber::SessionPort {
            port: 42,
            listener: Arc::new(Nop),
        };
        let joined = |port| BusEvent::SessionJoined {
            port,
            session_id: SessionId(3),
            joiner: "peer.A".into(),
        };
        assert!(sub.wants(&joined(42)));
        assert!(!sub.wants(&joined(43)));
        assert!(!sub.wants(&BusEvent::BusStopping));
    }

    #[test]
    fn test_bus_subscriber_routing() {
        let sub = Subscriber::Bus(Arc::new(Nop));
        assert!(sub.wants(&BusEvent::BusStopping));
        assert!(!sub.wants(&BusEvent::SessionLost {
            session_id: SessionId(1),
            reason: SessionLostReason::Other,
        }));
        assert_eq!(format!("{sub:?}"), "bus");
    }
}
