//! Listener contracts exposed to bus users.
//!
//! Three separate roles, each its own trait. A single type may implement
//! all three (see [`crate::session_ops::SessionOps`]) and be registered
//! once per role.
//!
//! Every method has a no-op default so implementors only override the
//! callbacks they care about. Callbacks run on the listener's own delivery
//! task; a slow callback only delays that listener.

use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use serde::Serialize;
use std::fmt;

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLostReason {
    /// The remote end left the session.
    RemoteEndLeftSession,
    /// The remote end closed without leaving.
    RemoteEndClosedAbruptly,
    /// The binder removed this member.
    RemovedByBinder,
    /// The link timed out.
    LinkTimeout,
    /// Anything else, including local teardown.
    Other,
}

impl SessionLostReason {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionLostReason::RemoteEndLeftSession => "remote_end_left_session",
            SessionLostReason::RemoteEndClosedAbruptly => "remote_end_closed_abruptly",
            SessionLostReason::RemovedByBinder => "removed_by_binder",
            SessionLostReason::LinkTimeout => "link_timeout",
            SessionLostReason::Other => "other",
        }
    }
}

impl fmt::Display for SessionLostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery and bus lifecycle notifications.
#[async_trait::async_trait]
pub trait BusListener: Send + Sync {
    /// A name matching a prefix we searched for was found on `transport`.
    async fn found_advertised_name(&self, _name: &str, _transport: TransportMask, _prefix: &str) {}

    /// A previously found name is no longer advertised on `transport`.
    async fn lost_advertised_name(&self, _name: &str, _transport: TransportMask, _prefix: &str) {}

    /// Ownership of a well-known name changed.
    async fn name_owner_changed(
        &self,
        _bus_name: &str,
        _previous_owner: Option<&str>,
        _new_owner: Option<&str>,
    ) {
    }

    /// The attachment is being torn down.
    async fn bus_stopping(&self) {}
}

/// Session lifecycle and membership notifications.
#[async_trait::async_trait]
pub trait SessionListener: Send + Sync {
    async fn session_lost(&self, _session_id: SessionId, _reason: SessionLostReason) {}

    async fn session_member_added(&self, _session_id: SessionId, _unique_name: &str) {}

    async fn session_member_removed(&self, _session_id: SessionId, _unique_name: &str) {}
}

/// Join-request policy and notification for a bound session port.
#[async_trait::async_trait]
pub trait SessionPortListener: Send + Sync {
    /// Decide whether `joiner` may join the session hosted on `port`.
    ///
    /// Rejects by default.
    async fn accept_session_joiner(
        &self,
        _port: SessionPort,
        _joiner: &str,
        _opts: &SessionOpts,
    ) -> bool {
        false
    }

    /// A join accepted by this listener completed.
    async fn session_joined(&self, _port: SessionPort, _session_id: SessionId, _joiner: &str) {}
}
