//! Actor metrics and mailbox monitoring.
//!
//! Provides mailbox depth monitoring with per-actor-type thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Dispatcher | < 1000 | 1000-5000 | > 5000 |
//! | Session    | < 100  | 100-500 | > 500    |
//! | Listener   | < 100  | 100-1000 | > 1000  |
//!
//! Gauges mirrored to Prometheus use the `bus_` prefix.

use crate::observability::metrics as prom;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the dispatcher router.
pub const DISPATCHER_MAILBOX_NORMAL: usize = 1000;
pub const DISPATCHER_MAILBOX_WARNING: usize = 5000;

/// Mailbox depth thresholds for session actors.
pub const SESSION_MAILBOX_NORMAL: usize = 100;
pub const SESSION_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for listener delivery actors.
pub const LISTENER_MAILBOX_NORMAL: usize = 100;
pub const LISTENER_MAILBOX_WARNING: usize = 1000;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `EventDispatcher` router (one per attachment).
    Dispatcher,
    /// `SessionActor` (one per live session).
    Session,
    /// `ListenerActor` (one per registered listener).
    Listener,
}

impl ActorType {
    /// Returns the actor type as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Dispatcher => "dispatcher",
            ActorType::Session => "session",
            ActorType::Listener => "listener",
        }
    }

    /// Returns the warning threshold for this actor type.
    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Dispatcher => DISPATCHER_MAILBOX_WARNING,
            ActorType::Session => SESSION_MAILBOX_WARNING,
            ActorType::Listener => LISTENER_MAILBOX_WARNING,
        }
    }

    /// Returns the normal threshold for this actor type.
    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Dispatcher => DISPATCHER_MAILBOX_NORMAL,
            ActorType::Session => SESSION_MAILBOX_NORMAL,
            ActorType::Listener => LISTENER_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    /// Below normal threshold.
    Normal,
    /// Between normal and warning thresholds.
    Warning,
    /// Above warning threshold.
    Critical,
}

/// Mailbox monitor for tracking queue depth.
///
/// Shared between the producer side (which records enqueues) and the actor
/// (which records dequeues), so depth reflects messages actually waiting.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    /// Create a new mailbox monitor for the given actor.
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "bus.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            // Log once when crossing into the warning band
            debug!(
                target: "bus.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
        }
    }

    /// Record a message being removed from the mailbox (processed).
    pub fn record_dequeue(&self) {
        // Saturate so a dequeue racing ahead of its enqueue record never wraps
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current mailbox depth.
    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Get the peak mailbox depth.
    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    /// Get total messages processed.
    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Get the current mailbox level.
    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Engine-wide counters, shared by every component of one attachment.
///
/// Gauges are mirrored to Prometheus on every change; the atomics back the
/// `/status` snapshot and tests.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    active_sessions: AtomicU64,
    pending_joins: AtomicU64,
    bound_ports: AtomicU64,
    advertised_names: AtomicU64,
    joins_established: AtomicU64,
    joins_rejected: AtomicU64,
    joins_failed: AtomicU64,
    events_dispatched: AtomicU64,
    actor_panics: AtomicU64,
}

/// Snapshot of engine metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub active_sessions: u64,
    pub pending_joins: u64,
    pub bound_ports: u64,
    pub advertised_names: u64,
    pub joins_established: u64,
    pub joins_rejected: u64,
    pub joins_failed: u64,
    pub events_dispatched: u64,
    pub actor_panics: u64,
}

fn decrement(counter: &AtomicU64) -> u64 {
    let prev = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        })
        .unwrap_or(0);
    prev.saturating_sub(1)
}

impl EngineMetrics {
    /// Create a new shared metrics instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_created(&self) {
        let n = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        prom::set_sessions_active(n);
    }

    pub fn session_destroyed(&self) {
        prom::set_sessions_active(decrement(&self.active_sessions));
    }

    pub fn join_started(&self) {
        let n = self.pending_joins.fetch_add(1, Ordering::SeqCst) + 1;
        prom::set_pending_joins(n);
    }

    pub fn join_finished(&self) {
        prom::set_pending_joins(decrement(&self.pending_joins));
    }

    pub fn port_bound(&self) {
        let n = self.bound_ports.fetch_add(1, Ordering::SeqCst) + 1;
        prom::set_ports_bound(n);
    }

    pub fn port_unbound(&self) {
        prom::set_ports_bound(decrement(&self.bound_ports));
    }

    pub fn name_added(&self) {
        let n = self.advertised_names.fetch_add(1, Ordering::SeqCst) + 1;
        prom::set_advertised_names(n);
    }

    pub fn name_removed(&self) {
        prom::set_advertised_names(decrement(&self.advertised_names));
    }

    pub fn record_join_established(&self) {
        self.joins_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_rejected(&self) {
        self.joins_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join_failed(&self) {
        self.joins_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_dispatched(&self, kind: &'static str) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        prom::record_event_dispatched(kind);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "bus.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending_joins(&self) -> u64 {
        self.pending_joins.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn bound_ports(&self) -> u64 {
        self.bound_ports.load(Ordering::SeqCst)
    }

    /// Take a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
            pending_joins: self.pending_joins.load(Ordering::SeqCst),
            bound_ports: self.bound_ports.load(Ordering::SeqCst),
            advertised_names: self.advertised_names.load(Ordering::SeqCst),
            joins_established: self.joins_established.load(Ordering::Relaxed),
            joins_rejected: self.joins_rejected.load(Ordering::Relaxed),
            joins_failed: self.joins_failed.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            actor_panics: self.actor_panics.load(Ordering::Relaxed),
        }
    }
}
