//! Listener that records every callback it receives.
//!
//! Implements all three listener roles. Its accept policy is configurable,
//! and each callback can be slowed down to simulate a lagging consumer.
//!
//! # Example
//!
//! ```rust,ignore
//! use bus_test_utils::RecordingListener;
//!
//! let listener = RecordingListener::accepting();
//! bus.register_bus_listener(listener.clone()).unwrap();
//!
//! // ... drive the bus ...
//!
//! let events = listener.wait_for_events(2, Duration::from_secs(1)).await;
//! ```

use bus_service::actors::BusEvent;
use bus_service::listeners::{
    BusListener, SessionListener, SessionLostReason, SessionPortListener,
};
use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How the listener answers join requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPolicy {
    AcceptAll,
    RejectAll,
    /// Never answers.
    Hang,
    /// Answers `true` after the delay.
    AcceptAfter(Duration),
}

/// A join request the policy was asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAttempt {
    pub port: SessionPort,
    pub joiner: String,
    pub opts: SessionOpts,
}

#[derive(Debug)]
pub struct RecordingListener {
    policy: AcceptPolicy,
    callback_delay: Option<Duration>,
    events: Mutex<Vec<BusEvent>>,
    join_attempts: Mutex<Vec<JoinAttempt>>,
    changed: Notify,
}

impl RecordingListener {
    #[must_use]
    pub fn new(policy: AcceptPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            callback_delay: None,
            events: Mutex::new(Vec::new()),
            join_attempts: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    /// Listener whose policy accepts every joiner.
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Self::new(AcceptPolicy::AcceptAll)
    }

    /// Listener whose policy rejects every joiner.
    #[must_use]
    pub fn rejecting() -> Arc<Self> {
        Self::new(AcceptPolicy::RejectAll)
    }

    /// Listener whose policy never answers.
    #[must_use]
    pub fn hanging() -> Arc<Self> {
        Self::new(AcceptPolicy::Hang)
    }

    /// Listener that sleeps `delay` inside every event callback.
    #[must_use]
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            policy: AcceptPolicy::AcceptAll,
            callback_delay: Some(delay),
            events: Mutex::new(Vec::new()),
            join_attempts: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    /// Events received so far, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind (see `BusEvent::kind`).
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<BusEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn join_attempts(&self) -> Vec<JoinAttempt> {
        self.join_attempts.lock().clone()
    }

    /// Wait until at least `count` events were recorded and return them all.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` elapses first.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<BusEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let events = self.events.lock();
                if events.len() >= count {
                    return events.clone();
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!(
                    "timed out waiting for {count} events, got {:?}",
                    self.events()
                );
            }
        }
    }

    /// Wait until the policy has been consulted `count` times.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` elapses first.
    pub async fn wait_for_join_attempts(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.join_attempts.lock().len() >= count {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!("timed out waiting for {count} join attempts");
            }
        }
    }

    async fn record(&self, event: BusEvent) {
        if let Some(delay) = self.callback_delay {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().push(event);
        self.changed.notify_waiters();
    }
}

#[async_trait::async_trait]
impl BusListener for RecordingListener {
    async fn found_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        self.record(BusEvent::FoundAdvertisedName {
            name: name.to_string(),
            transport,
            prefix: prefix.to_string(),
        })
        .await;
    }

    async fn lost_advertised_name(&self, name: &str, transport: TransportMask, prefix: &str) {
        self.record(BusEvent::LostAdvertisedName {
            name: name.to_string(),
            transport,
            prefix: prefix.to_string(),
        })
        .await;
    }

    async fn name_owner_changed(
        &self,
        bus_name: &str,
        previous_owner: Option<&str>,
        new_owner: Option<&str>,
    ) {
        self.record(BusEvent::NameOwnerChanged {
            name: bus_name.to_string(),
            previous_owner: previous_owner.map(str::to_string),
            new_owner: new_owner.map(str::to_string),
        })
        .await;
    }

    async fn bus_stopping(&self) {
        self.record(BusEvent::BusStopping).await;
    }
}

#[async_trait::async_trait]
impl SessionListener for RecordingListener {
    async fn session_lost(&self, session_id: SessionId, reason: SessionLostReason) {
        self.record(BusEvent::SessionLost { session_id, reason }).await;
    }

    async fn session_member_added(&self, session_id: SessionId, unique_name: &str) {
        self.record(BusEvent::SessionMemberAdded {
            session_id,
            member: unique_name.to_string(),
        })
        .await;
    }

    async fn session_member_removed(&self, session_id: SessionId, unique_name: &str) {
        self.record(BusEvent::SessionMemberRemoved {
            session_id,
            member: unique_name.to_string(),
        })
        .await;
    }
}

#[async_trait::async_trait]
impl SessionPortListener for RecordingListener {
    async fn accept_session_joiner(
        &self,
        port: SessionPort,
        joiner: &str,
        opts: &SessionOpts,
    ) -> bool {
        self.join_attempts.lock().push(JoinAttempt {
            port,
            joiner: joiner.to_string(),
            opts: *opts,
        });
        self.changed.notify_waiters();

        match self.policy {
            AcceptPolicy::AcceptAll => true,
            AcceptPolicy::RejectAll => false,
            AcceptPolicy::Hang => std::future::pending().await,
            AcceptPolicy::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    async fn session_joined(&self, port: SessionPort, session_id: SessionId, joiner: &str) {
        self.record(BusEvent::SessionJoined {
            port,
            session_id,
            joiner: joiner.to_string(),
        })
        .await;
    }
}
