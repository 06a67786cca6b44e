//! `BusAttachment` - the local owner of names, ports, sessions and listeners.
//!
//! An attachment wires the engine together:
//!
//! ```text
//! Transport --DiscoveryEvent--> NameTable ----+
//!                                             |
//! join_session -> SessionNegotiator           +--> EventDispatcher --> listeners
//!                  |-- SessionPortRegistry    |
//!                  |-- Transport              |
//!                  `-- SessionRegistry -------+
//! ```
//!
//! Every component holds a child of the attachment's cancellation token.
//! [`BusAttachment::teardown`] runs the bounded shutdown sequence; after it
//! starts, every operation returns [`BusError::TornDown`].

use crate::actors::messages::{BusEvent, ListenerId, SessionInfo, Subscriber};
use crate::actors::{EngineMetrics, EngineMetricsSnapshot, EventDispatcher};
use crate::config::AttachmentConfig;
use crate::errors::BusError;
use crate::listeners::{BusListener, SessionListener, SessionLostReason, SessionPortListener};
use crate::name_table::{AdvertisedName, NameTable};
use crate::negotiator::{
    JoinOutcome, JoinRequest, NegotiatorTimeouts, PendingJoin, SessionNegotiator,
};
use crate::observability::metrics as prom;
use crate::ports::SessionPortRegistry;
use crate::sessions::SessionRegistry;
use crate::transport::{DiscoveryEvent, Transport};

use common::names::{validate_name_prefix, validate_well_known_name};
use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What teardown managed to do before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub ports_unbound: Vec<SessionPort>,
    pub joins_cancelled: usize,
    /// Every session that was live, including ones stopped at the deadline.
    pub sessions_destroyed: Vec<SessionId>,
    /// Whether pending listener events drained before the deadline.
    pub events_flushed: bool,
    /// False if any step was cut short by the deadline.
    pub completed_within_deadline: bool,
    pub elapsed_ms: u64,
}

/// Point-in-time view served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentStatus {
    pub unique_name: String,
    pub torn_down: bool,
    pub bound_ports: Vec<SessionPort>,
    pub sessions: Vec<SessionId>,
    pub advertised_names: Vec<AdvertisedName>,
    pub pending_joins: Vec<PendingJoin>,
    pub listeners: usize,
    pub metrics: EngineMetricsSnapshot,
}

/// A local bus attachment.
pub struct BusAttachment {
    config: AttachmentConfig,
    cancel_token: CancellationToken,
    torn_down: AtomicBool,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    names: NameTable,
    ports: Arc<SessionPortRegistry>,
    sessions: Arc<SessionRegistry>,
    negotiator: SessionNegotiator,
    metrics: Arc<EngineMetrics>,
    /// Dispatcher subscription created for each bound port.
    port_listeners: Mutex<HashMap<SessionPort, ListenerId>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl BusAttachment {
    /// Create an attachment over `transport`.
    ///
    /// Must be called inside a Tokio runtime; the event dispatcher is
    /// spawned immediately.
    #[must_use]
    pub fn new(config: AttachmentConfig, transport: Arc<dyn Transport>) -> Self {
        let cancel_token = CancellationToken::new();
        let metrics = EngineMetrics::new();

        let (dispatcher, dispatcher_task) =
            EventDispatcher::spawn(cancel_token.child_token(), Arc::clone(&metrics));
        let names = NameTable::new(
            config.name_table_shards,
            dispatcher.clone(),
            Arc::clone(&metrics),
        );
        let ports = Arc::new(SessionPortRegistry::new(Arc::clone(&metrics)));
        let sessions = Arc::new(SessionRegistry::new(
            config.unique_name.clone(),
            cancel_token.child_token(),
            dispatcher.clone(),
            Arc::clone(&metrics),
        ));
        let negotiator = SessionNegotiator::new(
            Arc::clone(&ports),
            Arc::clone(&sessions),
            Arc::clone(&transport),
            dispatcher.clone(),
            Arc::clone(&metrics),
            NegotiatorTimeouts {
                accept: config.accept_timeout,
                establish: config.establish_timeout,
            },
            cancel_token.child_token(),
        );

        info!(
            target: "bus.attachment",
            unique_name = %config.unique_name,
            shards = config.name_table_shards,
            "Bus attachment created"
        );

        Self {
            config,
            cancel_token,
            torn_down: AtomicBool::new(false),
            transport,
            dispatcher,
            names,
            ports,
            sessions,
            negotiator,
            metrics,
            port_listeners: Mutex::new(HashMap::new()),
            dispatcher_task: Mutex::new(Some(dispatcher_task)),
        }
    }

    fn ensure_live(&self) -> Result<(), BusError> {
        if self.torn_down.load(Ordering::SeqCst) {
            Err(BusError::TornDown)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Token cancelled when teardown finishes.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    // --- Listeners ---

    pub fn register_bus_listener(
        &self,
        listener: Arc<dyn BusListener>,
    ) -> Result<ListenerId, BusError> {
        self.ensure_live()?;
        self.dispatcher.register(Subscriber::Bus(listener))
    }

    pub fn register_session_listener(
        &self,
        listener: Arc<dyn SessionListener>,
    ) -> Result<ListenerId, BusError> {
        self.ensure_live()?;
        self.dispatcher.register(Subscriber::Session(listener))
    }

    /// Stop delivering events to `id`.
    ///
    /// No event enqueued after this returns reaches the listener.
    pub fn unregister_listener(&self, id: ListenerId) -> Result<(), BusError> {
        self.ensure_live()?;
        self.dispatcher.unregister(id)
    }

    // --- Session ports ---

    /// Bind `port` with `listener` as its accept policy.
    ///
    /// `SESSION_PORT_ANY` binds a free port. Returns the bound port.
    pub fn bind_session_port(
        &self,
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, BusError> {
        self.ensure_live()?;
        let port = self.ports.bind(port, opts, Arc::clone(&listener))?;

        match self
            .dispatcher
            .register(Subscriber::SessionPort { port, listener })
        {
            Ok(id) => {
                self.port_listeners.lock().insert(port, id);
                Ok(port)
            }
            Err(e) => {
                // Leave the registry as it was
                let _ = self.ports.unbind(port);
                Err(e)
            }
        }
    }

    /// Unbind `port`. Joins still negotiating against it are rejected
    /// with `Cancelled`; established sessions are unaffected.
    pub fn unbind_session_port(&self, port: SessionPort) -> Result<(), BusError> {
        self.ensure_live()?;
        self.ports.unbind(port)?;

        let cancelled = self.negotiator.cancel_joins_for_port(port);
        if let Some(id) = self.port_listeners.lock().remove(&port) {
            let _ = self.dispatcher.unregister(id);
        }
        if cancelled > 0 {
            debug!(
                target: "bus.attachment",
                port,
                cancelled,
                "Pending joins cancelled by unbind"
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn bound_ports(&self) -> Vec<SessionPort> {
        self.ports.bound_ports()
    }

    // --- Sessions ---

    /// Negotiate a join against one of this attachment's ports.
    pub async fn join_session(&self, request: JoinRequest) -> Result<JoinOutcome, BusError> {
        self.ensure_live()?;
        self.negotiator.negotiate(request).await
    }

    /// Remove `member` from `session_id`, returning the members left.
    pub async fn leave_session(
        &self,
        session_id: SessionId,
        member: &str,
    ) -> Result<usize, BusError> {
        self.ensure_live()?;
        self.sessions
            .remove_member(session_id, member)
            .await
            .inspect_err(|e| prom::record_error("leave_session", e.error_type_label()))
    }

    /// Force-destroy `session_id`.
    pub async fn session_lost(
        &self,
        session_id: SessionId,
        reason: SessionLostReason,
    ) -> Result<SessionInfo, BusError> {
        self.ensure_live()?;
        self.sessions
            .session_lost(session_id, reason)
            .await
            .inspect_err(|e| prom::record_error("session_lost", e.error_type_label()))
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionInfo, BusError> {
        self.ensure_live()?;
        self.sessions.get(session_id).await
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.session_ids()
    }

    #[must_use]
    pub fn pending_joins(&self) -> Vec<PendingJoin> {
        self.negotiator.pending_joins()
    }

    // --- Names ---

    /// Advertise `name` over `transports`.
    pub async fn advertise_name(
        &self,
        name: &str,
        transports: TransportMask,
    ) -> Result<(), BusError> {
        self.ensure_live()?;
        validate_well_known_name(name)?;
        self.transport
            .advertise_name(name, transports)
            .await
            .map_err(|e| BusError::TransportFailure(e.to_string()))?;
        info!(
            target: "bus.attachment",
            name,
            transports = %transports,
            "Advertising name"
        );
        Ok(())
    }

    pub async fn cancel_advertise_name(
        &self,
        name: &str,
        transports: TransportMask,
    ) -> Result<(), BusError> {
        self.ensure_live()?;
        validate_well_known_name(name)?;
        self.transport
            .cancel_advertise_name(name, transports)
            .await
            .map_err(|e| BusError::TransportFailure(e.to_string()))
    }

    /// Ask the transport to report names starting with `prefix`.
    pub async fn find_advertised_name(&self, prefix: &str) -> Result<(), BusError> {
        self.ensure_live()?;
        validate_name_prefix(prefix)?;
        self.transport
            .find_advertised_name(prefix)
            .await
            .map_err(|e| BusError::TransportFailure(e.to_string()))
    }

    pub async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), BusError> {
        self.ensure_live()?;
        validate_name_prefix(prefix)?;
        self.transport
            .cancel_find_advertised_name(prefix)
            .await
            .map_err(|e| BusError::TransportFailure(e.to_string()))
    }

    pub fn record_found(
        &self,
        name: &str,
        transport: TransportMask,
        prefix: &str,
    ) -> Result<(), BusError> {
        self.ensure_live()?;
        self.names.record_found(name, transport, prefix)
    }

    pub fn record_lost(
        &self,
        name: &str,
        transport: TransportMask,
        prefix: &str,
    ) -> Result<(), BusError> {
        self.ensure_live()?;
        self.names.record_lost(name, transport, prefix)
    }

    pub fn owner_changed(
        &self,
        name: &str,
        previous_owner: Option<&str>,
        new_owner: Option<&str>,
    ) -> Result<(), BusError> {
        self.ensure_live()?;
        self.names.owner_changed(name, previous_owner, new_owner)
    }

    /// Drop every name owned by `owner`.
    pub fn owner_disconnected(&self, owner: &str) -> Result<Vec<String>, BusError> {
        self.ensure_live()?;
        Ok(self.names.owner_disconnected(owner))
    }

    /// Transports `name` is advertised over; empty if unknown.
    #[must_use]
    pub fn lookup_name(&self, name: &str) -> TransportMask {
        self.names.lookup(name)
    }

    #[must_use]
    pub fn advertised_name(&self, name: &str) -> Option<AdvertisedName> {
        self.names.entry(name)
    }

    /// Apply one discovery notification to the name table.
    pub fn handle_discovery(&self, event: DiscoveryEvent) -> Result<(), BusError> {
        match event {
            DiscoveryEvent::Found {
                name,
                transport,
                prefix,
            } => self.record_found(&name, transport, &prefix),
            DiscoveryEvent::Lost {
                name,
                transport,
                prefix,
            } => self.record_lost(&name, transport, &prefix),
            DiscoveryEvent::OwnerChanged {
                name,
                previous_owner,
                new_owner,
            } => self.owner_changed(&name, previous_owner.as_deref(), new_owner.as_deref()),
        }
    }

    /// Pump a transport's discovery stream into the name table until the
    /// stream ends or the attachment is torn down.
    pub fn spawn_discovery_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) -> JoinHandle<()> {
        let attachment = Arc::clone(self);
        let cancel_token = self.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = attachment.handle_discovery(event) {
                            if e.is_fatal() {
                                break;
                            }
                            warn!(
                                target: "bus.attachment",
                                error = %e,
                                "Discarding malformed discovery event"
                            );
                        }
                    }
                }
            }
            debug!(target: "bus.attachment", "Discovery pump stopped");
        })
    }

    // --- Events ---

    /// Wait until every event enqueued so far reached every listener.
    pub async fn flush_events(&self) -> Result<(), BusError> {
        self.ensure_live()?;
        self.dispatcher.flush().await
    }

    #[must_use]
    pub fn status(&self) -> AttachmentStatus {
        AttachmentStatus {
            unique_name: self.config.unique_name.clone(),
            torn_down: self.is_torn_down(),
            bound_ports: self.ports.bound_ports(),
            sessions: self.sessions.session_ids(),
            advertised_names: self
                .names
                .names()
                .iter()
                .filter_map(|name| self.names.entry(name))
                .collect(),
            pending_joins: self.negotiator.pending_joins(),
            listeners: self.dispatcher.listener_count(),
            metrics: self.metrics.snapshot(),
        }
    }

    // --- Teardown ---

    /// Shut the attachment down within `deadline`.
    ///
    /// In order: announce `BusStopping`, unbind every port, cancel every
    /// pending join, destroy every hosted session, drain listener queues,
    /// stop all actors. Steps that would overrun the deadline are cut short;
    /// nothing here waits on a peer. A second call returns `TornDown`.
    #[instrument(skip_all, name = "bus.attachment.teardown", fields(unique_name = %self.config.unique_name))]
    pub async fn teardown(&self, deadline: Duration) -> Result<TeardownReport, BusError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Err(BusError::TornDown);
        }
        let started = Instant::now();
        let remaining = || deadline.saturating_sub(started.elapsed());
        let mut within_deadline = true;

        info!(target: "bus.attachment", "Tearing down bus attachment");
        self.dispatcher.enqueue(BusEvent::BusStopping);

        let ports_unbound = self.ports.unbind_all();
        let joins_cancelled = self.negotiator.close();

        let closed = self
            .sessions
            .close_all(SessionLostReason::RemovedByBinder, remaining())
            .await;
        if !closed.forced.is_empty() {
            warn!(
                target: "bus.attachment",
                forced = closed.forced.len(),
                "Session teardown hit deadline"
            );
            within_deadline = false;
        }
        let sessions_destroyed = closed.destroyed;

        let events_flushed = match tokio::time::timeout(remaining(), self.dispatcher.flush()).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(target: "bus.attachment", error = %e, "Dispatcher gone before flush");
                false
            }
            Err(_) => {
                warn!(target: "bus.attachment", "Listener queues not drained before deadline");
                within_deadline = false;
                false
            }
        };

        self.port_listeners.lock().clear();
        self.cancel_token.cancel();

        let dispatcher_task = self.dispatcher_task.lock().take();
        if let Some(task) = dispatcher_task {
            if tokio::time::timeout(remaining(), task).await.is_err() {
                within_deadline = false;
            }
        }

        let elapsed = started.elapsed();
        prom::record_teardown_duration(elapsed);

        let report = TeardownReport {
            ports_unbound,
            joins_cancelled,
            sessions_destroyed,
            events_flushed,
            completed_within_deadline: within_deadline,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            target: "bus.attachment",
            ports = report.ports_unbound.len(),
            joins_cancelled = report.joins_cancelled,
            sessions = report.sessions_destroyed.len(),
            events_flushed = report.events_flushed,
            elapsed_ms = report.elapsed_ms,
            "Bus attachment torn down"
        );
        Ok(report)
    }
}

impl Drop for BusAttachment {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::negotiator::RejectReason;
    use crate::transport::LoopbackTransport;

    struct AcceptAll;

    #[async_trait::async_trait]
    impl SessionPortListener for AcceptAll {
        async fn accept_session_joiner(&self, _p: SessionPort, _j: &str, _o: &SessionOpts) -> bool {
            true
        }
    }

    fn attachment() -> (Arc<BusAttachment>, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (transport, rx) = LoopbackTransport::new();
        let attachment = BusAttachment::new(
            AttachmentConfig::new(":host.1"),
            Arc::new(transport),
        );
        (Arc::new(attachment), rx)
    }

    #[tokio::test]
    async fn test_bind_join_and_unbind() {
        let (bus, _rx) = attachment();
        let port = bus
            .bind_session_port(42, SessionOpts::new(true), Arc::new(AcceptAll))
            .unwrap();
        assert_eq!(port, 42);

        let outcome = bus
            .join_session(JoinRequest::new(42, "peer.A", SessionOpts::new(true)))
            .await
            .unwrap();
        assert!(outcome.is_established());

        bus.unbind_session_port(42).unwrap();
        let outcome = bus
            .join_session(JoinRequest::new(42, "peer.B", SessionOpts::new(true)))
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Rejected(RejectReason::UnregisteredPort));
        assert_eq!(bus.session_ids().len(), 1, "unbind keeps live sessions");
    }

    #[tokio::test]
    async fn test_discovery_pump_feeds_name_table() {
        let (transport, rx) = LoopbackTransport::new();
        let transport = Arc::new(transport);
        let bus = Arc::new(BusAttachment::new(
            AttachmentConfig::new(":host.1"),
            Arc::clone(&transport) as Arc<dyn Transport>,
        ));
        let pump = bus.spawn_discovery_pump(rx);

        bus.find_advertised_name("org.example").await.unwrap();
        bus.advertise_name("org.example.Chat", TransportMask::ANY)
            .await
            .unwrap();

        while bus.lookup_name("org.example.Chat").is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.lookup_name("org.example.Chat"), TransportMask::LOCAL);

        bus.teardown(Duration::from_secs(1)).await.unwrap();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_teardown() {
        let (bus, _rx) = attachment();
        bus.bind_session_port(7, SessionOpts::default(), Arc::new(AcceptAll))
            .unwrap();

        let report = bus.teardown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.ports_unbound, vec![7]);
        assert!(report.completed_within_deadline);

        assert_eq!(
            bus.teardown(Duration::from_secs(1)).await.unwrap_err(),
            BusError::TornDown
        );
        assert_eq!(
            bus.bind_session_port(8, SessionOpts::default(), Arc::new(AcceptAll))
                .unwrap_err(),
            BusError::TornDown
        );
        assert_eq!(
            bus.record_found("org.example.Foo", TransportMask::TCP, "org.")
                .unwrap_err(),
            BusError::TornDown
        );
        assert!(matches!(
            bus.join_session(JoinRequest::new(7, "peer.A", SessionOpts::default()))
                .await,
            Err(BusError::TornDown)
        ));
        assert!(bus.status().torn_down);
    }

    #[tokio::test]
    async fn test_advertise_rejects_bad_name() {
        let (bus, _rx) = attachment();
        assert!(matches!(
            bus.advertise_name("1bad", TransportMask::ANY).await,
            Err(BusError::InvalidName(_))
        ));
        assert!(matches!(
            bus.advertise_name("org.example.Remote", TransportMask::TCP).await,
            Err(BusError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_status_snapshot_serializes() {
        let (bus, _rx) = attachment();
        bus.bind_session_port(42, SessionOpts::new(true), Arc::new(AcceptAll))
            .unwrap();
        bus.record_found("org.example.Foo", TransportMask::TCP, "org.")
            .unwrap();

        let status = bus.status();
        assert_eq!(status.bound_ports, vec![42]);
        assert_eq!(status.listeners, 1);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json.pointer("/unique_name").and_then(serde_json::Value::as_str),
            Some(":host.1")
        );
        assert_eq!(
            json.pointer("/advertised_names/0/name")
                .and_then(serde_json::Value::as_str),
            Some("org.example.Foo")
        );
    }
}
