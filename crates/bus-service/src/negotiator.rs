//! `SessionNegotiator` - join protocol state machine.
//!
//! Every join runs through:
//!
//! ```text
//! Requested -> PolicyEvaluating -> Accepted -> Establishing -> Established
//!                     |                             |
//!                     +--------> Rejected <---------+
//! ```
//!
//! The only suspension points are the accept policy and transport
//! establishment. Both are bounded by timeouts and both race the join's
//! cancellation token, so teardown or unbind can force a `Rejected`
//! at any time.
//!
//! The session registry is touched only after establishment succeeds, so
//! no caller can observe a session whose negotiation later fails. The
//! registry step and its `SessionJoined` event run in their own task: once
//! started they finish together even if the negotiating future is dropped.
//! A failed join never affects other joins or existing sessions.

use crate::actors::messages::{BusEvent, SessionInfo};
use crate::actors::{EngineMetrics, EventDispatcher};
use crate::errors::BusError;
use crate::observability::metrics as prom;
use crate::ports::{JoinDecision, SessionPortRegistry};
use crate::sessions::SessionRegistry;
use crate::transport::{EstablishRequest, Transport};

use common::names::validate_bus_name;
use common::types::{SessionId, SessionOpts, SessionPort};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Negotiation state of one pending join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Requested,
    PolicyEvaluating,
    Accepted,
    Establishing,
    Established,
    Rejected,
}

impl JoinState {
    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(self, next: JoinState) -> bool {
        matches!(
            (self, next),
            (JoinState::Requested, JoinState::PolicyEvaluating | JoinState::Rejected)
                | (JoinState::PolicyEvaluating, JoinState::Accepted | JoinState::Rejected)
                | (JoinState::Accepted, JoinState::Establishing | JoinState::Rejected)
                | (JoinState::Establishing, JoinState::Established | JoinState::Rejected)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, JoinState::Established | JoinState::Rejected)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinState::Requested => "requested",
            JoinState::PolicyEvaluating => "policy_evaluating",
            JoinState::Accepted => "accepted",
            JoinState::Establishing => "establishing",
            JoinState::Established => "established",
            JoinState::Rejected => "rejected",
        }
    }
}

/// A join request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub session_port: SessionPort,
    /// Unique or well-known name of the joining peer.
    pub joiner: String,
    pub opts: SessionOpts,
    /// Existing multipoint session to extend; `None` creates a new session.
    pub session_id: Option<SessionId>,
}

impl JoinRequest {
    /// Request a new session on `session_port`.
    #[must_use]
    pub fn new(session_port: SessionPort, joiner: impl Into<String>, opts: SessionOpts) -> Self {
        Self {
            session_port,
            joiner: joiner.into(),
            opts,
            session_id: None,
        }
    }

    /// Target an existing session.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Snapshot of a join under negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJoin {
    pub request_id: u64,
    pub session_port: SessionPort,
    pub joiner: String,
    pub opts: SessionOpts,
    pub session_id: Option<SessionId>,
    pub state: JoinState,
}

/// Why a join was turned down. Outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The port's policy said no.
    Declined,
    /// Nothing is bound to the port.
    UnregisteredPort,
    /// Joiner options do not overlap the host options.
    IncompatibleOptions,
    /// Teardown or unbind cancelled the join.
    Cancelled,
}

impl RejectReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RejectReason::Declined => "declined",
            RejectReason::UnregisteredPort => "unregistered_port",
            RejectReason::IncompatibleOptions => "incompatible_options",
            RejectReason::Cancelled => "cancelled",
        }
    }
}

/// Terminal result of a successful negotiation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Established(SessionInfo),
    Rejected(RejectReason),
}

impl JoinOutcome {
    #[must_use]
    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            JoinOutcome::Established(info) => Some(info),
            JoinOutcome::Rejected(_) => None,
        }
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self, JoinOutcome::Established(_))
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            JoinOutcome::Established(_) => "established",
            JoinOutcome::Rejected(reason) => reason.as_str(),
        }
    }
}

struct PendingEntry {
    join: PendingJoin,
    cancel_token: CancellationToken,
}

/// Removes the pending entry however negotiation ends, including when the
/// negotiating future is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, PendingEntry>>,
    metrics: &'a EngineMetrics,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
        self.metrics.join_finished();
    }
}

/// Timeouts applied to each suspension point.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatorTimeouts {
    pub accept: Duration,
    pub establish: Duration,
}

/// Runs join negotiations for one attachment.
pub struct SessionNegotiator {
    ports: Arc<SessionPortRegistry>,
    sessions: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    metrics: Arc<EngineMetrics>,
    timeouts: NegotiatorTimeouts,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    cancel_token: CancellationToken,
}

/// Result of racing one suspension point against cancellation and its timeout.
enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn bounded<F: Future>(
    token: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        () = token.cancelled() => Bounded::Cancelled,
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(value) => Bounded::Done(value),
            Err(_) => Bounded::TimedOut,
        },
    }
}

/// Create or extend the session, then announce the join on its port.
async fn commit_join(
    sessions: Arc<SessionRegistry>,
    dispatcher: EventDispatcher,
    session_id: Option<SessionId>,
    port: SessionPort,
    joiner: String,
    host_opts: SessionOpts,
) -> Result<SessionInfo, BusError> {
    let info = sessions
        .create_or_extend(session_id, port, &joiner, host_opts)
        .await?;
    dispatcher.enqueue(BusEvent::SessionJoined {
        port,
        session_id: info.session_id,
        joiner,
    });
    Ok(info)
}

impl SessionNegotiator {
    #[must_use]
    pub fn new(
        ports: Arc<SessionPortRegistry>,
        sessions: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        dispatcher: EventDispatcher,
        metrics: Arc<EngineMetrics>,
        timeouts: NegotiatorTimeouts,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            ports,
            sessions,
            transport,
            dispatcher,
            metrics,
            timeouts,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            cancel_token,
        }
    }

    /// Negotiate a join.
    ///
    /// Rejections are `Ok(JoinOutcome::Rejected(..))`. Faults
    /// (`Timeout`, `TransportFailure`, `Conflict`, `NotFound`,
    /// `InvalidName`, `TornDown`) are errors; either way the join is over.
    #[instrument(
        skip_all,
        name = "bus.negotiator.join",
        fields(port = request.session_port, session_id = ?request.session_id)
    )]
    pub async fn negotiate(&self, request: JoinRequest) -> Result<JoinOutcome, BusError> {
        let started = Instant::now();
        let result = self.run(request).await;

        let label = match &result {
            Ok(outcome) => {
                if outcome.is_established() {
                    self.metrics.record_join_established();
                } else {
                    self.metrics.record_join_rejected();
                }
                outcome.label()
            }
            Err(e) => {
                self.metrics.record_join_failed();
                prom::record_error("join_session", e.error_type_label());
                e.error_type_label()
            }
        };
        prom::record_join(label, started.elapsed());
        result
    }

    async fn run(&self, request: JoinRequest) -> Result<JoinOutcome, BusError> {
        if self.cancel_token.is_cancelled() {
            return Err(BusError::TornDown);
        }
        validate_bus_name(&request.joiner)?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel_token.child_token();
        self.pending.lock().insert(
            request_id,
            PendingEntry {
                join: PendingJoin {
                    request_id,
                    session_port: request.session_port,
                    joiner: request.joiner.clone(),
                    opts: request.opts,
                    session_id: request.session_id,
                    state: JoinState::Requested,
                },
                cancel_token: token.clone(),
            },
        );
        self.metrics.join_started();
        let _guard = PendingGuard {
            pending: &self.pending,
            metrics: &self.metrics,
            request_id,
        };

        // Requested -> PolicyEvaluating
        self.advance(request_id, JoinState::PolicyEvaluating)?;
        let decision = match bounded(
            &token,
            self.timeouts.accept,
            self.ports
                .dispatch_join_request(request.session_port, &request.joiner, &request.opts),
        )
        .await
        {
            Bounded::Done(decision) => decision,
            Bounded::TimedOut => {
                self.advance(request_id, JoinState::Rejected)?;
                warn!(
                    target: "bus.negotiator",
                    request_id,
                    port = request.session_port,
                    "Accept policy timed out"
                );
                return Err(BusError::Timeout(format!(
                    "accept policy on port {}",
                    request.session_port
                )));
            }
            Bounded::Cancelled => return self.reject(request_id, RejectReason::Cancelled),
        };

        let binding = match decision {
            JoinDecision::Accepted(binding) => binding,
            JoinDecision::Declined => return self.reject(request_id, RejectReason::Declined),
            JoinDecision::UnregisteredPort => {
                return self.reject(request_id, RejectReason::UnregisteredPort)
            }
            JoinDecision::IncompatibleOptions => {
                return self.reject(request_id, RejectReason::IncompatibleOptions)
            }
        };
        self.advance(request_id, JoinState::Accepted)?;

        // Accepted -> Establishing
        self.advance(request_id, JoinState::Establishing)?;
        let establish = EstablishRequest {
            session_port: request.session_port,
            joiner: request.joiner.clone(),
            session_id: request.session_id,
            opts: request.opts,
        };
        match bounded(
            &token,
            self.timeouts.establish,
            self.transport.establish_session(&establish),
        )
        .await
        {
            Bounded::Done(Ok(())) => {}
            Bounded::Done(Err(e)) => {
                self.advance(request_id, JoinState::Rejected)?;
                warn!(
                    target: "bus.negotiator",
                    request_id,
                    error = %e,
                    "Transport establishment failed"
                );
                return Err(BusError::TransportFailure(e.to_string()));
            }
            Bounded::TimedOut => {
                self.advance(request_id, JoinState::Rejected)?;
                warn!(
                    target: "bus.negotiator",
                    request_id,
                    "Transport establishment timed out"
                );
                return Err(BusError::Timeout(format!(
                    "establishing session on port {}",
                    request.session_port
                )));
            }
            Bounded::Cancelled => return self.reject(request_id, RejectReason::Cancelled),
        }

        if token.is_cancelled() {
            return self.reject(request_id, RejectReason::Cancelled);
        }

        let commit = tokio::spawn(commit_join(
            Arc::clone(&self.sessions),
            self.dispatcher.clone(),
            request.session_id,
            request.session_port,
            request.joiner.clone(),
            binding.opts,
        ));
        let info = match commit.await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                self.advance(request_id, JoinState::Rejected)?;
                debug!(
                    target: "bus.negotiator",
                    request_id,
                    error = %e,
                    "Session registry refused join"
                );
                return Err(e);
            }
            Err(join_error) => {
                self.advance(request_id, JoinState::Rejected)?;
                return Err(BusError::Internal(format!(
                    "join commit task failed: {join_error}"
                )));
            }
        };

        self.advance(request_id, JoinState::Established)?;
        info!(
            target: "bus.negotiator",
            request_id,
            port = request.session_port,
            session_id = %info.session_id,
            members = info.member_count(),
            "Join established"
        );
        Ok(JoinOutcome::Established(info))
    }

    fn reject(&self, request_id: u64, reason: RejectReason) -> Result<JoinOutcome, BusError> {
        self.advance(request_id, JoinState::Rejected)?;
        debug!(
            target: "bus.negotiator",
            request_id,
            reason = reason.as_str(),
            "Join rejected"
        );
        Ok(JoinOutcome::Rejected(reason))
    }

    fn advance(&self, request_id: u64, next: JoinState) -> Result<(), BusError> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(&request_id)
            .ok_or_else(|| BusError::Internal(format!("pending join {request_id} missing")))?;
        if !entry.join.state.can_transition_to(next) {
            return Err(BusError::Internal(format!(
                "illegal join transition {} -> {}",
                entry.join.state.as_str(),
                next.as_str()
            )));
        }
        entry.join.state = next;
        Ok(())
    }

    /// Force-reject every join targeting `port`. Returns how many were cancelled.
    pub fn cancel_joins_for_port(&self, port: SessionPort) -> usize {
        let pending = self.pending.lock();
        pending
            .values()
            .filter(|entry| entry.join.session_port == port)
            .inspect(|entry| entry.cancel_token.cancel())
            .count()
    }

    /// Force-reject every pending join. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let pending = self.pending.lock();
        for entry in pending.values() {
            entry.cancel_token.cancel();
        }
        pending.len()
    }

    /// Refuse new joins and cancel the pending ones.
    pub fn close(&self) -> usize {
        self.cancel_token.cancel();
        self.cancel_all()
    }

    /// Joins currently under negotiation, oldest first.
    #[must_use]
    pub fn pending_joins(&self) -> Vec<PendingJoin> {
        let mut joins: Vec<PendingJoin> = self
            .pending
            .lock()
            .values()
            .map(|entry| entry.join.clone())
            .collect();
        joins.sort_by_key(|join| join.request_id);
        joins
    }
}
