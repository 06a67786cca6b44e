//! `SessionRegistry` - live sessions keyed by id.
//!
//! The registry maps ids to [`SessionActorHandle`]s. Membership itself is
//! owned by each session's actor; the registry map is only touched to add
//! a new session or drop a finished one, and its lock is never held across
//! an await.
//!
//! Session ids come from a monotonic counter starting at 1 and are never
//! reused. Exhausting the id space is an error, not a wrap.

use crate::actors::messages::SessionInfo;
use crate::actors::{BusEvent, EngineMetrics, EventDispatcher, SessionActor, SessionActorHandle};
use crate::errors::BusError;
use crate::listeners::SessionLostReason;

use common::types::{SessionId, SessionOpts, SessionPort};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for a session actor to exit after its final reply.
const SESSION_EXIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of [`SessionRegistry::close_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseAllReport {
    /// Every session that was live, in id order.
    pub destroyed: Vec<SessionId>,
    /// Sessions whose actor did not answer before the deadline. They were
    /// stopped and their `SessionLost` was enqueued by the registry.
    pub forced: Vec<SessionId>,
}

struct ManagedSession {
    handle: SessionActorHandle,
    task_handle: JoinHandle<()>,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, ManagedSession>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    host: String,
    cancel_token: CancellationToken,
    dispatcher: EventDispatcher,
    metrics: Arc<EngineMetrics>,
}

impl SessionRegistry {
    /// Create a registry hosting sessions for attachment `host`.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        cancel_token: CancellationToken,
        dispatcher: EventDispatcher,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            host: host.into(),
            cancel_token,
            dispatcher,
            metrics,
        }
    }

    fn mint_id(&self) -> Result<SessionId, BusError> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map(SessionId)
            .map_err(|_| BusError::Internal("session id space exhausted".to_string()))
    }

    fn handle(&self, session_id: SessionId) -> Result<SessionActorHandle, BusError> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|managed| managed.handle.clone())
            .ok_or_else(|| BusError::session_not_found(session_id))
    }

    /// Create a new session for `joiner`, or add `joiner` to `session_id`.
    ///
    /// With `session_id` absent a new id is minted. With it present the
    /// joiner is added (idempotent for existing members); a second distinct
    /// joiner on a point-to-point session is a `Conflict`.
    pub async fn create_or_extend(
        &self,
        session_id: Option<SessionId>,
        port: SessionPort,
        joiner: &str,
        host_opts: SessionOpts,
    ) -> Result<SessionInfo, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::TornDown);
        }

        match session_id {
            Some(id) => {
                let handle = self.handle(id)?;
                handle.add_member(joiner.to_string(), port).await
            }
            None => {
                let id = self.mint_id()?;
                let (handle, task_handle) = SessionActor::spawn(
                    id,
                    self.host.clone(),
                    port,
                    host_opts,
                    joiner.to_string(),
                    self.cancel_token.child_token(),
                    self.dispatcher.clone(),
                );

                {
                    let mut sessions = self.sessions.write();
                    // Re-check under the lock so teardown cannot miss this session
                    if self.closed.load(Ordering::SeqCst) {
                        handle.cancel();
                        return Err(BusError::TornDown);
                    }
                    sessions.insert(
                        id,
                        ManagedSession {
                            handle: handle.clone(),
                            task_handle,
                        },
                    );
                }
                self.metrics.session_created();
                info!(
                    target: "bus.sessions",
                    session_id = %id,
                    port,
                    multipoint = host_opts.is_multipoint,
                    "Session created"
                );
                handle.get_info().await
            }
        }
    }

    /// Remove `member` from `session_id`, returning the members left.
    ///
    /// At zero the session is destroyed and `SessionLost` is reported with
    /// `RemoteEndLeftSession`.
    pub async fn remove_member(
        &self,
        session_id: SessionId,
        member: &str,
    ) -> Result<usize, BusError> {
        let handle = self.handle(session_id)?;
        let remaining = handle.remove_member(member.to_string()).await?;
        if remaining == 0 {
            self.forget(session_id).await;
        }
        Ok(remaining)
    }

    /// Destroy `session_id` regardless of membership.
    ///
    /// Unknown ids return `NotFound` with no side effect.
    pub async fn session_lost(
        &self,
        session_id: SessionId,
        reason: SessionLostReason,
    ) -> Result<SessionInfo, BusError> {
        let managed = self
            .sessions
            .write()
            .remove(&session_id)
            .ok_or_else(|| BusError::session_not_found(session_id))?;

        let info = managed.handle.close(reason).await;
        self.reap(session_id, managed.task_handle, SESSION_EXIT_TIMEOUT)
            .await;
        info
    }

    /// Current state of `session_id`.
    pub async fn get(&self, session_id: SessionId) -> Result<SessionInfo, BusError> {
        self.handle(session_id)?.get_info().await
    }

    #[must_use]
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    /// Live session ids, ascending.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse new sessions and destroy every live one within `deadline`.
    ///
    /// Each session reports `SessionLost` with `reason` exactly once. A
    /// session that cannot be closed in time is stopped and its loss is
    /// enqueued here instead, so every drained session is accounted for.
    pub async fn close_all(&self, reason: SessionLostReason, deadline: Duration) -> CloseAllReport {
        let started = Instant::now();
        let drained = {
            let mut sessions = self.sessions.write();
            self.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *sessions)
        };

        let mut report = CloseAllReport {
            destroyed: Vec::with_capacity(drained.len()),
            forced: Vec::new(),
        };
        for (id, managed) in drained {
            let remaining = deadline.saturating_sub(started.elapsed());
            // Past the deadline the actor is not asked at all
            let closed = if remaining.is_zero() {
                None
            } else {
                tokio::time::timeout(remaining, managed.handle.close(reason))
                    .await
                    .ok()
            };

            match closed {
                Some(result) => {
                    if let Err(e) = result {
                        debug!(
                            target: "bus.sessions",
                            session_id = %id,
                            error = %e,
                            "Session already gone during close"
                        );
                    }
                    self.reap(id, managed.task_handle, remaining.min(SESSION_EXIT_TIMEOUT))
                        .await;
                }
                None => {
                    if managed.handle.abandon() {
                        self.dispatcher
                            .enqueue(BusEvent::SessionLost { session_id: id, reason });
                    }
                    warn!(
                        target: "bus.sessions",
                        session_id = %id,
                        "Session not closed before deadline, actor stopped"
                    );
                    self.metrics.session_destroyed();
                    report.forced.push(id);
                }
            }
            report.destroyed.push(id);
        }
        report
    }

    /// Drop a session whose actor closed itself.
    async fn forget(&self, session_id: SessionId) {
        let managed = self.sessions.write().remove(&session_id);
        if let Some(managed) = managed {
            self.reap(session_id, managed.task_handle, SESSION_EXIT_TIMEOUT)
                .await;
        }
    }

    async fn reap(&self, session_id: SessionId, task_handle: JoinHandle<()>, limit: Duration) {
        self.metrics.session_destroyed();
        match tokio::time::timeout(limit, task_handle).await {
            Ok(Ok(())) => {
                debug!(target: "bus.sessions", session_id = %session_id, "Session destroyed");
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                self.metrics
                    .record_panic(crate::actors::metrics::ActorType::Session);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    target: "bus.sessions",
                    session_id = %session_id,
                    "Session actor did not exit in time"
                );
            }
        }
    }
}
