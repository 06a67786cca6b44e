//! `SessionActor` - per-session actor that owns membership.
//!
//! Each `SessionActor`:
//! - Owns the member set of one live session (the host is tracked apart)
//! - Serializes every membership change for that session
//! - Emits `SessionMemberAdded` / `SessionMemberRemoved` for multipoint sessions
//! - Emits `SessionLost` exactly once when the session ends
//!
//! # Lifecycle
//!
//! 1. Spawned by the session registry with the first joiner
//! 2. Members added and removed through the handle
//! 3. Closed when the last member leaves or on a forced `Close`
//!
//! A closed actor refuses further joins with `NotFound`, so a join racing
//! the final leave never resurrects a destroyed session.
//!
//! The actor and its handle share a loss flag. Whichever side sets it first
//! emits `SessionLost`; the registry uses this to stop an actor that did not
//! answer a close in time without reporting the loss twice.

use super::dispatcher::EventDispatcher;
use super::messages::{BusEvent, SessionInfo, SessionMessage};
use super::metrics::{ActorType, MailboxMonitor};
use crate::errors::BusError;
use crate::listeners::SessionLostReason;

use common::types::{SessionId, SessionOpts, SessionPort};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
    loss_reported: Arc<AtomicBool>,
}

impl SessionActorHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Add `member`, joining through `port`.
    ///
    /// Returns the updated session. Re-adding an existing member is a no-op.
    pub async fn add_member(
        &self,
        member: String,
        port: SessionPort,
    ) -> Result<SessionInfo, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::AddMember {
                member,
                port,
                respond_to: tx,
            })
            .await
            .map_err(|_| BusError::session_not_found(self.session_id))?;

        rx.await
            .map_err(|e| BusError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove `member`. Returns the number of members left.
    pub async fn remove_member(&self, member: String) -> Result<usize, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::RemoveMember {
                member,
                respond_to: tx,
            })
            .await
            .map_err(|_| BusError::session_not_found(self.session_id))?;

        rx.await
            .map_err(|e| BusError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get current session state.
    pub async fn get_info(&self) -> Result<SessionInfo, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::GetInfo { respond_to: tx })
            .await
            .map_err(|_| BusError::session_not_found(self.session_id))?;

        rx.await
            .map_err(|e| BusError::Internal(format!("response receive failed: {e}")))
    }

    /// Destroy the session regardless of membership.
    ///
    /// Returns the final state.
    pub async fn close(&self, reason: SessionLostReason) -> Result<SessionInfo, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Close {
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|_| BusError::session_not_found(self.session_id))?;

        rx.await
            .map_err(|e| BusError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the session actor without emitting events.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Stop the actor and take over its `SessionLost` report.
    ///
    /// Returns false if the actor already reported the loss itself.
    pub fn abandon(&self) -> bool {
        let claimed = !self.loss_reported.swap(true, Ordering::SeqCst);
        self.cancel_token.cancel();
        claimed
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    host: String,
    host_port: SessionPort,
    opts: SessionOpts,
    members: BTreeSet<String>,
    created_at: i64,
    /// Set once the session has been destroyed; the loop exits and drains.
    closed: bool,
    loss_reported: Arc<AtomicBool>,
    dispatcher: EventDispatcher,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session actor with its first joiner.
    ///
    /// Returns a handle and the task join handle.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Freshly minted id
    /// * `host` - Unique name of the hosting attachment
    /// * `host_port` - Port the session was joined through
    /// * `opts` - Host session options (decides multipoint)
    /// * `first_member` - Joiner whose negotiation created the session
    /// * `cancel_token` - Child of the registry's token
    /// * `dispatcher` - Event sink for membership and loss events
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        session_id: SessionId,
        host: String,
        host_port: SessionPort,
        opts: SessionOpts,
        first_member: String,
        cancel_token: CancellationToken,
        dispatcher: EventDispatcher,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let loss_reported = Arc::new(AtomicBool::new(false));

        let actor = Self {
            session_id,
            receiver,
            cancel_token: cancel_token.clone(),
            host,
            host_port,
            opts,
            members: BTreeSet::from([first_member]),
            created_at: chrono::Utc::now().timestamp(),
            closed: false,
            loss_reported: Arc::clone(&loss_reported),
            dispatcher,
            mailbox: MailboxMonitor::new(ActorType::Session, session_id.to_string()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            sender,
            cancel_token,
            session_id,
            loss_reported,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "bus.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(
            target: "bus.actor.session",
            session_id = %self.session_id,
            host_port = self.host_port,
            multipoint = self.opts.is_multipoint,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "bus.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            if self.closed {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "bus.actor.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        if self.closed {
            self.drain_after_close();
        }

        info!(
            target: "bus.actor.session",
            session_id = %self.session_id,
            members = self.members.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Answer everything queued behind the message that closed the session.
    ///
    /// Adds and removes get `NotFound`; reads get the final state.
    fn drain_after_close(&mut self) {
        self.receiver.close();
        let mut drained = 0usize;
        while let Ok(message) = self.receiver.try_recv() {
            self.handle_message(message);
            drained += 1;
        }
        if drained > 0 {
            debug!(
                target: "bus.actor.session",
                session_id = %self.session_id,
                drained,
                "Answered requests queued behind session close"
            );
        }
    }

    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::AddMember {
                member,
                port,
                respond_to,
            } => {
                let result = self.handle_add(member, port);
                let _ = respond_to.send(result);
            }

            SessionMessage::RemoveMember { member, respond_to } => {
                let result = self.handle_remove(&member);
                let _ = respond_to.send(result);
            }

            SessionMessage::GetInfo { respond_to } => {
                let _ = respond_to.send(self.info());
            }

            SessionMessage::Close { reason, respond_to } => {
                self.close(reason);
                let _ = respond_to.send(self.info());
            }
        }
    }

    fn handle_add(&mut self, member: String, port: SessionPort) -> Result<SessionInfo, BusError> {
        if self.closed {
            return Err(BusError::session_not_found(self.session_id));
        }
        if port != self.host_port {
            return Err(BusError::Conflict(format!(
                "session {} is hosted on port {}, not {port}",
                self.session_id, self.host_port
            )));
        }
        if self.members.contains(&member) {
            return Ok(self.info());
        }
        if !self.opts.is_multipoint && !self.members.is_empty() {
            warn!(
                target: "bus.actor.session",
                session_id = %self.session_id,
                "Second joiner refused on point-to-point session"
            );
            return Err(BusError::Conflict(format!(
                "session {} is point-to-point and already joined",
                self.session_id
            )));
        }

        self.members.insert(member.clone());
        debug!(
            target: "bus.actor.session",
            session_id = %self.session_id,
            members = self.members.len(),
            "Member added"
        );
        if self.opts.is_multipoint {
            self.dispatcher.enqueue(BusEvent::SessionMemberAdded {
                session_id: self.session_id,
                member,
            });
        }
        Ok(self.info())
    }

    fn handle_remove(&mut self, member: &str) -> Result<usize, BusError> {
        if self.closed {
            return Err(BusError::session_not_found(self.session_id));
        }
        if !self.members.remove(member) {
            return Err(BusError::NotFound(format!(
                "member {member} of session {}",
                self.session_id
            )));
        }

        debug!(
            target: "bus.actor.session",
            session_id = %self.session_id,
            members = self.members.len(),
            "Member removed"
        );
        if self.opts.is_multipoint {
            self.dispatcher.enqueue(BusEvent::SessionMemberRemoved {
                session_id: self.session_id,
                member: member.to_string(),
            });
        }

        let remaining = self.members.len();
        if remaining == 0 {
            self.close(SessionLostReason::RemoteEndLeftSession);
        }
        Ok(remaining)
    }

    fn close(&mut self, reason: SessionLostReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.loss_reported.swap(true, Ordering::SeqCst) {
            debug!(
                target: "bus.actor.session",
                session_id = %self.session_id,
                "Loss already reported by the registry"
            );
            return;
        }
        info!(
            target: "bus.actor.session",
            session_id = %self.session_id,
            reason = reason.as_str(),
            "Session lost"
        );
        self.dispatcher.enqueue(BusEvent::SessionLost {
            session_id: self.session_id,
            reason,
        });
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            host: self.host.clone(),
            host_port: self.host_port,
            opts: self.opts,
            is_multipoint: self.opts.is_multipoint,
            members: self.members.clone(),
            created_at: self.created_at,
        }
    }
}
