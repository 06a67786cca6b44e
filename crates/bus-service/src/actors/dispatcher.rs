//! `EventDispatcher` - ordered fan-out of bus events to listeners.
//!
//! A single router actor owns one unbounded channel carrying events,
//! registrations and unregistrations. Because all three travel through the
//! same channel, every listener observes events in the order they were
//! enqueued, and a listener registered after an event was enqueued never
//! sees it.
//!
//! The router never calls listener code. It forwards each event to the
//! per-listener [`ListenerActor`] queues, so producers and the router never
//! wait on a slow callback.

use super::delivery::{ListenerActor, ListenerActorHandle};
use super::messages::{BusEvent, DispatcherMessage, ListenerId, Subscriber};
use super::metrics::{ActorType, EngineMetrics, MailboxMonitor};
use crate::errors::BusError;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Time allowed for listener tasks to exit after cancellation.
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to the dispatcher router.
///
/// Cheap to clone; every component of an attachment holds one.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: mpsc::UnboundedSender<DispatcherMessage>,
    cancel_token: CancellationToken,
    /// Per-listener tokens, cancelled synchronously on unregister.
    tokens: Arc<Mutex<HashMap<ListenerId, CancellationToken>>>,
    next_id: Arc<AtomicU64>,
    mailbox: Arc<MailboxMonitor>,
}

impl EventDispatcher {
    /// Spawn the router actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        cancel_token: CancellationToken,
        metrics: Arc<EngineMetrics>,
    ) -> (EventDispatcher, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Dispatcher, "router"));

        let actor = DispatcherActor {
            receiver,
            cancel_token: cancel_token.clone(),
            listeners: BTreeMap::new(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = EventDispatcher {
            sender,
            cancel_token,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            mailbox,
        };

        (handle, task_handle)
    }

    /// Register a listener. It receives every matching event enqueued after
    /// this call returns.
    pub fn register(&self, subscriber: Subscriber) -> Result<ListenerId, BusError> {
        if self.cancel_token.is_cancelled() {
            return Err(BusError::TornDown);
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel_token = self.cancel_token.child_token();
        let role = subscriber.role();

        let mut tokens = self.tokens.lock();
        self.send(DispatcherMessage::Register {
            id,
            subscriber,
            cancel_token: cancel_token.clone(),
        })?;
        tokens.insert(id, cancel_token);
        drop(tokens);

        debug!(
            target: "bus.actor.dispatcher",
            listener_id = %id,
            role,
            "Listener registered"
        );
        Ok(id)
    }

    /// Unregister a listener.
    ///
    /// After this returns the listener receives no event enqueued later.
    /// An in-flight callback may still complete.
    pub fn unregister(&self, id: ListenerId) -> Result<(), BusError> {
        let token = self
            .tokens
            .lock()
            .remove(&id)
            .ok_or_else(|| BusError::NotFound(id.to_string()))?;
        token.cancel();

        // Router may already be gone during teardown; the token is what matters
        let _ = self.send(DispatcherMessage::Unregister { id });

        debug!(
            target: "bus.actor.dispatcher",
            listener_id = %id,
            "Listener unregistered"
        );
        Ok(())
    }

    /// Enqueue an event. Fire-and-continue: never blocks on listeners.
    pub fn enqueue(&self, event: BusEvent) {
        let kind = event.kind();
        if self.send(DispatcherMessage::Event(event)).is_err() {
            debug!(
                target: "bus.actor.dispatcher",
                kind,
                "Dispatcher stopped, event dropped"
            );
        }
    }

    /// Wait until every event enqueued before this call has been handled by
    /// every listener registered at that point.
    pub async fn flush(&self) -> Result<(), BusError> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::Flush { respond_to: tx })?;
        rx.await
            .map_err(|e| BusError::Internal(format!("response receive failed: {e}")))
    }

    /// Number of currently registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether `id` is currently registered.
    #[must_use]
    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.tokens.lock().contains_key(&id)
    }

    /// Stop the router and every delivery actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn send(&self, message: DispatcherMessage) -> Result<(), BusError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).map_err(|_| {
            self.mailbox.record_dequeue();
            BusError::TornDown
        })
    }
}

/// Delivery actor owned by the router.
struct ManagedListener {
    handle: ListenerActorHandle,
    task_handle: JoinHandle<()>,
    subscriber: Subscriber,
}

/// The router actor.
struct DispatcherActor {
    receiver: mpsc::UnboundedReceiver<DispatcherMessage>,
    cancel_token: CancellationToken,
    listeners: BTreeMap<ListenerId, ManagedListener>,
    metrics: Arc<EngineMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl DispatcherActor {
    #[instrument(skip_all, name = "bus.actor.dispatcher")]
    async fn run(mut self) {
        info!(target: "bus.actor.dispatcher", "EventDispatcher started");

        loop {
            self.check_listener_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "bus.actor.dispatcher",
                        "EventDispatcher received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(
                                target: "bus.actor.dispatcher",
                                "EventDispatcher channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "bus.actor.dispatcher",
            listeners_remaining = self.listeners.len(),
            messages_processed = self.mailbox.messages_processed(),
            "EventDispatcher stopped"
        );
    }

    fn handle_message(&mut self, message: DispatcherMessage) {
        match message {
            DispatcherMessage::Event(event) => {
                for managed in self.listeners.values() {
                    if managed.subscriber.wants(&event) {
                        managed.handle.deliver(event.clone());
                    }
                }
            }

            DispatcherMessage::Register {
                id,
                subscriber,
                cancel_token,
            } => {
                if cancel_token.is_cancelled() {
                    // Unregistered before the router saw the registration
                    return;
                }
                let (handle, task_handle) = ListenerActor::spawn(
                    id,
                    subscriber.clone(),
                    cancel_token,
                    Arc::clone(&self.metrics),
                );
                self.listeners.insert(
                    id,
                    ManagedListener {
                        handle,
                        task_handle,
                        subscriber,
                    },
                );
            }

            DispatcherMessage::Unregister { id } => {
                if let Some(managed) = self.listeners.remove(&id) {
                    managed.handle.cancel();
                }
            }

            DispatcherMessage::Flush { respond_to } => {
                let pending: Vec<_> = self
                    .listeners
                    .values()
                    .filter_map(|managed| managed.handle.flush())
                    .collect();
                tokio::spawn(async move {
                    for rx in pending {
                        // A listener stopped mid-flush has nothing left to deliver
                        let _ = rx.await;
                    }
                    let _ = respond_to.send(());
                });
            }
        }
    }

    /// Drop delivery actors whose task ended, recording panics.
    async fn check_listener_health(&mut self) {
        let finished: Vec<ListenerId> = self
            .listeners
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(managed) = self.listeners.remove(&id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        debug!(
                            target: "bus.actor.dispatcher",
                            listener_id = %id,
                            "Listener actor exited"
                        );
                    }
                    Err(join_error) if join_error.is_panic() => {
                        self.metrics.record_panic(ActorType::Listener);
                        warn!(
                            target: "bus.actor.dispatcher",
                            listener_id = %id,
                            role = managed.subscriber.role(),
                            "Listener callback panicked, listener dropped"
                        );
                    }
                    Err(join_error) => {
                        warn!(
                            target: "bus.actor.dispatcher",
                            listener_id = %id,
                            error = %join_error,
                            "Listener actor cancelled"
                        );
                    }
                }
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        let listeners = std::mem::take(&mut self.listeners);
        for managed in listeners.values() {
            managed.handle.cancel();
        }
        for (id, managed) in listeners {
            if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, managed.task_handle)
                .await
                .is_err()
            {
                warn!(
                    target: "bus.actor.dispatcher",
                    listener_id = %id,
                    "Listener actor did not stop in time"
                );
            }
        }
    }
}
