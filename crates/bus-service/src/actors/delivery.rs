//! `ListenerActor` - per-listener delivery actor.
//!
//! Each registered listener gets its own queue and task, so a slow or
//! panicking callback only affects that listener. Events are invoked in
//! queue order.
//!
//! Once the listener's cancellation token fires, no further callbacks run.
//! The token is checked before every delivery, so an event queued after
//! unregistration returns is never delivered.

use super::messages::{BusEvent, ListenerId, ListenerMessage, Subscriber};
use super::metrics::{ActorType, EngineMetrics, MailboxMonitor};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

/// Handle to a `ListenerActor`.
#[derive(Clone)]
pub struct ListenerActorHandle {
    sender: mpsc::UnboundedSender<ListenerMessage>,
    cancel_token: CancellationToken,
    listener_id: ListenerId,
    mailbox: Arc<MailboxMonitor>,
}

impl ListenerActorHandle {
    #[must_use]
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Queue an event. Never blocks; dropped if the actor has stopped.
    pub fn deliver(&self, event: BusEvent) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        self.mailbox.record_enqueue();
        if self.sender.send(ListenerMessage::Deliver(event)).is_err() {
            self.mailbox.record_dequeue();
        }
    }

    /// Queue a flush marker. The receiver resolves (or errors if the actor
    /// stopped) once everything queued ahead of it has been handled.
    pub fn flush(&self) -> Option<tokio::sync::oneshot::Receiver<()>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ListenerMessage::Flush { respond_to: tx })
            .ok()
            .map(|()| rx)
    }

    /// Stop the actor; queued events are discarded.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Events queued but not yet handled.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.mailbox.current_depth()
    }
}

/// The `ListenerActor` implementation.
pub struct ListenerActor {
    listener_id: ListenerId,
    subscriber: Subscriber,
    receiver: mpsc::UnboundedReceiver<ListenerMessage>,
    cancel_token: CancellationToken,
    metrics: Arc<EngineMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ListenerActor {
    /// Spawn a new listener actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        listener_id: ListenerId,
        subscriber: Subscriber,
        cancel_token: CancellationToken,
        metrics: Arc<EngineMetrics>,
    ) -> (ListenerActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Listener,
            listener_id.to_string(),
        ));

        let actor = Self {
            listener_id,
            subscriber,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ListenerActorHandle {
            sender,
            cancel_token,
            listener_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "bus.actor.delivery",
        fields(listener_id = %self.listener_id, role = self.subscriber.role())
    )]
    async fn run(mut self) {
        debug!(
            target: "bus.actor.delivery",
            listener_id = %self.listener_id,
            role = self.subscriber.role(),
            "ListenerActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(ListenerMessage::Deliver(event)) => {
                            if self.cancel_token.is_cancelled() {
                                break;
                            }
                            self.handle_event(&event).await;
                            self.mailbox.record_dequeue();
                        }
                        Some(ListenerMessage::Flush { respond_to }) => {
                            let _ = respond_to.send(());
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(
            target: "bus.actor.delivery",
            listener_id = %self.listener_id,
            delivered = self.mailbox.messages_processed(),
            "ListenerActor stopped"
        );
    }

    async fn handle_event(&self, event: &BusEvent) {
        trace!(
            target: "bus.actor.delivery",
            listener_id = %self.listener_id,
            kind = event.kind(),
            "Delivering event"
        );
        self.metrics.record_event_dispatched(event.kind());

        match (&self.subscriber, event) {
            (
                Subscriber::Bus(listener),
                BusEvent::FoundAdvertisedName {
                    name,
                    transport,
                    prefix,
                },
            ) => listener.found_advertised_name(name, *transport, prefix).await,
            (
                Subscriber::Bus(listener),
                BusEvent::LostAdvertisedName {
                    name,
                    transport,
                    prefix,
                },
            ) => listener.lost_advertised_name(name, *transport, prefix).await,
            (
                Subscriber::Bus(listener),
                BusEvent::NameOwnerChanged {
                    name,
                    previous_owner,
                    new_owner,
                },
            ) => {
                listener
                    .name_owner_changed(name, previous_owner.as_deref(), new_owner.as_deref())
                    .await;
            }
            (Subscriber::Bus(listener), BusEvent::BusStopping) => listener.bus_stopping().await,
            (Subscriber::Session(listener), BusEvent::SessionLost { session_id, reason }) => {
                listener.session_lost(*session_id, *reason).await;
            }
            (Subscriber::Session(listener), BusEvent::SessionMemberAdded { session_id, member }) => {
                listener.session_member_added(*session_id, member).await;
            }
            (
                Subscriber::Session(listener),
                BusEvent::SessionMemberRemoved { session_id, member },
            ) => {
                listener.session_member_removed(*session_id, member).await;
            }
            (
                Subscriber::SessionPort { listener, .. },
                BusEvent::SessionJoined {
                    port,
                    session_id,
                    joiner,
                },
            ) => listener.session_joined(*port, *session_id, joiner).await,
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::listeners::BusListener;
    use common::types::TransportMask;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Names(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl BusListener for Names {
        async fn found_advertised_name(&self, name: &str, _t: TransportMask, _p: &str) {
            self.0.lock().push(name.to_string());
        }
    }

    fn found(name: &str) -> BusEvent {
        BusEvent::FoundAdvertisedName {
            name: name.to_string(),
            transport: TransportMask::TCP,
            prefix: "org".to_string(),
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order_and_flushes() {
        let names = Arc::new(Names::default());
        let (handle, _task) = ListenerActor::spawn(
            ListenerId(1),
            Subscriber::Bus(names.clone()),
            CancellationToken::new(),
            EngineMetrics::new(),
        );

        handle.deliver(found("org.a"));
        handle.deliver(found("org.b"));
        handle.deliver(found("org.c"));
        handle.flush().expect("actor running").await.unwrap();

        assert_eq!(*names.0.lock(), vec!["org.a", "org.b", "org.c"]);
        assert_eq!(handle.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_listener_receives_nothing_more() {
        let names = Arc::new(Names::default());
        let token = CancellationToken::new();
        let (handle, task) = ListenerActor::spawn(
            ListenerId(2),
            Subscriber::Bus(names.clone()),
            token.clone(),
            EngineMetrics::new(),
        );

        handle.deliver(found("org.before"));
        handle.flush().unwrap().await.unwrap();

        handle.cancel();
        handle.deliver(found("org.after"));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("actor should stop")
            .unwrap();
        assert_eq!(*names.0.lock(), vec!["org.before"]);
        assert!(handle.flush().is_none());
    }
}
