//! Transport seam.
//!
//! Wire encoding, peer authentication and discovery packet formats live
//! behind [`Transport`]. The engine only needs session establishment and
//! the advertise/discover calls; discovery results come back as
//! [`DiscoveryEvent`]s on a channel the attachment pumps into its name table.

use common::types::{SessionId, SessionOpts, SessionPort, TransportMask};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Transport-level failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer could not be reached.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// Session setup was refused or failed on the wire.
    #[error("Session setup failed: {0}")]
    SetupFailed(String),

    /// Requested transports are not available locally.
    #[error("Transport unavailable: {0}")]
    Unavailable(TransportMask),
}

/// What the negotiator asks the transport to set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishRequest {
    pub session_port: SessionPort,
    pub joiner: String,
    /// Present when extending an existing multipoint session.
    pub session_id: Option<SessionId>,
    pub opts: SessionOpts,
}

/// Discovery notification produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    Lost {
        name: String,
        transport: TransportMask,
        prefix: String,
    },
    OwnerChanged {
        name: String,
        previous_owner: Option<String>,
        new_owner: Option<String>,
    },
}

/// Transport collaborator consumed by the engine.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Set up the wire-level session for an accepted join.
    async fn establish_session(&self, request: &EstablishRequest) -> Result<(), TransportError>;

    /// Start advertising `name` over `transports`.
    async fn advertise_name(&self, _name: &str, _transports: TransportMask) -> Result<(), TransportError> {
        Ok(())
    }

    /// Stop advertising `name` over `transports`.
    async fn cancel_advertise_name(
        &self,
        _name: &str,
        _transports: TransportMask,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Start reporting names that begin with `prefix`.
    async fn find_advertised_name(&self, _prefix: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Stop reporting names that begin with `prefix`.
    async fn cancel_find_advertised_name(&self, _prefix: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// In-process transport.
///
/// Establishment always succeeds. Advertisements matching an active
/// discovery prefix loop straight back as `Found`, cancellations as `Lost`.
pub struct LoopbackTransport {
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    prefixes: parking_lot::Mutex<Vec<String>>,
    advertised: parking_lot::Mutex<Vec<(String, TransportMask)>>,
}

impl LoopbackTransport {
    /// Create the transport and the discovery stream to pump.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                prefixes: parking_lot::Mutex::new(Vec::new()),
                advertised: parking_lot::Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    fn matching_prefix(&self, name: &str) -> Option<String> {
        self.prefixes
            .lock()
            .iter()
            .find(|prefix| name.starts_with(prefix.as_str()))
            .cloned()
    }

    fn emit(&self, event: DiscoveryEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "bus.transport", "Discovery pump gone, event dropped");
        }
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn establish_session(&self, request: &EstablishRequest) -> Result<(), TransportError> {
        debug!(
            target: "bus.transport",
            port = request.session_port,
            joiner = %request.joiner,
            "Loopback session established"
        );
        Ok(())
    }

    async fn advertise_name(&self, name: &str, transports: TransportMask) -> Result<(), TransportError> {
        let local = transports & TransportMask::LOCAL;
        if local.is_empty() {
            return Err(TransportError::Unavailable(transports));
        }
        self.advertised.lock().push((name.to_string(), local));
        if let Some(prefix) = self.matching_prefix(name) {
            self.emit(DiscoveryEvent::Found {
                name: name.to_string(),
                transport: local,
                prefix,
            });
        }
        Ok(())
    }

    async fn cancel_advertise_name(
        &self,
        name: &str,
        transports: TransportMask,
    ) -> Result<(), TransportError> {
        let local = transports & TransportMask::LOCAL;
        self.advertised
            .lock()
            .retain(|(advertised, _)| advertised != name);
        if let Some(prefix) = self.matching_prefix(name) {
            self.emit(DiscoveryEvent::Lost {
                name: name.to_string(),
                transport: local,
                prefix,
            });
        }
        Ok(())
    }

    async fn find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.prefixes.lock().push(prefix.to_string());
        let matches: Vec<(String, TransportMask)> = self
            .advertised
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .cloned()
            .collect();
        for (name, transport) in matches {
            self.emit(DiscoveryEvent::Found {
                name,
                transport,
                prefix: prefix.to_string(),
            });
        }
        Ok(())
    }

    async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.prefixes.lock().retain(|p| p != prefix);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_advertise_after_find() {
        let (transport, mut rx) = LoopbackTransport::new();

        transport.find_advertised_name("org.example").await.unwrap();
        transport
            .advertise_name("org.example.Chat", TransportMask::ANY)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DiscoveryEvent::Found {
                name: "org.example.Chat".into(),
                transport: TransportMask::LOCAL,
                prefix: "org.example".into(),
            }
        );

        transport
            .cancel_advertise_name("org.example.Chat", TransportMask::ANY)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Lost { .. })));
    }

    #[tokio::test]
    async fn test_loopback_find_after_advertise() {
        let (transport, mut rx) = LoopbackTransport::new();

        transport
            .advertise_name("org.example.Chat", TransportMask::LOCAL)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "nobody is looking yet");

        transport.find_advertised_name("org.").await.unwrap();
        assert!(matches!(rx.recv().await, Some(DiscoveryEvent::Found { .. })));
    }

    #[tokio::test]
    async fn test_loopback_rejects_remote_only_transports() {
        let (transport, _rx) = LoopbackTransport::new();
        assert_eq!(
            transport
                .advertise_name("org.example.Chat", TransportMask::TCP)
                .await,
            Err(TransportError::Unavailable(TransportMask::TCP))
        );
    }
}
