//! Pre-configured test data fixtures for bus testing.
//!
//! Provides builders and test data for:
//! - Attachments with short timeouts
//! - Session options
//! - Peer names

use bus_service::config::AttachmentConfig;
use bus_service::transport::Transport;
use bus_service::BusAttachment;
use common::types::{SessionOpts, TransportMask};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Builder for a test `BusAttachment`.
#[derive(Debug, Clone)]
pub struct TestAttachment {
    config: AttachmentConfig,
}

impl Default for TestAttachment {
    fn default() -> Self {
        Self::new()
    }
}

impl TestAttachment {
    /// Attachment with a random unique name and one-second timeouts.
    #[must_use]
    pub fn new() -> Self {
        let mut config = AttachmentConfig::new(random_unique_name());
        config.accept_timeout = Duration::from_secs(1);
        config.establish_timeout = Duration::from_secs(1);
        config.teardown_deadline = Duration::from_secs(1);
        Self { config }
    }

    #[must_use]
    pub fn with_unique_name(mut self, name: impl Into<String>) -> Self {
        self.config.unique_name = name.into();
        self
    }

    #[must_use]
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_establish_timeout(mut self, timeout: Duration) -> Self {
        self.config.establish_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.config.name_table_shards = shards;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AttachmentConfig {
        &self.config
    }

    /// Build the attachment over `transport`. Needs a Tokio runtime.
    #[must_use]
    pub fn build<T: Transport + 'static>(self, transport: Arc<T>) -> Arc<BusAttachment> {
        Arc::new(BusAttachment::new(self.config, transport))
    }
}

/// A random unique name such as `:1a2b3c4d.1`.
#[must_use]
pub fn random_unique_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!(":{}.1", id.get(..8).unwrap_or("00000000"))
}

/// Well-known name for the `n`th test peer: `peer.n0`, `peer.n1`, ...
#[must_use]
pub fn peer(n: usize) -> String {
    format!("peer.n{n}")
}

/// Multipoint options over any transport.
#[must_use]
pub fn multipoint() -> SessionOpts {
    SessionOpts::new(true)
}

/// Point-to-point options over any transport.
#[must_use]
pub fn point_to_point() -> SessionOpts {
    SessionOpts::new(false)
}

/// Multipoint options restricted to `transports`.
#[must_use]
pub fn multipoint_over(transports: TransportMask) -> SessionOpts {
    SessionOpts::new(true).with_transports(transports)
}
