//! Mock transport for negotiation tests.
//!
//! The mock can be configured to:
//! - Establish every session, or fail every establishment
//! - Delay establishment by a fixed duration
//! - Hold establishment behind a gate the test releases
//!
//! # Example
//!
//! ```rust,ignore
//! use bus_test_utils::MockTransport;
//!
//! let transport = MockTransport::builder()
//!     .succeed()
//!     .delay(Duration::from_millis(50))
//!     .build();
//! ```

use bus_service::transport::{EstablishRequest, Transport, TransportError};
use common::types::TransportMask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What `establish_session` does after any delay or gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstablishBehavior {
    Succeed,
    Fail(TransportError),
    /// Never completes.
    Hang,
}

/// Scriptable transport.
#[derive(Debug)]
pub struct MockTransport {
    behavior: EstablishBehavior,
    delay: Option<Duration>,
    gate: Option<CancellationToken>,
    establish_calls: Mutex<Vec<EstablishRequest>>,
    advertised: Mutex<Vec<(String, TransportMask)>>,
    prefixes: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Create a new `MockTransport` builder.
    #[must_use]
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    /// Transport that establishes every session immediately.
    #[must_use]
    pub fn accepting() -> Arc<Self> {
        Self::builder().succeed().build()
    }

    /// Transport whose establishment always fails.
    #[must_use]
    pub fn failing() -> Arc<Self> {
        Self::builder()
            .fail_with(TransportError::SetupFailed("mock failure".to_string()))
            .build()
    }

    /// Transport whose establishment never completes.
    #[must_use]
    pub fn hanging() -> Arc<Self> {
        Self::builder().hang().build()
    }

    /// Let every establishment held at the gate proceed.
    pub fn release_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.cancel();
        }
    }

    /// Establishment requests seen so far, in call order.
    #[must_use]
    pub fn establish_calls(&self) -> Vec<EstablishRequest> {
        self.establish_calls.lock().clone()
    }

    #[must_use]
    pub fn establish_count(&self) -> usize {
        self.establish_calls.lock().len()
    }

    /// Names currently advertised through this transport.
    #[must_use]
    pub fn advertised(&self) -> Vec<(String, TransportMask)> {
        self.advertised.lock().clone()
    }

    /// Prefixes currently being searched for.
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.lock().clone()
    }

    /// Wait until at least `count` establishment calls were made.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` elapses first.
    pub async fn wait_for_establish_calls(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.establish_count() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} establish calls, saw {}",
                self.establish_count()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn establish_session(&self, request: &EstablishRequest) -> Result<(), TransportError> {
        self.establish_calls.lock().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.cancelled().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behavior {
            EstablishBehavior::Succeed => Ok(()),
            EstablishBehavior::Fail(err) => Err(err.clone()),
            EstablishBehavior::Hang => std::future::pending().await,
        }
    }

    async fn advertise_name(&self, name: &str, transports: TransportMask) -> Result<(), TransportError> {
        self.advertised.lock().push((name.to_string(), transports));
        Ok(())
    }

    async fn cancel_advertise_name(
        &self,
        name: &str,
        _transports: TransportMask,
    ) -> Result<(), TransportError> {
        self.advertised.lock().retain(|(n, _)| n != name);
        Ok(())
    }

    async fn find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.prefixes.lock().push(prefix.to_string());
        Ok(())
    }

    async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.prefixes.lock().retain(|p| p != prefix);
        Ok(())
    }
}

/// Builder for `MockTransport` configuration.
#[derive(Debug)]
pub struct MockTransportBuilder {
    behavior: EstablishBehavior,
    delay: Option<Duration>,
    gated: bool,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            behavior: EstablishBehavior::Succeed,
            delay: None,
            gated: false,
        }
    }
}

impl MockTransportBuilder {
    /// Establish sessions successfully.
    #[must_use]
    pub fn succeed(mut self) -> Self {
        self.behavior = EstablishBehavior::Succeed;
        self
    }

    /// Fail establishment with `err`.
    #[must_use]
    pub fn fail_with(mut self, err: TransportError) -> Self {
        self.behavior = EstablishBehavior::Fail(err);
        self
    }

    /// Never complete establishment.
    #[must_use]
    pub fn hang(mut self) -> Self {
        self.behavior = EstablishBehavior::Hang;
        self
    }

    /// Sleep for `delay` before answering.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold every establishment until `MockTransport::release_gate`.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    /// Build the `MockTransport`.
    #[must_use]
    pub fn build(self) -> Arc<MockTransport> {
        Arc::new(MockTransport {
            behavior: self.behavior,
            delay: self.delay,
            gate: self.gated.then(CancellationToken::new),
            establish_calls: Mutex::new(Vec::new()),
            advertised: Mutex::new(Vec::new()),
            prefixes: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::SessionOpts;

    fn request() -> EstablishRequest {
        EstablishRequest {
            session_port: 42,
            joiner: "peer.A".to_string(),
            session_id: None,
            opts: SessionOpts::default(),
        }
    }

    #[tokio::test]
    async fn test_accepting_records_calls() {
        let transport = MockTransport::accepting();
        transport.establish_session(&request()).await.unwrap();
        assert_eq!(transport.establish_calls(), vec![request()]);
    }

    #[tokio::test]
    async fn test_failing() {
        let transport = MockTransport::failing();
        assert!(transport.establish_session(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_gate_holds_until_released() {
        let transport = MockTransport::builder().gated().build();
        let pending = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.establish_session(&request()).await })
        };

        transport
            .wait_for_establish_calls(1, Duration::from_secs(1))
            .await;
        assert!(!pending.is_finished());

        transport.release_gate();
        assert!(pending.await.unwrap().is_ok());
    }
}
