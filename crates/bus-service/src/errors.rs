//! Bus error types.
//!
//! `RejectedUnregisteredPort` is deliberately absent: a join against an
//! unbound port is a negotiation outcome, not a fault.

use common::error::ValidationError;
use common::types::{SessionId, SessionPort};
use thiserror::Error;

/// Bus error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Bus, interface or member name failed validation.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Type signature failed validation.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A listener is already bound to the port.
    #[error("Session port {0} already bound")]
    PortInUse(SessionPort),

    /// Port, session, name or listener is not known.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with existing state (e.g. second joiner on a point-to-point session).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Accept policy or transport establishment exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Transport could not set up the session.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// The attachment or registry has been torn down.
    #[error("Bus attachment torn down")]
    TornDown,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Unknown session id.
    pub fn session_not_found(id: SessionId) -> Self {
        BusError::NotFound(format!("session {id}"))
    }

    /// Unbound session port.
    pub fn port_not_found(port: SessionPort) -> Self {
        BusError::NotFound(format!("session port {port}"))
    }

    /// Returns a bounded label string for the error variant (for metrics).
    ///
    /// Uses enum variant names, not error message content.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            BusError::InvalidName(_) => "invalid_name",
            BusError::InvalidSignature(_) => "invalid_signature",
            BusError::PortInUse(_) => "port_in_use",
            BusError::NotFound(_) => "not_found",
            BusError::Conflict(_) => "conflict",
            BusError::Timeout(_) => "timeout",
            BusError::TransportFailure(_) => "transport_failure",
            BusError::TornDown => "torn_down",
            BusError::Internal(_) => "internal",
        }
    }

    /// Whether the caller must treat this as a programming error and stop.
    ///
    /// Fatal errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::TornDown)
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Timeout(_) | BusError::TransportFailure(_))
    }
}

impl From<ValidationError> for BusError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidSignature(sig) => BusError::InvalidSignature(sig),
            other => BusError::InvalidName(other.to_string()),
        }
    }
}
