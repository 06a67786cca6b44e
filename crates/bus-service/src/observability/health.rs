//! Health endpoints for the bus service.
//!
//! - `GET /health` - Liveness, 200 while the process runs
//! - `GET /ready` - Readiness, 200 only while the attachment can take joins
//!
//! Readiness is derived from the attachment on every request: the startup
//! flag must be set, the attachment must not be torn down and at least one
//! session port must be bound. The body says which condition failed.
//!
//! `/metrics` and `/status` are mounted by the binary next to this router.

use crate::attachment::BusAttachment;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use common::types::SessionPort;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Startup flag flipped by the binary around its serving window.
#[derive(Debug, Default)]
pub struct HealthState {
    started: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup finished; readiness now follows the attachment.
    pub fn set_ready(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Shutdown began; report not ready regardless of the attachment.
    pub fn set_not_ready(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Body of `/ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    /// First failed condition, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub torn_down: bool,
    pub bound_ports: Vec<SessionPort>,
}

impl Readiness {
    /// Evaluate readiness of `attachment` under `state`.
    #[must_use]
    pub fn evaluate(state: &HealthState, attachment: &BusAttachment) -> Self {
        let torn_down = attachment.is_torn_down();
        let bound_ports = attachment.bound_ports();

        let reason = if torn_down {
            Some("torn_down")
        } else if !state.is_started() {
            Some("starting")
        } else if bound_ports.is_empty() {
            Some("no_bound_ports")
        } else {
            None
        };

        Self {
            ready: reason.is_none(),
            reason,
            torn_down,
            bound_ports,
        }
    }
}

#[derive(Clone)]
struct HealthContext {
    state: Arc<HealthState>,
    attachment: Arc<BusAttachment>,
}

/// Create the health router for `attachment`.
pub fn health_router(state: Arc<HealthState>, attachment: Arc<BusAttachment>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(HealthContext { state, attachment })
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

async fn readiness_handler(
    State(ctx): State<HealthContext>,
) -> (StatusCode, Json<Readiness>) {
    let readiness = Readiness::evaluate(&ctx.state, &ctx.attachment);
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::AttachmentConfig;
    use crate::listeners::SessionPortListener;
    use crate::transport::LoopbackTransport;
    use axum::body::Body;
    use axum::http::Request;
    use common::types::SessionOpts;
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct AcceptAll;

    #[async_trait::async_trait]
    impl SessionPortListener for AcceptAll {
        async fn accept_session_joiner(&self, _p: SessionPort, _j: &str, _o: &SessionOpts) -> bool {
            true
        }
    }

    fn attachment() -> Arc<BusAttachment> {
        let (transport, _rx) = LoopbackTransport::new();
        Arc::new(BusAttachment::new(
            AttachmentConfig::new(":health.1"),
            Arc::new(transport),
        ))
    }

    async fn get_status(router: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");

        router
            .oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[tokio::test]
    async fn test_liveness_is_unconditional() {
        let router = health_router(Arc::new(HealthState::new()), attachment());
        assert_eq!(get_status(router, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_needs_start_and_bound_port() {
        let state = Arc::new(HealthState::new());
        let bus = attachment();
        let router = health_router(Arc::clone(&state), Arc::clone(&bus));

        assert_eq!(
            Readiness::evaluate(&state, &bus).reason,
            Some("starting")
        );
        assert_eq!(
            get_status(router.clone(), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(
            Readiness::evaluate(&state, &bus).reason,
            Some("no_bound_ports")
        );
        assert_eq!(
            get_status(router.clone(), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        bus.bind_session_port(42, SessionOpts::new(true), Arc::new(AcceptAll))
            .unwrap();
        let readiness = Readiness::evaluate(&state, &bus);
        assert!(readiness.ready);
        assert_eq!(readiness.bound_ports, vec![42]);
        assert_eq!(get_status(router.clone(), "/ready").await, StatusCode::OK);

        bus.unbind_session_port(42).unwrap();
        assert_eq!(
            get_status(router, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_readiness_drops_after_teardown() {
        let state = Arc::new(HealthState::new());
        let bus = attachment();
        let router = health_router(Arc::clone(&state), Arc::clone(&bus));

        bus.bind_session_port(42, SessionOpts::new(true), Arc::new(AcceptAll))
            .unwrap();
        state.set_ready();
        assert_eq!(get_status(router.clone(), "/ready").await, StatusCode::OK);

        bus.teardown(Duration::from_secs(1)).await.unwrap();
        let readiness = Readiness::evaluate(&state, &bus);
        assert!(readiness.torn_down);
        assert_eq!(readiness.reason, Some("torn_down"));
        assert_eq!(
            get_status(router, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_readiness_body_omits_reason_when_ready() {
        let readiness = Readiness {
            ready: true,
            reason: None,
            torn_down: false,
            bound_ports: vec![42],
        };
        let json = serde_json::to_value(&readiness).unwrap();
        assert!(json.get("reason").is_none());
        assert_eq!(json.get("ready"), Some(&serde_json::Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let router = health_router(Arc::new(HealthState::new()), attachment());
        assert_eq!(get_status(router, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
