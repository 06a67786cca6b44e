//! Observability module for the bus service
//!
//! # Privacy by Default
//!
//! Actor loops and negotiation use `#[instrument(skip_all)]` with explicit
//! field allow-listing. Metric labels are bounded (see [`metrics`]).
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `bus_sessions_active` | Gauge | none | Live sessions |
//! | `bus_ports_bound` | Gauge | none | Bound session ports |
//! | `bus_pending_joins` | Gauge | none | Joins under negotiation |
//! | `bus_advertised_names` | Gauge | none | Names in the name table |
//! | `bus_join_total` | Counter | `outcome` | Join results |
//! | `bus_join_duration_seconds` | Histogram | `outcome` | Negotiation latency |
//! | `bus_events_dispatched_total` | Counter | `kind` | Listener events routed |
//! | `bus_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `bus_actor_panics_total` | Counter | `actor_type` | Actor panics |
//! | `bus_errors_total` | Counter | `operation`, `error_type` | Failed operations |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthState, Readiness};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_error, record_event_dispatched,
    record_join, record_teardown_duration, set_actor_mailbox_depth, set_advertised_names,
    set_pending_joins, set_ports_bound, set_sessions_active,
};
