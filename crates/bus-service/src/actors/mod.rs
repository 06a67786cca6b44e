//! Actor implementation for the bus engine.
//!
//! ```text
//! BusAttachment
//! ├── EventDispatcher (router, one per attachment)
//! │   └── ListenerActor (one per registered listener)
//! └── SessionRegistry
//!     └── SessionActor (one per live session)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-entity serialization**: each session's membership is owned by its actor
//! - **CancellationToken propagation**: parents hand children child tokens
//! - **Fire-and-continue events**: producers enqueue on unbounded channels and never
//!   wait for listener callbacks
//! - **Mailbox monitoring**: depth thresholds per actor type
//!
//! # Modules
//!
//! - [`dispatcher`] - `EventDispatcher` router
//! - [`delivery`] - `ListenerActor` per listener
//! - [`session`] - `SessionActor` per session
//! - [`messages`] - Message and event types
//! - [`metrics`] - Mailbox monitoring and engine metrics

pub mod delivery;
pub mod dispatcher;
pub mod messages;
pub mod metrics;
pub mod session;

// Re-export primary types
pub use delivery::{ListenerActor, ListenerActorHandle};
pub use dispatcher::EventDispatcher;
pub use messages::*;
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, MailboxMonitor};
pub use session::{SessionActor, SessionActorHandle};
