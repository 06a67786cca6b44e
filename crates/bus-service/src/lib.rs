//! Rendezvous Bus Service Library
//!
//! Session negotiation and advertised-name resolution for a local bus
//! attachment:
//!
//! - Tracking advertised well-known names per transport
//! - Session ports with accept policies
//! - Join negotiation with bounded policy and transport timeouts
//! - Session membership with point-to-point and multipoint semantics
//! - Ordered, per-listener event delivery
//!
//! # Architecture
//!
//! ```text
//! BusAttachment (one per local peer)
//! ├── NameTable            sharded name -> transports/owner
//! ├── SessionPortRegistry  port -> accept policy
//! ├── SessionNegotiator    one state machine per pending join
//! ├── SessionRegistry      session id -> SessionActor
//! │   └── SessionActor     owns one session's membership
//! └── EventDispatcher      router actor
//!     └── ListenerActor    one per registered listener
//! ```
//!
//! # Key Design Decisions
//!
//! - **No global lock**: names serialize per shard, ports behind one short
//!   critical section, sessions per actor mailbox
//! - **Sessions appear only when established**: the registry is touched after
//!   transport setup succeeds
//! - **Fire-and-continue events**: producers never wait on listeners
//! - **Bounded teardown**: every step has a deadline and nothing waits on a peer
//!
//! # Modules
//!
//! - [`attachment`] - Owner of everything below, plus teardown
//! - [`actors`] - Event dispatcher, listener delivery and session actors
//! - [`negotiator`] - Join state machine
//! - [`introspection`] - Interface descriptions and their XML
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types

pub mod actors;
pub mod attachment;
pub mod config;
pub mod errors;
pub mod introspection;
pub mod listeners;
pub mod name_table;
pub mod negotiator;
pub mod observability;
pub mod ports;
pub mod session_ops;
pub mod sessions;
pub mod transport;

pub use attachment::{AttachmentStatus, BusAttachment, TeardownReport};
pub use errors::BusError;
pub use negotiator::{JoinOutcome, JoinRequest, JoinState, RejectReason};
