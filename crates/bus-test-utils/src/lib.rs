//! # Bus Test Utilities
//!
//! Shared test utilities for the Rendezvous Bus service.
//!
//! This crate provides mock collaborators and fixtures for exercising a
//! `BusAttachment` without a real transport.
//!
//! ## Modules
//!
//! - `mock_transport` - Scriptable `Transport` (succeed, fail, delay, gate)
//! - `recording_listener` - Listener for all three roles that records what it sees
//! - `fixtures` - Attachments, session options and peer names
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let transport = MockTransport::builder().succeed().build();
//!     let bus = TestAttachment::new().build(transport.clone());
//!
//!     let listener = RecordingListener::accepting();
//!     bus.bind_session_port(42, multipoint(), listener.clone()).unwrap();
//!
//!     // Run your test...
//! }
//! ```

pub mod fixtures;
pub mod mock_transport;
pub mod recording_listener;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_transport::*;
pub use recording_listener::*;
