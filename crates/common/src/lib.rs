//! Common utilities and types shared across rendezvous bus components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for common data types (session ids, ports, option masks)
pub mod types;

/// Module for bus, interface and member name validation
pub mod names;

/// Module for type signature splitting
pub mod signature;
