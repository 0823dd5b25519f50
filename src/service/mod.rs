//! # Service Layer
//!
//! The listener, per-socket connections, and the process-wide hub.

pub mod connection;
pub mod hub;
pub mod server;
