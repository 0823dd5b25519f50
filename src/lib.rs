//! # realm-protocol
//!
//! Server core of a realtime game backend: a length-prefixed binary TCP
//! protocol engine with per-session encryption, an ordered middleware
//! pipeline, and registered account operations.
//!
//! ## Architecture
//! - **core**: wire frames, tokio codec, object pool
//! - **protocol**: middleware stack, dispatcher, handshake and account ops
//! - **service**: listener, connections, connection hub
//! - **store**: the narrow credentials-repository contract
//! - **utils**: crypto, password hashing, compression, limiters, logging,
//!   metrics, timeouts
//!
//! ## Data Flow
//! ```text
//! bytes -> frame codec -> inbound middleware (permission, limits, unwrap)
//!       -> dispatch queue -> handler -> outbound wrap -> frame codec -> bytes
//! ```
//!
//! Frames from one connection are handled strictly in arrival order; separate
//! connections progress in parallel. Session secrets are owned by their
//! connection and wiped on clear or drop.
//!
//! ## Quick Start
//! ```rust,no_run
//! use realm_protocol::config::NetworkConfig;
//! use realm_protocol::service::server::{serve, ServerContext};
//! use realm_protocol::store::MemoryAccountStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> realm_protocol::error::Result<()> {
//!     let config = NetworkConfig::default();
//!     let ctx = ServerContext::new(config, Arc::new(MemoryAccountStore::new()));
//!     serve(ctx).await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod store;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};

/// Commonly used types for embedding the engine.
pub mod prelude {
    pub use crate::config::NetworkConfig;
    pub use crate::core::frame::{
        Directive, DirectiveFlags, FrameFlags, OpCode, Packet, PacketMagic, Reason, Advice,
        ControlType,
    };
    pub use crate::error::{ProtocolError, Result};
    pub use crate::protocol::PermissionLevel;
    pub use crate::service::server::{serve, ServerContext};
    pub use crate::store::{AccountStore, MemoryAccountStore};
}
