//! # Error Types
//!
//! Comprehensive error handling for the protocol engine.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O errors to wire-format violations and
//! cryptographic failures.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket and file system failures
//! - **Wire Errors**: Bad magic, bad length, malformed payloads
//! - **Cryptographic Errors**: Key agreement, AEAD, password hashing
//! - **Dispatch Errors**: Timeouts, closed connections
//!
//! All errors implement `std::error::Error` for interoperability. Wire and
//! dispatch failures that a client must learn about are *not* surfaced as
//! `ProtocolError` to the peer: operations translate every failure into
//! exactly one `Directive` reply (see `protocol::dispatcher`).

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Wire format errors
    pub const ERR_TRUNCATED_HEADER: &str = "Truncated frame header";
    pub const ERR_UNKNOWN_MAGIC: &str = "Unknown packet magic";
    pub const ERR_BAD_LENGTH: &str = "Frame length out of bounds";
    pub const ERR_STRING_TOO_LONG: &str = "String field exceeds limit";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";
    pub const ERR_TIMEOUT: &str = "Operation timed out";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";
    pub const ERR_NO_SESSION_KEY: &str = "No session key installed";

    /// Handshake errors
    pub const ERR_WEAK_SHARED_SECRET: &str = "Key agreement produced a non-contributory secret";

    /// Store errors
    pub const ERR_STORE_UNAVAILABLE: &str = "Account store unavailable";
}

/// ProtocolError is the primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown packet magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Invalid frame length: {0}")]
    BadLength(u16),

    #[error("Malformed payload: {0}")]
    Malformed(&'static str),

    #[error("Output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Operation timed out")]
    Timeout,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(&'static str),

    #[error("Account store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
