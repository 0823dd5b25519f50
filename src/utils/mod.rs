//! # Utility Modules
//!
//! Supporting utilities for cryptography, password hashing, compression,
//! admission control, logging, and timing.
//!
//! ## Components
//! - **Crypto**: X25519 key agreement, Keccak-256 derivation, XChaCha20-Poly1305
//! - **Password**: PBKDF2-HMAC-SHA256 with constant-time verification
//! - **Compression**: LZ4 with size limits and thresholds
//! - **Limiter**: token bucket, per-handler windows, concurrency gate
//! - **Logging**: structured logging configuration
//! - **Timeout**: async timeout wrappers
//! - **Metrics**: thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Decompression bomb protection (frame-ceiling limit)
//! - Memory zeroing for sensitive data (zeroize crate)

pub mod compression;
pub mod crypto;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod password;
pub mod timeout;
