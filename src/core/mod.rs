//! # Core Protocol Components
//!
//! Low-level packet handling, codecs, and the wire format.
//!
//! ## Components
//! - **Frame**: binary packet format with magic values and length validation
//! - **Codec**: tokio codec for framing over byte streams
//! - **Pool**: bounded object pool for serialization scratch buffers
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Length(2)] [Opcode(2)] [Flags(1)] [Sequence(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 64 KiB - 1 (prevents memory exhaustion)
//! - Magic values prevent accidental misinterpretation
//! - Length validation before allocation

pub mod codec;
pub mod frame;
pub mod pool;
