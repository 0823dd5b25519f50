//! Ordered middleware over `(frame, connection)`.
//!
//! Inbound stages run in registration order and short-circuit on the first
//! non-`Continue` decision: permission gate, token bucket, concurrency gate,
//! per-handler window, then unwrap (decompress, parse, decrypt). Outbound
//! has a single wrap stage that encrypts string fields on request, applies
//! compression, and serializes.
//!
//! Stages are pure decisions: they never write to the peer themselves. The
//! dispatcher turns a `ReplyAndStop` into exactly one directive correlated
//! by the offending frame's sequence id.

use crate::config::TransportConfig;
use crate::core::frame::{
    assemble_frame, Directive, DirectiveFlags, FrameFlags, FrameHeader, Packet, Reason, Advice,
};
use crate::core::pool::{FrameBuffer, ObjectPool, Pooled};
use crate::error::Result;
use crate::protocol::dispatcher::HandlerDescriptor;
use crate::service::connection::Connection;
use crate::utils::compression;
use crate::utils::crypto::CipherSuite;
use crate::utils::limiter::ConcurrencyGate;
use crate::utils::metrics::Metrics;
use std::sync::atomic::Ordering;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Outcome of a single stage.
pub enum StageDecision {
    Continue,
    ReplyAndStop(Directive),
    DropSilently,
}

/// A frame moving through the inbound stack. `packet` is populated by the
/// unwrap stage; earlier stages only consult the header.
pub struct InboundFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub packet: Option<Packet>,
}

/// Shared state handed to every stage for one frame.
pub struct StageContext<'a> {
    pub conn: &'a Connection,
    pub descriptor: &'a HandlerDescriptor,
    pub gate: &'a ConcurrencyGate,
    pub metrics: &'a Metrics,
    /// Permits claimed by stages; released when the handler finishes.
    pub permits: Vec<OwnedSemaphorePermit>,
}

pub trait InboundStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, cx: &mut StageContext<'_>, frame: &mut InboundFrame) -> StageDecision;
}

/// The inbound stack in its configured order.
pub fn build_inbound_stack() -> Vec<Box<dyn InboundStage>> {
    vec![
        Box::new(PermissionStage),
        Box::new(TokenBucketStage),
        Box::new(ConcurrencyStage),
        Box::new(HandlerWindowStage),
        Box::new(UnwrapStage),
    ]
}

/// Stage 1: compare the handler's required level to the session level.
struct PermissionStage;

impl InboundStage for PermissionStage {
    fn name(&self) -> &'static str {
        "permission"
    }

    fn apply(&self, cx: &mut StageContext<'_>, _frame: &mut InboundFrame) -> StageDecision {
        if cx.conn.level() >= cx.descriptor.required_level {
            StageDecision::Continue
        } else {
            StageDecision::ReplyAndStop(Directive::error(Reason::Unauthorized, Advice::DoNotRetry))
        }
    }
}

/// Stage 2: per-connection token bucket.
struct TokenBucketStage;

impl InboundStage for TokenBucketStage {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn apply(&self, cx: &mut StageContext<'_>, _frame: &mut InboundFrame) -> StageDecision {
        if cx.conn.bucket.try_acquire() {
            StageDecision::Continue
        } else {
            cx.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            StageDecision::ReplyAndStop(Directive::error_with(
                Reason::RateLimited,
                Advice::BackoffRetry,
                DirectiveFlags::transient(),
            ))
        }
    }
}

/// Stage 3: process-wide concurrency gate. The permit rides in the stage
/// context until the handler completes.
struct ConcurrencyStage;

impl InboundStage for ConcurrencyStage {
    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn apply(&self, cx: &mut StageContext<'_>, _frame: &mut InboundFrame) -> StageDecision {
        match cx.gate.try_acquire() {
            Some(permit) => {
                cx.permits.push(permit);
                StageDecision::Continue
            }
            None => {
                cx.metrics.concurrency_rejected.fetch_add(1, Ordering::Relaxed);
                StageDecision::ReplyAndStop(Directive::error_with(
                    Reason::ConcurrencyExceeded,
                    Advice::BackoffRetry,
                    DirectiveFlags::transient(),
                ))
            }
        }
    }
}

/// Stage 4: per-handler sliding window from the descriptor metadata.
struct HandlerWindowStage;

impl InboundStage for HandlerWindowStage {
    fn name(&self) -> &'static str {
        "handler_window"
    }

    fn apply(&self, cx: &mut StageContext<'_>, frame: &mut InboundFrame) -> StageDecision {
        let Some(limit) = cx.descriptor.rate_limit else {
            return StageDecision::Continue;
        };
        if cx.conn.windows.check(frame.header.opcode, limit) {
            StageDecision::Continue
        } else {
            cx.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            StageDecision::ReplyAndStop(Directive::error_with(
                Reason::RateLimited,
                Advice::BackoffRetry,
                DirectiveFlags::transient(),
            ))
        }
    }
}

/// Stage 5: enforce the encryption requirement, decompress, parse the
/// class payload, and decrypt string fields. Clears the transform flags.
struct UnwrapStage;

impl InboundStage for UnwrapStage {
    fn name(&self) -> &'static str {
        "unwrap"
    }

    fn apply(&self, cx: &mut StageContext<'_>, frame: &mut InboundFrame) -> StageDecision {
        let flags = frame.header.flags;

        if cx.descriptor.requires_encryption && (!flags.encrypted() || !cx.conn.has_secret()) {
            return StageDecision::ReplyAndStop(Directive::error(
                Reason::NotEncrypted,
                Advice::DoNotRetry,
            ));
        }

        let payload = if flags.compressed() {
            match compression::decompress(&frame.payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "Inbound decompression failed");
                    return StageDecision::ReplyAndStop(Directive::error(
                        Reason::ValidationFailed,
                        Advice::FixAndRetry,
                    ));
                }
            }
        } else {
            std::mem::take(&mut frame.payload)
        };

        let mut packet = match Packet::parse(frame.header.magic, &payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Inbound payload parse failed");
                return StageDecision::ReplyAndStop(Directive::error(
                    Reason::ValidationFailed,
                    Advice::FixAndRetry,
                ));
            }
        };

        if flags.encrypted() {
            let Some(secret) = cx.conn.secret() else {
                return StageDecision::ReplyAndStop(Directive::error(
                    Reason::NotEncrypted,
                    Advice::DoNotRetry,
                ));
            };
            let suite = CipherSuite::new(&secret);
            for field in packet.string_fields_mut() {
                match suite.open_str(field) {
                    Ok(plaintext) => *field = plaintext,
                    Err(e) => {
                        debug!(error = %e, "Inbound field decryption failed");
                        return StageDecision::ReplyAndStop(Directive::error(
                            Reason::ValidationFailed,
                            Advice::FixAndRetry,
                        ));
                    }
                }
            }
        }

        frame.header.flags = flags.clear_encrypted().clear_compressed();
        frame.packet = Some(packet);
        StageDecision::Continue
    }
}

/// A reply about to leave through the outbound stack.
pub struct OutboundFrame {
    pub packet: Packet,
    pub opcode: u16,
    pub sequence: u32,
    pub encrypt: bool,
}

/// Outbound wrap stage: encrypt string fields when the handler requested
/// it, compress above the configured threshold, and serialize into a pooled
/// buffer.
pub fn wrap_outbound(
    conn: &Connection,
    transport: &TransportConfig,
    pool: &ObjectPool<FrameBuffer>,
    mut frame: OutboundFrame,
) -> Result<Pooled<FrameBuffer>> {
    let mut flags = FrameFlags::default();

    if frame.encrypt {
        let secret = conn
            .secret()
            .ok_or(crate::error::ProtocolError::EncryptionFailure)?;
        let suite = CipherSuite::new(&secret);
        for field in frame.packet.string_fields_mut() {
            *field = suite.seal_str(field)?;
        }
        flags = flags.with_encrypted();
    }

    let payload = frame.packet.payload_bytes()?;
    let payload = if transport.compression_enabled {
        let (compressed, applied) =
            compression::maybe_compress(&payload, transport.compression_threshold_bytes);
        if applied {
            flags = flags.with_compressed();
        }
        compressed
    } else {
        payload
    };

    let mut buf = pool.get();
    assemble_frame(
        frame.packet.magic(),
        frame.opcode,
        flags,
        frame.sequence,
        &payload,
        buf.as_mut_vec(),
    )?;
    Ok(buf)
}
