//! Per-connection serialized dispatch.
//!
//! Each connection owns a bounded FIFO of decoded frames and exactly one
//! dispatcher task draining it, so frames from one peer are handled strictly
//! in arrival order while connections progress in parallel. The dispatcher
//! runs the inbound middleware stack, looks the handler up by opcode, scopes
//! it with the descriptor's deadline, and writes the reply through the
//! outbound stack.
//!
//! Handler metadata is a data table built once at startup; lookup is O(1)
//! and the registry is immutable afterwards.

use crate::core::frame::{
    Directive, DirectiveFlags, OpCode, Packet, RawFrame, Reason, Advice,
};
use crate::protocol::middleware::{
    wrap_outbound, InboundFrame, OutboundFrame, StageContext, StageDecision,
};
use crate::protocol::{accounts, handshake, PermissionLevel};
use crate::service::connection::Connection;
use crate::service::server::ServerContext;
use crate::utils::limiter::HandlerRate;
use crate::utils::timeout::DEFAULT_HANDLER_TIMEOUT;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// What a handler hands back to the dispatcher. Handlers never write errors
/// to the peer themselves; every failure is a directive the dispatcher
/// correlates and sends.
pub enum HandlerOutcome {
    /// Send a reply packet, optionally encrypting its string fields.
    Reply { packet: Packet, encrypt: bool },
    /// Send a directive correlated to the request.
    Directive(Directive),
    /// The handler already wrote everything it needed (or nothing).
    None,
}

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerOutcome> + Send>>;

type HandlerFn =
    Arc<dyn Fn(Arc<ServerContext>, Arc<Connection>, Packet, u32) -> HandlerFuture + Send + Sync>;

/// Static metadata plus entry point for one operation.
pub struct HandlerDescriptor {
    pub opcode: OpCode,
    pub required_level: PermissionLevel,
    pub requires_encryption: bool,
    pub timeout: Duration,
    pub rate_limit: Option<HandlerRate>,
    handler: HandlerFn,
}

/// Immutable opcode-to-descriptor table, frozen at startup.
pub struct HandlerRegistry {
    handlers: HashMap<u16, HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn get(&self, opcode: u16) -> Option<&HandlerDescriptor> {
        self.handlers.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

macro_rules! handler_fn {
    ($f:path) => {
        Arc::new(|ctx, conn, packet, sequence| Box::pin($f(ctx, conn, packet, sequence)) as HandlerFuture)
    };
}

/// The built-in operation table.
pub fn builtin_registry() -> HandlerRegistry {
    let mut handlers = HashMap::new();

    let descriptors = [
        HandlerDescriptor {
            opcode: OpCode::Handshake,
            required_level: PermissionLevel::None,
            requires_encryption: false,
            timeout: Duration::from_secs(2),
            rate_limit: Some(HandlerRate {
                max_calls: 5,
                window: Duration::from_secs(60),
            }),
            handler: handler_fn!(handshake::handle),
        },
        HandlerDescriptor {
            opcode: OpCode::Register,
            required_level: PermissionLevel::Guest,
            requires_encryption: true,
            timeout: DEFAULT_HANDLER_TIMEOUT,
            rate_limit: Some(HandlerRate {
                max_calls: 5,
                window: Duration::from_secs(60),
            }),
            handler: handler_fn!(accounts::register),
        },
        HandlerDescriptor {
            opcode: OpCode::Login,
            required_level: PermissionLevel::Guest,
            requires_encryption: true,
            timeout: DEFAULT_HANDLER_TIMEOUT,
            rate_limit: Some(HandlerRate {
                max_calls: 10,
                window: Duration::from_secs(60),
            }),
            handler: handler_fn!(accounts::login),
        },
        HandlerDescriptor {
            opcode: OpCode::Logout,
            required_level: PermissionLevel::User,
            requires_encryption: false,
            timeout: Duration::from_secs(2),
            rate_limit: None,
            handler: handler_fn!(accounts::logout),
        },
        HandlerDescriptor {
            opcode: OpCode::ChangePassword,
            required_level: PermissionLevel::User,
            requires_encryption: true,
            timeout: DEFAULT_HANDLER_TIMEOUT,
            rate_limit: Some(HandlerRate {
                max_calls: 5,
                window: Duration::from_secs(60),
            }),
            handler: handler_fn!(accounts::change_password),
        },
    ];

    for descriptor in descriptors {
        handlers.insert(descriptor.opcode as u16, descriptor);
    }

    HandlerRegistry { handlers }
}

/// Bounded single-consumer FIFO feeding one dispatcher task. Overflow drops
/// the oldest pending frame so a flooding peer only hurts itself.
pub struct DispatchQueue {
    frames: Mutex<VecDeque<RawFrame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame. Returns the displaced oldest frame on overflow so
    /// the caller can answer it with a backpressure directive.
    pub fn push(&self, frame: RawFrame) -> Option<RawFrame> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let displaced = {
            let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
            let displaced = if frames.len() >= self.capacity {
                frames.pop_front()
            } else {
                None
            };
            frames.push_back(frame);
            displaced
        };
        self.notify.notify_one();
        displaced
    }

    /// Dequeue the next frame, waiting if the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<RawFrame> {
        loop {
            {
                let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .map(|frames| frames.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain one connection's queue until it closes. Exactly one of these runs
/// per connection, which is what serializes handler execution.
pub async fn dispatch_loop(ctx: Arc<ServerContext>, conn: Arc<Connection>) {
    while let Some(frame) = conn.queue.pop().await {
        process_frame(&ctx, &conn, frame).await;
    }
    debug!(connection = conn.id(), "Dispatcher drained");
}

async fn process_frame(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, raw: RawFrame) {
    let sequence = raw.header.sequence;

    let Some(descriptor) = ctx.registry.get(raw.header.opcode) else {
        debug!(
            connection = conn.id(),
            opcode = raw.header.opcode,
            "No handler registered for opcode"
        );
        conn.send_directive(
            Directive::error(Reason::UnsupportedPacket, Advice::DoNotRetry),
            sequence,
        );
        return;
    };

    let mut frame = InboundFrame {
        header: raw.header,
        payload: raw.payload,
        packet: None,
    };
    let mut stage_ctx = StageContext {
        conn: conn.as_ref(),
        descriptor,
        gate: &ctx.concurrency,
        metrics: ctx.metrics.as_ref(),
        permits: Vec::new(),
    };

    for stage in &ctx.inbound_stack {
        match stage.apply(&mut stage_ctx, &mut frame) {
            StageDecision::Continue => {}
            StageDecision::ReplyAndStop(directive) => {
                debug!(
                    connection = conn.id(),
                    stage = stage.name(),
                    reason = ?directive.reason,
                    "Inbound stage rejected frame"
                );
                conn.send_directive(directive, sequence);
                return;
            }
            StageDecision::DropSilently => {
                debug!(
                    connection = conn.id(),
                    stage = stage.name(),
                    "Inbound stage dropped frame"
                );
                return;
            }
        }
    }

    let Some(packet) = frame.packet.take() else {
        // The unwrap stage always populates this; a bare stack is a
        // programming error, not a peer problem.
        error!(connection = conn.id(), "Inbound stack left frame unparsed");
        conn.send_directive(
            Directive::error_with(
                Reason::InternalError,
                Advice::BackoffRetry,
                DirectiveFlags::transient(),
            ),
            sequence,
        );
        return;
    };

    conn.set_incoming(packet.clone());

    let handler = (descriptor.handler)(Arc::clone(ctx), Arc::clone(conn), packet, sequence);
    let handler = AssertUnwindSafe(handler).catch_unwind();

    let outcome = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            conn.send_directive(
                Directive::error_with(
                    Reason::Cancelled,
                    Advice::DoNotRetry,
                    DirectiveFlags::transient(),
                ),
                sequence,
            );
            return;
        }
        result = tokio::time::timeout(descriptor.timeout, handler) => match result {
            Err(_) => {
                ctx.metrics.handler_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = conn.id(),
                    opcode = frame.header.opcode,
                    timeout_ms = descriptor.timeout.as_millis() as u64,
                    "Handler deadline expired"
                );
                conn.send_directive(
                    Directive::error_with(
                        Reason::Timeout,
                        Advice::BackoffRetry,
                        DirectiveFlags::transient(),
                    ),
                    sequence,
                );
                return;
            }
            Ok(Err(_panic)) => {
                error!(
                    connection = conn.id(),
                    opcode = frame.header.opcode,
                    "Handler panicked; connection preserved"
                );
                conn.send_directive(
                    Directive::error_with(
                        Reason::InternalError,
                        Advice::BackoffRetry,
                        DirectiveFlags::transient(),
                    ),
                    sequence,
                );
                return;
            }
            Ok(Ok(outcome)) => outcome,
        }
    };

    drop(stage_ctx);

    match outcome {
        HandlerOutcome::Reply { packet, encrypt } => {
            let wrapped = wrap_outbound(
                conn,
                &ctx.config.transport,
                &ctx.pool,
                OutboundFrame {
                    packet,
                    opcode: frame.header.opcode,
                    sequence,
                    encrypt,
                },
            );
            match wrapped {
                Ok(buf) => {
                    if !conn.send_buffer(buf) {
                        debug!(connection = conn.id(), "Peer gone before reply");
                    }
                }
                Err(e) => {
                    error!(connection = conn.id(), error = %e, "Outbound wrap failed");
                    conn.send_directive(
                        Directive::error_with(
                            Reason::InternalError,
                            Advice::BackoffRetry,
                            DirectiveFlags::transient(),
                        ),
                        sequence,
                    );
                }
            }
        }
        HandlerOutcome::Directive(directive) => {
            conn.send_directive(directive, sequence);
        }
        HandlerOutcome::None => {}
    }
}
