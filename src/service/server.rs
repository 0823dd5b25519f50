//! TCP listener and connection lifecycle.
//!
//! The listener accepts sockets, wraps them in connections, registers them
//! with the hub, and spawns three tasks per connection: a framed read loop,
//! a dispatcher draining the connection's queue, and a writer flushing
//! outbound frames. Graceful shutdown cancels the context token and drains
//! connections under a deadline.

use crate::config::NetworkConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame::{Directive, DirectiveFlags, Reason, Advice};
use crate::core::pool::{FrameBuffer, ObjectPool};
use crate::protocol::dispatcher::{builtin_registry, dispatch_loop, HandlerRegistry};
use crate::protocol::middleware::{build_inbound_stack, InboundStage};
use crate::service::connection::{Connection, WriterCmd};
use crate::service::hub::ConnectionHub;
use crate::store::AccountStore;
use crate::utils::limiter::ConcurrencyGate;
use crate::utils::metrics::Metrics;
use crate::error::Result;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Everything the engine shares, constructed explicitly at startup and
/// passed by `Arc` into handlers and middleware. There are no process-wide
/// singletons.
pub struct ServerContext {
    pub config: NetworkConfig,
    pub hub: ConnectionHub,
    pub pool: ObjectPool<FrameBuffer>,
    pub registry: HandlerRegistry,
    pub store: Arc<dyn AccountStore>,
    pub concurrency: ConcurrencyGate,
    pub inbound_stack: Vec<Box<dyn InboundStage>>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(config: NetworkConfig, store: Arc<dyn AccountStore>) -> Arc<Self> {
        let pool = ObjectPool::new(config.server.max_connections.min(256));
        pool.prealloc(64);
        let concurrency = ConcurrencyGate::new(config.limits.max_inflight_handlers);
        Arc::new(Self {
            config,
            hub: ConnectionHub::new(),
            pool,
            registry: builtin_registry(),
            store,
            concurrency,
            inbound_stack: build_inbound_stack(),
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Bind the configured address and run until shutdown is requested.
#[instrument(skip(ctx), fields(address = %ctx.config.server.address))]
pub async fn serve(ctx: Arc<ServerContext>) -> Result<()> {
    let listener = TcpListener::bind(&ctx.config.server.address).await?;
    serve_on(ctx, listener).await
}

/// Run an already-bound listener until shutdown is requested, then drain.
pub async fn serve_on(ctx: Arc<ServerContext>, listener: TcpListener) -> Result<()> {
    info!(address = %listener.local_addr()?, "Listening");

    let metrics_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = metrics_ctx.shutdown.cancelled() => return,
                _ = ticker.tick() => metrics_ctx.metrics.log_metrics(),
            }
        }
    });

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                drain(&ctx).await;
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if ctx.hub.len() >= ctx.config.server.max_connections {
                        warn!(peer = %addr, "Connection limit reached, refusing socket");
                        continue;
                    }
                    spawn_connection(Arc::clone(&ctx), stream, addr);
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
}

async fn drain(ctx: &Arc<ServerContext>) {
    info!("Shutting down server. Waiting for connections to close...");

    let deadline = tokio::time::sleep(ctx.config.server.shutdown_timeout());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(remaining = ctx.hub.len(), "Shutdown deadline reached, forcing exit");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if ctx.hub.is_empty() {
                    info!("All connections closed, shutting down");
                    break;
                }
            }
        }
    }

    for conn in ctx.hub.snapshot() {
        conn.disconnect();
    }
    ctx.metrics.log_metrics();
}

fn spawn_connection(ctx: Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    let id = ctx.hub.allocate_id();
    let (conn, writer_rx) = Connection::new(
        id,
        addr,
        ctx.pool.clone(),
        Arc::clone(&ctx.metrics),
        ctx.config.server.dispatch_queue_depth,
        &ctx.config.limits,
    );
    ctx.hub.register(Arc::clone(&conn));
    ctx.metrics.connection_established();
    info!(connection = id, peer = %addr, "Connection established");

    let (read_half, write_half) = stream.into_split();

    tokio::spawn(writer_task(write_half, writer_rx, Arc::clone(&ctx)));
    tokio::spawn(dispatch_loop(Arc::clone(&ctx), Arc::clone(&conn)));
    tokio::spawn(read_loop(ctx, conn, read_half));
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::UnboundedReceiver<WriterCmd>,
    ctx: Arc<ServerContext>,
) {
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriterCmd::Frame(buf) => {
                let bytes = buf.as_slice();
                if let Err(e) = write_half.write_all(bytes).await {
                    debug!(error = %e, "Write failed, stopping writer");
                    break;
                }
                ctx.metrics.frame_sent(bytes.len() as u64);
            }
            WriterCmd::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(ctx: Arc<ServerContext>, conn: Arc<Connection>, read_half: OwnedReadHalf) {
    let mut framed = FramedRead::new(read_half, FrameCodec);
    let idle_timeout = ctx.config.server.connection_timeout();

    loop {
        if conn.is_closing() {
            break;
        }
        let next = tokio::select! {
            _ = conn.wait_closed() => break,
            _ = ctx.shutdown.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, framed.next()) => next,
        };

        match next {
            Err(_) => {
                debug!(connection = conn.id(), "Idle timeout, dropping connection");
                break;
            }
            Ok(None) => {
                debug!(connection = conn.id(), "Peer closed the stream");
                break;
            }
            Ok(Some(Err(e))) => {
                // Corrupt frame: fatal for the session, no directive.
                warn!(connection = conn.id(), error = %e, "Fatal decode error");
                break;
            }
            Ok(Some(Ok(frame))) => {
                if !conn.is_accepting() {
                    continue;
                }
                conn.touch();
                ctx.metrics.frame_received(frame.header.length as u64);
                if let Some(dropped) = conn.queue.push(frame) {
                    ctx.metrics.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
                    conn.send_directive(
                        Directive::error_with(
                            Reason::Backpressure,
                            Advice::BackoffRetry,
                            DirectiveFlags::transient(),
                        ),
                        dropped.header.sequence,
                    );
                }
            }
        }
    }

    conn.disconnect();
    ctx.hub.unregister(conn.id());
    ctx.metrics.connection_closed();
    info!(connection = conn.id(), peer = %conn.remote_addr(), "Connection closed");
}
