//! Per-socket session state.
//!
//! A connection owns its session key exclusively: other tasks reach the key
//! only through these methods, and the key is wiped whenever it is cleared
//! or the connection drops. Outbound frames travel through a writer channel
//! so any task can send without touching the socket.

use crate::config::LimitsConfig;
use crate::core::frame::{Directive, FrameFlags, OpCode, Packet};
use crate::core::pool::{FrameBuffer, ObjectPool, Pooled};
use crate::protocol::dispatcher::DispatchQueue;
use crate::protocol::PermissionLevel;
use crate::utils::crypto::SessionKey;
use crate::utils::limiter::{RateWindows, TokenBucket};
use crate::utils::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Commands consumed by the connection's writer task.
pub enum WriterCmd {
    Frame(Pooled<FrameBuffer>),
    Close,
}

pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    level: AtomicU8,
    secret: Mutex<Option<SessionKey>>,
    incoming: Mutex<Option<Packet>>,
    accepting: AtomicBool,
    closing: AtomicBool,
    outbound: mpsc::UnboundedSender<WriterCmd>,
    closed: Notify,
    last_activity: Mutex<Instant>,
    pool: ObjectPool<FrameBuffer>,
    metrics: Arc<Metrics>,
    /// Pending inbound frames, drained by this connection's dispatcher task.
    pub queue: DispatchQueue,
    /// Per-connection token bucket (middleware stage 2).
    pub bucket: TokenBucket,
    /// Per-handler sliding windows (middleware stage 4).
    pub windows: RateWindows,
}

impl Connection {
    /// Build a connection and the receiver its writer task will drain.
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        pool: ObjectPool<FrameBuffer>,
        metrics: Arc<Metrics>,
        queue_depth: usize,
        limits: &LimitsConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WriterCmd>) {
        let (outbound, writer_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            remote_addr,
            level: AtomicU8::new(PermissionLevel::None as u8),
            secret: Mutex::new(None),
            incoming: Mutex::new(None),
            accepting: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            outbound,
            closed: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            pool,
            metrics,
            queue: DispatchQueue::new(queue_depth),
            bucket: TokenBucket::new(limits.bucket_capacity, limits.bucket_refill_per_sec),
            windows: RateWindows::new(),
        });
        (conn, writer_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn level(&self) -> PermissionLevel {
        PermissionLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub fn set_level(&self, level: PermissionLevel) {
        self.level.store(level as u8, Ordering::Release);
    }

    /// Clone of the session key, if a handshake has completed.
    pub fn secret(&self) -> Option<SessionKey> {
        self.secret
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_secret(&self) -> bool {
        self.secret
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn install_secret(&self, key: SessionKey) {
        *self.secret.lock().unwrap_or_else(|e| e.into_inner()) = Some(key);
    }

    /// Drop the session key; the wrapper wipes the bytes.
    pub fn clear_secret(&self) {
        *self.secret.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Most recent decoded packet, kept for diagnostics.
    pub fn set_incoming(&self, packet: Packet) {
        *self.incoming.lock().unwrap_or_else(|e| e.into_inner()) = Some(packet);
    }

    pub fn incoming(&self) -> Option<Packet> {
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves when the connection is told to close.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Hand a serialized frame to the writer. Returns false when the peer
    /// is gone.
    pub fn send_buffer(&self, buf: Pooled<FrameBuffer>) -> bool {
        if self.is_closing() {
            return false;
        }
        self.outbound.send(WriterCmd::Frame(buf)).is_ok()
    }

    /// Serialize a packet (no outbound transforms) and send it.
    pub fn send_packet(
        &self,
        packet: &Packet,
        opcode: u16,
        flags: FrameFlags,
        sequence: u32,
    ) -> bool {
        let mut buf = self.pool.get();
        let scratch = buf.as_mut_vec();
        scratch.resize(packet.encoded_len(), 0);
        let written = match packet.encode(opcode, flags, sequence, scratch.as_mut_slice()) {
            Ok(written) => written,
            Err(e) => {
                debug!(connection = self.id, error = %e, "Packet encode failed");
                return false;
            }
        };
        scratch.truncate(written);
        self.send_buffer(buf)
    }

    /// Build and send a directive correlated by `sequence`.
    pub fn send_directive(&self, directive: Directive, sequence: u32) -> bool {
        let sent = self.send_packet(
            &Packet::Directive(directive),
            OpCode::None as u16,
            FrameFlags::default(),
            sequence,
        );
        if sent {
            self.metrics.directives_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Tear the connection down: stop admission, close the dispatch queue,
    /// flush-and-close the writer, and wake the read loop. Idempotent.
    pub fn disconnect(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_accepting();
        self.queue.close();
        let _ = self.outbound.send(WriterCmd::Close);
        self.closed.notify_waiters();
        debug!(connection = self.id, peer = %self.remote_addr, "Connection closing");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Secret is zeroized by its wrapper when the option drops.
        self.clear_secret();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn test_conn() -> (Arc<Connection>, mpsc::UnboundedReceiver<WriterCmd>) {
        Connection::new(
            1,
            "127.0.0.1:40000".parse().expect("addr"),
            ObjectPool::new(8),
            Arc::new(Metrics::new()),
            4,
            &LimitsConfig::default(),
        )
    }

    #[tokio::test]
    async fn starts_unauthenticated() {
        let (conn, _rx) = test_conn();
        assert_eq!(conn.level(), PermissionLevel::None);
        assert!(!conn.has_secret());
        assert!(conn.is_accepting());
        assert!(!conn.is_closing());
    }

    #[tokio::test]
    async fn secret_install_and_clear() {
        let (conn, _rx) = test_conn();
        conn.install_secret(Zeroizing::new([9u8; 32]));
        assert!(conn.has_secret());
        assert_eq!(*conn.secret().expect("secret"), [9u8; 32]);
        conn.clear_secret();
        assert!(!conn.has_secret());
    }

    #[tokio::test]
    async fn send_reaches_writer() {
        let (conn, mut rx) = test_conn();
        assert!(conn.send_directive(Directive::ack(), 7));
        match rx.recv().await.expect("command") {
            WriterCmd::Frame(buf) => {
                let header = crate::core::frame::FrameHeader::parse(buf.as_slice())
                    .expect("parse")
                    .expect("complete");
                assert_eq!(header.sequence, 7);
            }
            WriterCmd::Close => panic!("expected frame"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_sends() {
        let (conn, mut rx) = test_conn();
        conn.disconnect();
        conn.disconnect();
        assert!(conn.is_closing());
        assert!(!conn.send_directive(Directive::ack(), 1));
        match rx.recv().await.expect("command") {
            WriterCmd::Close => {}
            WriterCmd::Frame(_) => panic!("expected close"),
        }
    }
}
