//! Server side of the ephemeral key exchange.
//!
//! The client opens with its raw X25519 public key; the server generates an
//! ephemeral keypair, derives `Keccak256(X25519(server_priv, client_pub))`
//! as the session key, installs it on the connection, elevates the session
//! to GUEST, and answers with its own public key. Private material never
//! outlives this function: the dalek types wipe themselves on drop.

use crate::core::frame::{Directive, DirectiveFlags, FrameFlags, OpCode, Packet, Reason, Advice, PUBLIC_KEY_LEN};
use crate::protocol::dispatcher::HandlerOutcome;
use crate::protocol::PermissionLevel;
use crate::service::connection::Connection;
use crate::service::server::ServerContext;
use crate::utils::crypto;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn handle(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    packet: Packet,
    sequence: u32,
) -> HandlerOutcome {
    let Packet::Handshake { public_key } = packet else {
        ctx.metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error(
            Reason::UnsupportedPacket,
            Advice::DoNotRetry,
        ));
    };

    if public_key.is_empty() {
        ctx.metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error(
            Reason::MissingRequiredField,
            Advice::FixAndRetry,
        ));
    }

    let Ok(peer_public) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key.as_slice()) else {
        ctx.metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::Directive(Directive::error(
            Reason::ValidationFailed,
            Advice::FixAndRetry,
        ));
    };

    let (server_secret, server_public) = crypto::generate_keypair();
    let shared = match crypto::agree(server_secret, &peer_public) {
        Ok(shared) => shared,
        Err(e) => {
            warn!(connection = conn.id(), error = %e, "Key agreement failed");
            conn.clear_secret();
            conn.set_level(PermissionLevel::None);
            ctx.metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            return HandlerOutcome::Directive(Directive::error_with(
                Reason::InternalError,
                Advice::BackoffRetry,
                DirectiveFlags::transient(),
            ));
        }
    };

    let session_key = crypto::derive_session_key(&shared);
    drop(shared);

    conn.install_secret(session_key);
    conn.set_level(PermissionLevel::Guest);

    let reply = Packet::Handshake {
        public_key: server_public.to_vec(),
    };
    if !conn.send_packet(&reply, OpCode::Handshake as u16, FrameFlags::default(), sequence) {
        // Peer vanished between key installation and the reply. The key is
        // rolled back; the GUEST elevation intentionally is not.
        // TODO: downgrade the level to NONE here once the rollback contract
        // is settled with stakeholders.
        warn!(connection = conn.id(), "Handshake reply failed, rolling back session key");
        conn.clear_secret();
        conn.disconnect();
        ctx.metrics.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        return HandlerOutcome::None;
    }

    ctx.metrics.handshakes_success.fetch_add(1, Ordering::Relaxed);
    debug!(connection = conn.id(), "Handshake complete, session elevated to GUEST");
    HandlerOutcome::None
}
