#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end scenarios over loopback TCP: handshake, registration, login,
//! encryption enforcement, ordering, and logout, against a live listener
//! with the in-memory store.

use futures::{SinkExt, StreamExt};
use realm_protocol::config::NetworkConfig;
use realm_protocol::core::codec::FrameCodec;
use realm_protocol::core::frame::{
    ControlType, Directive, FrameFlags, OpCode, Packet, RawFrame, Reason, Advice,
};
use realm_protocol::protocol::PermissionLevel;
use realm_protocol::service::server::{serve_on, ServerContext};
use realm_protocol::store::MemoryAccountStore;
use realm_protocol::utils::crypto::{self, CipherSuite};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

async fn start_server() -> (Arc<ServerContext>, SocketAddr) {
    let mut config = NetworkConfig::default();
    config.security.pbkdf2_rounds = 1_000;
    let ctx = ServerContext::new(config, Arc::new(MemoryAccountStore::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve_on(Arc::clone(&ctx), listener));
    (ctx, addr)
}

struct Client {
    framed: Framed<TcpStream, FrameCodec>,
    key: Option<[u8; 32]>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec),
            key: None,
        }
    }

    async fn send(&mut self, packet: &Packet, opcode: u16, flags: FrameFlags, sequence: u32) {
        let bytes = packet.encode_vec(opcode, flags, sequence).expect("encode");
        self.framed.send(bytes).await.expect("send");
    }

    async fn recv(&mut self) -> RawFrame {
        tokio::time::timeout(RECV_DEADLINE, self.framed.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("decode")
    }

    /// Receive until the stream ends; panics on a decode error.
    async fn recv_eof(&mut self) {
        loop {
            match tokio::time::timeout(RECV_DEADLINE, self.framed.next())
                .await
                .expect("eof in time")
            {
                None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("unexpected decode error at eof: {e}"),
            }
        }
    }

    async fn recv_directive(&mut self) -> (Directive, u32) {
        let frame = self.recv().await;
        let packet = Packet::parse(frame.header.magic, &frame.payload).expect("payload");
        match packet {
            Packet::Directive(directive) => (directive, frame.header.sequence),
            other => panic!("expected directive, got {other:?}"),
        }
    }

    async fn handshake(&mut self, sequence: u32) {
        let (secret, public) = crypto::generate_keypair();
        self.send(
            &Packet::Handshake {
                public_key: public.to_vec(),
            },
            OpCode::Handshake as u16,
            FrameFlags::default(),
            sequence,
        )
        .await;

        let frame = self.recv().await;
        assert_eq!(frame.header.sequence, sequence);
        let Packet::Handshake { public_key } =
            Packet::parse(frame.header.magic, &frame.payload).expect("payload")
        else {
            panic!("expected handshake reply");
        };
        assert_eq!(public_key.len(), 32);

        let server_public: [u8; 32] = public_key.as_slice().try_into().expect("key width");
        let shared = crypto::agree(secret, &server_public).expect("agree");
        self.key = Some(*crypto::derive_session_key(&shared));
    }

    fn suite(&self) -> CipherSuite {
        CipherSuite::new(self.key.as_ref().expect("handshake first"))
    }

    fn sealed_credentials(&self, username: &str, password: &str) -> Packet {
        let suite = self.suite();
        Packet::Credentials {
            username: suite.seal_str(username).expect("seal"),
            password: suite.seal_str(password).expect("seal"),
        }
    }

    async fn register(&mut self, username: &str, password: &str, sequence: u32) -> (Directive, u32) {
        let packet = self.sealed_credentials(username, password);
        self.send(
            &packet,
            OpCode::Register as u16,
            FrameFlags::default().with_encrypted(),
            sequence,
        )
        .await;
        self.recv_directive().await
    }

    async fn login(&mut self, username: &str, password: &str, sequence: u32) -> (Directive, u32) {
        let packet = self.sealed_credentials(username, password);
        self.send(
            &packet,
            OpCode::Login as u16,
            FrameFlags::default().with_encrypted(),
            sequence,
        )
        .await;
        self.recv_directive().await
    }
}

#[tokio::test]
async fn s1_handshake_installs_guest_session() {
    let (ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(11).await;

    let connections = ctx.hub.snapshot();
    assert_eq!(connections.len(), 1);
    let conn = &connections[0];
    assert_eq!(conn.level(), PermissionLevel::Guest);
    assert!(conn.has_secret());
    assert_eq!(conn.secret().expect("secret").len(), 32);
}

#[tokio::test]
async fn s2_register_then_login_over_the_wire() {
    let (ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(1).await;

    let (directive, sequence) = client.register("alice", "Str0ng!Pass", 2).await;
    assert_eq!(directive.control, ControlType::Ack);
    assert_eq!(sequence, 2);

    let (directive, sequence) = client.login("alice", "Str0ng!Pass", 3).await;
    assert_eq!(directive.control, ControlType::Ack);
    assert_eq!(sequence, 3);

    // The encrypted round-trips prove both sides derived the same key; the
    // hub now resolves the username to the live session.
    let conn = ctx.hub.connection_of("alice").expect("bound");
    assert_eq!(conn.level(), PermissionLevel::User);
    assert_eq!(ctx.hub.username_of(conn.id()).as_deref(), Some("alice"));
}

#[tokio::test]
async fn s5_plaintext_frame_to_encrypted_handler_is_rejected() {
    let (_ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(1).await;

    client
        .send(
            &Packet::Credentials {
                username: "alice".into(),
                password: "Str0ng!Pass".into(),
            },
            OpCode::Register as u16,
            FrameFlags::default(),
            5,
        )
        .await;

    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 5);
    assert_eq!(directive.reason, Reason::NotEncrypted);
    assert_eq!(directive.advice, Advice::DoNotRetry);
}

#[tokio::test]
async fn login_before_handshake_is_unauthorized() {
    let (_ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    client
        .send(
            &Packet::Credentials {
                username: "alice".into(),
                password: "Str0ng!Pass".into(),
            },
            OpCode::Login as u16,
            FrameFlags::default(),
            4,
        )
        .await;

    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 4);
    assert_eq!(directive.reason, Reason::Unauthorized);
}

#[tokio::test]
async fn unknown_opcode_is_unsupported() {
    let (_ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;

    client
        .send(
            &Packet::Response { status: 0 },
            0x0999,
            FrameFlags::default(),
            8,
        )
        .await;

    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 8);
    assert_eq!(directive.reason, Reason::UnsupportedPacket);
}

#[tokio::test]
async fn s6_logout_disconnects_and_unbinds() {
    let (ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(1).await;
    client.register("alice", "Str0ng!Pass", 2).await;
    client.login("alice", "Str0ng!Pass", 3).await;

    client
        .send(
            &Packet::Response { status: 0 },
            OpCode::Logout as u16,
            FrameFlags::default(),
            777,
        )
        .await;

    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 777);
    assert_eq!(directive.control, ControlType::Disconnect);

    // The server closes the socket after the directive.
    client.recv_eof().await;

    assert!(ctx.hub.connection_of("alice").is_none());
}

#[tokio::test]
async fn replies_preserve_request_order_per_connection() {
    let (_ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(1).await;

    // Two registrations in flight before reading any reply.
    let first = client.sealed_credentials("bob_one", "Str0ng!Pass");
    let second = client.sealed_credentials("bob_two", "Str0ng!Pass");
    client
        .send(
            &first,
            OpCode::Register as u16,
            FrameFlags::default().with_encrypted(),
            100,
        )
        .await;
    client
        .send(
            &second,
            OpCode::Register as u16,
            FrameFlags::default().with_encrypted(),
            101,
        )
        .await;

    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 100);
    assert_eq!(directive.control, ControlType::Ack);
    let (directive, sequence) = client.recv_directive().await;
    assert_eq!(sequence, 101);
    assert_eq!(directive.control, ControlType::Ack);
}

#[tokio::test]
async fn corrupt_frame_closes_the_session_without_a_directive() {
    let (_ctx, addr) = start_server().await;
    let mut client = Client::connect(addr).await;
    client.handshake(1).await;

    // Garbage magic: fatal for the session.
    client.framed.send(vec![0xFF; 32]).await.expect("send");
    client.recv_eof().await;
}

#[tokio::test]
async fn second_login_evicts_first_connection() {
    let (ctx, addr) = start_server().await;

    let mut first = Client::connect(addr).await;
    first.handshake(1).await;
    first.register("alice", "Str0ng!Pass", 2).await;
    let (directive, _) = first.login("alice", "Str0ng!Pass", 3).await;
    assert_eq!(directive.control, ControlType::Ack);

    let mut second = Client::connect(addr).await;
    second.handshake(1).await;
    let (directive, _) = second.login("alice", "Str0ng!Pass", 2).await;
    assert_eq!(directive.control, ControlType::Ack);

    // The first session is evicted and its socket closed.
    first.recv_eof().await;
    let holder = ctx.hub.connection_of("alice").expect("bound");
    assert_eq!(ctx.hub.username_of(holder.id()).as_deref(), Some("alice"));
}
