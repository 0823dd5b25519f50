//! # Wire Frames
//!
//! Binary packet format: a fixed 13-byte little-endian header followed by a
//! per-class payload.
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Length(2)] [Opcode(2)] [Flags(1)] [Sequence(4)] [Payload(N)]
//! ```
//!
//! `Length` counts the whole frame including the header. Strings inside
//! payloads are a 2-byte length prefix followed by UTF-8 bytes.
//!
//! ## Security
//! - Maximum frame size: 64 KiB - 1 (prevents memory exhaustion)
//! - Magic values prevent accidental misinterpretation
//! - Length validation before any payload access

use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 13;

/// Maximum total frame size (header included).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Maximum encoded username length in bytes.
pub const MAX_USERNAME_BYTES: usize = 20;

/// Maximum encoded password length in bytes.
pub const MAX_PASSWORD_BYTES: usize = 128;

/// Length of a raw X25519 public key carried by a handshake frame.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Packet class identifiers. The catalog below is the source of truth for
/// which magics the codec accepts; anything else is a fatal decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketMagic {
    /// `HSK1` - ephemeral key exchange, both directions
    Handshake = 0x314B_5348,
    /// `CRD1` - username/password submission, client to server
    Credentials = 0x3144_5243,
    /// `CPW1` - old/new password submission, client to server
    ChangePassword = 0x3157_5043,
    /// `RSP1` - one-byte status, server to client
    Response = 0x3150_5352,
    /// `DIR1` - control reply with reason and retry advice, server to client
    Directive = 0x3152_4944,
}

impl PacketMagic {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x314B_5348 => Some(Self::Handshake),
            0x3144_5243 => Some(Self::Credentials),
            0x3157_5043 => Some(Self::ChangePassword),
            0x3150_5352 => Some(Self::Response),
            0x3152_4944 => Some(Self::Directive),
            _ => None,
        }
    }
}

/// Operation identifiers, routed by the handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    None = 0x0000,
    Handshake = 0x0001,
    Register = 0x0002,
    Login = 0x0003,
    Logout = 0x0004,
    ChangePassword = 0x0005,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::None),
            0x0001 => Some(Self::Handshake),
            0x0002 => Some(Self::Register),
            0x0003 => Some(Self::Login),
            0x0004 => Some(Self::Logout),
            0x0005 => Some(Self::ChangePassword),
            _ => None,
        }
    }
}

/// Per-frame flag bits. Bits 2..7 are reserved: ignored on decode, zero on
/// encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const ENCRYPTED: u8 = 0b0000_0001;
    pub const COMPRESSED: u8 = 0b0000_0010;

    pub fn encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn with_encrypted(self) -> Self {
        Self(self.0 | Self::ENCRYPTED)
    }

    pub fn with_compressed(self) -> Self {
        Self(self.0 | Self::COMPRESSED)
    }

    pub fn clear_encrypted(self) -> Self {
        Self(self.0 & !Self::ENCRYPTED)
    }

    pub fn clear_compressed(self) -> Self {
        Self(self.0 & !Self::COMPRESSED)
    }
}

/// Decoded frame header. `opcode` stays raw so that unknown operations can
/// be answered with a directive instead of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: PacketMagic,
    pub length: u16,
    pub opcode: u16,
    pub flags: FrameFlags,
    pub sequence: u32,
}

impl FrameHeader {
    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are
    /// available (incomplete), and an error for unknown magic or an
    /// out-of-bounds length.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic_raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let magic = PacketMagic::from_u32(magic_raw).ok_or(ProtocolError::BadMagic(magic_raw))?;
        let length = u16::from_le_bytes([buf[4], buf[5]]);
        if (length as usize) < HEADER_LEN {
            return Err(ProtocolError::BadLength(length));
        }
        let opcode = u16::from_le_bytes([buf[6], buf[7]]);
        let flags = FrameFlags(buf[8]);
        let sequence = u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]);
        Ok(Some(Self {
            magic,
            length,
            opcode,
            flags,
            sequence,
        }))
    }

    fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&(self.magic as u32).to_le_bytes());
        out[4..6].copy_from_slice(&self.length.to_le_bytes());
        out[6..8].copy_from_slice(&self.opcode.to_le_bytes());
        out[8] = self.flags.0;
        out[9..13].copy_from_slice(&self.sequence.to_le_bytes());
    }
}

/// A validated but unparsed frame: header plus raw payload bytes.
///
/// The codec produces these; payload parsing (and decompression and
/// decryption) happens in the inbound middleware stack so that admission
/// decisions never touch untrusted payload content.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Directive control types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    Ack = 0,
    Error = 1,
    Disconnect = 2,
}

impl ControlType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ack),
            1 => Some(Self::Error),
            2 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Directive reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reason {
    None = 0,
    UnsupportedPacket = 1,
    ValidationFailed = 2,
    InvalidUsername = 3,
    WeakPassword = 4,
    Unauthenticated = 5,
    AccountLocked = 6,
    AccountSuspended = 7,
    AlreadyExists = 8,
    SessionNotFound = 9,
    MissingRequiredField = 10,
    RateLimited = 11,
    ConcurrencyExceeded = 12,
    NotEncrypted = 13,
    Timeout = 14,
    Cancelled = 15,
    ClientQuit = 16,
    Backpressure = 17,
    InternalError = 18,
    Unauthorized = 19,
}

impl Reason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::UnsupportedPacket),
            2 => Some(Self::ValidationFailed),
            3 => Some(Self::InvalidUsername),
            4 => Some(Self::WeakPassword),
            5 => Some(Self::Unauthenticated),
            6 => Some(Self::AccountLocked),
            7 => Some(Self::AccountSuspended),
            8 => Some(Self::AlreadyExists),
            9 => Some(Self::SessionNotFound),
            10 => Some(Self::MissingRequiredField),
            11 => Some(Self::RateLimited),
            12 => Some(Self::ConcurrencyExceeded),
            13 => Some(Self::NotEncrypted),
            14 => Some(Self::Timeout),
            15 => Some(Self::Cancelled),
            16 => Some(Self::ClientQuit),
            17 => Some(Self::Backpressure),
            18 => Some(Self::InternalError),
            19 => Some(Self::Unauthorized),
            _ => None,
        }
    }
}

/// Retry advice carried alongside a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Advice {
    None = 0,
    DoNotRetry = 1,
    FixAndRetry = 2,
    Reauthenticate = 3,
    BackoffRetry = 4,
}

impl Advice {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::DoNotRetry),
            2 => Some(Self::FixAndRetry),
            3 => Some(Self::Reauthenticate),
            4 => Some(Self::BackoffRetry),
            _ => None,
        }
    }
}

/// Directive flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectiveFlags(pub u8);

impl DirectiveFlags {
    pub const IS_TRANSIENT: u8 = 0b0000_0001;
    pub const IS_AUTH_RELATED: u8 = 0b0000_0010;

    pub fn transient() -> Self {
        Self(Self::IS_TRANSIENT)
    }

    pub fn auth_related() -> Self {
        Self(Self::IS_AUTH_RELATED)
    }

    pub fn is_transient(self) -> bool {
        self.0 & Self::IS_TRANSIENT != 0
    }

    pub fn is_auth_related(self) -> bool {
        self.0 & Self::IS_AUTH_RELATED != 0
    }
}

/// Server-to-client control reply. The correlation sequence lives in the
/// frame header, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub control: ControlType,
    pub reason: Reason,
    pub advice: Advice,
    pub flags: DirectiveFlags,
}

impl Directive {
    pub fn ack() -> Self {
        Self {
            control: ControlType::Ack,
            reason: Reason::None,
            advice: Advice::None,
            flags: DirectiveFlags::default(),
        }
    }

    pub fn error(reason: Reason, advice: Advice) -> Self {
        Self {
            control: ControlType::Error,
            reason,
            advice,
            flags: DirectiveFlags::default(),
        }
    }

    pub fn error_with(reason: Reason, advice: Advice, flags: DirectiveFlags) -> Self {
        Self {
            control: ControlType::Error,
            reason,
            advice,
            flags,
        }
    }

    pub fn disconnect(reason: Reason) -> Self {
        Self {
            control: ControlType::Disconnect,
            reason,
            advice: Advice::DoNotRetry,
            flags: DirectiveFlags::default(),
        }
    }
}

/// Typed packet payloads, one variant per packet class. The codec dispatches
/// on [`PacketMagic`]; inheritance in the wire model is replaced by this
/// tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake { public_key: Vec<u8> },
    Credentials { username: String, password: String },
    CredsUpdate { old_password: String, new_password: String },
    Directive(Directive),
    Response { status: u8 },
}

impl Packet {
    pub fn magic(&self) -> PacketMagic {
        match self {
            Packet::Handshake { .. } => PacketMagic::Handshake,
            Packet::Credentials { .. } => PacketMagic::Credentials,
            Packet::CredsUpdate { .. } => PacketMagic::ChangePassword,
            Packet::Directive(_) => PacketMagic::Directive,
            Packet::Response { .. } => PacketMagic::Response,
        }
    }

    /// Parse a class-specific payload. Called from the unwrap middleware
    /// stage after decompression, never from the codec itself.
    pub fn parse(magic: PacketMagic, payload: &[u8]) -> Result<Self> {
        match magic {
            PacketMagic::Handshake => Ok(Packet::Handshake {
                public_key: payload.to_vec(),
            }),
            PacketMagic::Credentials => {
                let mut cursor = 0usize;
                let username = read_string(payload, &mut cursor)?;
                let password = read_string(payload, &mut cursor)?;
                expect_consumed(payload, cursor)?;
                Ok(Packet::Credentials { username, password })
            }
            PacketMagic::ChangePassword => {
                let mut cursor = 0usize;
                let old_password = read_string(payload, &mut cursor)?;
                let new_password = read_string(payload, &mut cursor)?;
                expect_consumed(payload, cursor)?;
                Ok(Packet::CredsUpdate {
                    old_password,
                    new_password,
                })
            }
            PacketMagic::Directive => {
                if payload.len() != 4 {
                    return Err(ProtocolError::Malformed("directive payload must be 4 bytes"));
                }
                let control = ControlType::from_u8(payload[0])
                    .ok_or(ProtocolError::Malformed("unknown control type"))?;
                let reason = Reason::from_u8(payload[1])
                    .ok_or(ProtocolError::Malformed("unknown reason code"))?;
                let advice = Advice::from_u8(payload[2])
                    .ok_or(ProtocolError::Malformed("unknown advice code"))?;
                Ok(Packet::Directive(Directive {
                    control,
                    reason,
                    advice,
                    flags: DirectiveFlags(payload[3]),
                }))
            }
            PacketMagic::Response => {
                if payload.len() != 1 {
                    return Err(ProtocolError::Malformed("response payload must be 1 byte"));
                }
                Ok(Packet::Response { status: payload[0] })
            }
        }
    }

    /// Exact number of payload bytes `write_payload` will produce.
    pub fn payload_len(&self) -> usize {
        match self {
            Packet::Handshake { public_key } => public_key.len(),
            Packet::Credentials { username, password } => 4 + username.len() + password.len(),
            Packet::CredsUpdate {
                old_password,
                new_password,
            } => 4 + old_password.len() + new_password.len(),
            Packet::Directive(_) => 4,
            Packet::Response { .. } => 1,
        }
    }

    /// Total encoded frame size, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    /// Serialize only the class payload. The outbound wrap stage transforms
    /// these bytes (compression) before the header is attached.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.payload_len());
        self.write_payload(&mut out)?;
        Ok(out)
    }

    fn write_payload(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Packet::Handshake { public_key } => out.extend_from_slice(public_key),
            Packet::Credentials { username, password } => {
                write_string(out, username)?;
                write_string(out, password)?;
            }
            Packet::CredsUpdate {
                old_password,
                new_password,
            } => {
                write_string(out, old_password)?;
                write_string(out, new_password)?;
            }
            Packet::Directive(d) => {
                out.push(d.control as u8);
                out.push(d.reason as u8);
                out.push(d.advice as u8);
                out.push(d.flags.0);
            }
            Packet::Response { status } => out.push(*status),
        }
        Ok(())
    }

    /// Serialize this packet into a caller-provided span.
    ///
    /// Returns the number of bytes written, or `BufferTooSmall` without
    /// touching `out` when the span cannot hold the frame.
    pub fn encode(&self, opcode: u16, flags: FrameFlags, sequence: u32, out: &mut [u8]) -> Result<usize> {
        let total = self.encoded_len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::BadLength(u16::MAX));
        }
        if out.len() < total {
            return Err(ProtocolError::BufferTooSmall {
                needed: total,
                available: out.len(),
            });
        }
        let mut payload = Vec::with_capacity(total - HEADER_LEN);
        self.write_payload(&mut payload)?;
        let header = FrameHeader {
            magic: self.magic(),
            length: total as u16,
            opcode,
            flags,
            sequence,
        };
        header.write(&mut out[..HEADER_LEN]);
        out[HEADER_LEN..total].copy_from_slice(&payload);
        Ok(total)
    }

    /// Serialize into a fresh buffer. Convenience wrapper over [`encode`].
    ///
    /// [`encode`]: Packet::encode
    pub fn encode_vec(&self, opcode: u16, flags: FrameFlags, sequence: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_len()];
        let written = self.encode(opcode, flags, sequence, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Mutable access to the string fields of this class, in payload order.
    /// The wrap/unwrap middleware stages transform exactly these fields when
    /// the `ENCRYPTED` flag is in play.
    pub fn string_fields_mut(&mut self) -> Vec<&mut String> {
        match self {
            Packet::Credentials { username, password } => vec![username, password],
            Packet::CredsUpdate {
                old_password,
                new_password,
            } => vec![old_password, new_password],
            _ => Vec::new(),
        }
    }
}

/// Assemble a complete frame from parts into `out`, which is cleared first.
/// Used by the outbound wrap stage after payload transforms. Returns the
/// total frame size.
pub fn assemble_frame(
    magic: PacketMagic,
    opcode: u16,
    flags: FrameFlags,
    sequence: u32,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<usize> {
    let total = HEADER_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(ProtocolError::BadLength(u16::MAX));
    }
    out.clear();
    out.resize(total, 0);
    let header = FrameHeader {
        magic,
        length: total as u16,
        opcode,
        flags,
        sequence,
    };
    header.write(&mut out[..HEADER_LEN]);
    out[HEADER_LEN..].copy_from_slice(payload);
    Ok(total)
}

// Ciphertext expands plaintext, so the on-wire bound here is the frame
// ceiling; the plaintext field limits are enforced after decryption.
fn read_string(payload: &[u8], cursor: &mut usize) -> Result<String> {
    let start = *cursor;
    if payload.len() < start + 2 {
        return Err(ProtocolError::Malformed("truncated string length"));
    }
    let len = u16::from_le_bytes([payload[start], payload[start + 1]]) as usize;
    let end = start + 2 + len;
    if payload.len() < end {
        return Err(ProtocolError::Malformed("truncated string bytes"));
    }
    let value = std::str::from_utf8(&payload[start + 2..end])
        .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8"))?
        .to_string();
    *cursor = end;
    Ok(value)
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(ProtocolError::Malformed(crate::error::constants::ERR_STRING_TOO_LONG));
    }
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn expect_consumed(payload: &[u8], cursor: usize) -> Result<()> {
    if cursor != payload.len() {
        return Err(ProtocolError::Malformed("trailing bytes after payload"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet, opcode: u16, sequence: u32) -> Packet {
        let bytes = packet
            .encode_vec(opcode, FrameFlags::default(), sequence)
            .expect("encode");
        let header = FrameHeader::parse(&bytes).expect("parse").expect("complete");
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.opcode, opcode);
        assert_eq!(header.sequence, sequence);
        Packet::parse(header.magic, &bytes[HEADER_LEN..]).expect("payload")
    }

    #[test]
    fn handshake_roundtrip() {
        let packet = Packet::Handshake {
            public_key: vec![0x01; PUBLIC_KEY_LEN],
        };
        assert_eq!(roundtrip(packet.clone(), OpCode::Handshake as u16, 7), packet);
    }

    #[test]
    fn credentials_roundtrip() {
        let packet = Packet::Credentials {
            username: "alice".into(),
            password: "Str0ng!Pass".into(),
        };
        assert_eq!(roundtrip(packet.clone(), OpCode::Login as u16, 42), packet);
    }

    #[test]
    fn creds_update_roundtrip() {
        let packet = Packet::CredsUpdate {
            old_password: "Str0ng!Pass".into(),
            new_password: "New0nger!Pass".into(),
        };
        assert_eq!(
            roundtrip(packet.clone(), OpCode::ChangePassword as u16, 9),
            packet
        );
    }

    #[test]
    fn directive_roundtrip() {
        let packet = Packet::Directive(Directive::error_with(
            Reason::RateLimited,
            Advice::BackoffRetry,
            DirectiveFlags::transient(),
        ));
        assert_eq!(roundtrip(packet.clone(), OpCode::None as u16, 0), packet);
    }

    #[test]
    fn response_roundtrip() {
        let packet = Packet::Response { status: 3 };
        assert_eq!(roundtrip(packet.clone(), OpCode::None as u16, 1), packet);
    }

    #[test]
    fn length_counts_header_and_payload() {
        let packet = Packet::Response { status: 0 };
        let bytes = packet
            .encode_vec(0, FrameFlags::default(), 0)
            .expect("encode");
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        let header = FrameHeader::parse(&bytes).expect("parse").expect("complete");
        assert_eq!(header.length as usize, HEADER_LEN + 1);
    }

    #[test]
    fn truncated_header_is_incomplete() {
        let packet = Packet::Response { status: 0 };
        let bytes = packet
            .encode_vec(0, FrameFlags::default(), 0)
            .expect("encode");
        assert!(FrameHeader::parse(&bytes[..HEADER_LEN - 1])
            .expect("no error")
            .is_none());
    }

    #[test]
    fn unknown_magic_rejected() {
        let mut bytes = Packet::Response { status: 0 }
            .encode_vec(0, FrameFlags::default(), 0)
            .expect("encode");
        bytes[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(ProtocolError::BadMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn undersized_length_rejected() {
        let mut bytes = Packet::Response { status: 0 }
            .encode_vec(0, FrameFlags::default(), 0)
            .expect("encode");
        bytes[4..6].copy_from_slice(&(HEADER_LEN as u16 - 1).to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(ProtocolError::BadLength(_))
        ));
    }

    #[test]
    fn buffer_too_small_reported() {
        let packet = Packet::Credentials {
            username: "alice".into(),
            password: "Str0ng!Pass".into(),
        };
        let mut out = vec![0u8; 4];
        assert!(matches!(
            packet.encode(OpCode::Login as u16, FrameFlags::default(), 1, &mut out),
            Err(ProtocolError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn directive_with_bad_reason_rejected() {
        let payload = [0u8, 200, 0, 0];
        assert!(Packet::parse(PacketMagic::Directive, &payload).is_err());
    }

    #[test]
    fn credentials_with_trailing_bytes_rejected() {
        let packet = Packet::Credentials {
            username: "bob".into(),
            password: "Str0ng!Pass".into(),
        };
        let mut bytes = packet
            .encode_vec(OpCode::Login as u16, FrameFlags::default(), 0)
            .expect("encode");
        bytes.push(0xFF);
        assert!(Packet::parse(PacketMagic::Credentials, &bytes[HEADER_LEN..]).is_err());
    }
}
