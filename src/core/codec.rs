//! Tokio codec for framing packets over byte streams.
//!
//! The decoder yields validated [`RawFrame`]s: the header is parsed and its
//! magic and length checked, but the payload stays opaque until the inbound
//! middleware stack unwraps it. Incomplete input is reported by returning
//! `None` so the framed reader keeps buffering; bad magic or a bad length is
//! fatal for the connection.

use crate::core::frame::{FrameHeader, RawFrame, HEADER_LEN, MAX_FRAME_LEN};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match FrameHeader::parse(src)? {
            Some(header) => header,
            None => {
                src.reserve(HEADER_LEN);
                return Ok(None);
            }
        };
        let total = header.length as usize;
        if src.len() < total {
            // Known frame size, wait for the rest without reparsing.
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(total - HEADER_LEN).to_vec();
        Ok(Some(RawFrame { header, payload }))
    }
}

/// The encoder takes fully serialized frames; wrapping and serialization
/// happen in the outbound stack before bytes reach the socket.
impl Encoder<Vec<u8>> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::BadLength(u16::MAX));
        }
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{FrameFlags, OpCode, Packet, PacketMagic};

    #[test]
    fn decodes_single_frame() {
        let packet = Packet::Response { status: 1 };
        let bytes = packet
            .encode_vec(OpCode::None as u16, FrameFlags::default(), 5)
            .expect("encode");
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameCodec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete");
        assert_eq!(frame.header.magic, PacketMagic::Response);
        assert_eq!(frame.header.sequence, 5);
        assert_eq!(frame.payload, vec![1]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_keeps_buffer_intact() {
        let packet = Packet::Credentials {
            username: "alice".into(),
            password: "Str0ng!Pass".into(),
        };
        let bytes = packet
            .encode_vec(OpCode::Login as u16, FrameFlags::default(), 1)
            .expect("encode");
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 3]);
        assert!(FrameCodec.decode(&mut buf).expect("no error").is_none());
        assert_eq!(buf.len(), bytes.len() - 3);

        buf.extend_from_slice(&bytes[bytes.len() - 3..]);
        let frame = FrameCodec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete");
        assert_eq!(frame.header.magic, PacketMagic::Credentials);
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let first = Packet::Response { status: 1 }
            .encode_vec(OpCode::None as u16, FrameFlags::default(), 1)
            .expect("encode");
        let second = Packet::Response { status: 2 }
            .encode_vec(OpCode::None as u16, FrameFlags::default(), 2)
            .expect("encode");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let a = FrameCodec.decode(&mut buf).expect("decode").expect("one");
        let b = FrameCodec.decode(&mut buf).expect("decode").expect("two");
        assert_eq!(a.header.sequence, 1);
        assert_eq!(b.header.sequence, 2);
        assert!(FrameCodec.decode(&mut buf).expect("no error").is_none());
    }

    #[test]
    fn garbage_magic_is_fatal() {
        let mut buf = BytesMut::from(&[0xFFu8; 32][..]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }
}
