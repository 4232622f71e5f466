//! The wire protocol: the fixed-size handshake record and the length-framed
//! message set exchanged after it.
//!
//! Both directions of a connection speak the handshake codec first and are
//! then switched over to the message codec, reusing the read and write
//! buffers so that bytes the remote pipelined behind its handshake are not
//! lost.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, PeerId, PieceIndex, PROTOCOL_STRING};

/// The handshake is the first record exchanged on a new connection, in both
/// directions. It is a fixed 32 bytes: the 18-byte protocol string, 10 zero
/// bytes, and the sender's id as a 4-byte big endian integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub peer_id: PeerId,
}

impl Handshake {
    pub const LEN: usize = 32;
    const RESERVED_LEN: usize = 10;

    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(Handshake::LEN);
        dst.extend_from_slice(PROTOCOL_STRING.as_bytes());
        dst.extend_from_slice(&[0; Handshake::RESERVED_LEN]);
        dst.put_u32(handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.len() < Handshake::LEN {
            return Ok(None);
        }
        let mut record = src.split_to(Handshake::LEN);
        if &record[..PROTOCOL_STRING.len()] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::HandshakeProtocol);
        }
        record.advance(PROTOCOL_STRING.len() + Handshake::RESERVED_LEN);
        Ok(Some(Handshake {
            peer_id: record.get_u32(),
        }))
    }
}

/// The message types, as they appear in a frame's type byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        use MessageId::*;
        match byte {
            byte if byte == Choke as u8 => Ok(Choke),
            byte if byte == Unchoke as u8 => Ok(Unchoke),
            byte if byte == Interested as u8 => Ok(Interested),
            byte if byte == NotInterested as u8 => Ok(NotInterested),
            byte if byte == Have as u8 => Ok(Have),
            byte if byte == Bitfield as u8 => Ok(Bitfield),
            byte if byte == Request as u8 => Ok(Request),
            byte if byte == Piece as u8 => Ok(Piece),
            byte => Err(Error::InvalidMessageId(byte)),
        }
    }
}

/// A message exchanged after the handshake. On the wire a message is framed
/// as `length ‖ type ‖ payload`, where the 4-byte big endian length covers
/// the type byte and the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// The sender's full piece availability. Only legal as the first message
    /// after the handshake.
    Bitfield(Bitfield),
    Request {
        piece_index: PieceIndex,
    },
    Piece {
        piece_index: PieceIndex,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let id = msg.id() as u8;
        match msg {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id);
            }
            Message::Have { piece_index } | Message::Request { piece_index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(id);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(mut bitfield) => {
                // the padding bits after the last piece must be zero on the
                // wire
                bitfield.set_uninitialized(false);
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(id);
                dst.extend_from_slice(raw);
            }
            Message::Piece { piece_index, data } => {
                dst.put_u32(1 + 4 + data.len() as u32);
                dst.put_u8(id);
                dst.put_u32(piece_index as u32);
                dst.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        // peek at the length without advancing the cursor, so that a partial
        // frame leaves the buffer untouched until the rest arrives
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len == 0 {
            // the length covers the type byte, so no legal frame is empty
            return Err(Error::InvalidPayload("frame"));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(frame_len);

        let id = MessageId::try_from(frame.get_u8())?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: decode_piece_index(&mut frame, "have")?,
            },
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => Message::Request {
                piece_index: decode_piece_index(&mut frame, "request")?,
            },
            MessageId::Piece => Message::Piece {
                piece_index: decode_piece_index(&mut frame, "piece")?,
                data: frame.to_vec(),
            },
        };
        Ok(Some(msg))
    }
}

fn decode_piece_index(
    frame: &mut BytesMut,
    msg: &'static str,
) -> Result<PieceIndex> {
    if frame.len() < 4 {
        return Err(Error::InvalidPayload(msg));
    }
    Ok(frame.get_u32() as PieceIndex)
}

#[cfg(test)]
mod tests {
    use bitvec::bitvec;
    use bitvec::prelude::Msb0;
    use futures::{SinkExt, StreamExt};
    use pretty_assertions::assert_eq;
    use tokio_util::codec::Framed;

    use super::*;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_handshake_layout() {
        let buf = encode_handshake(Handshake::new(1001));
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..18], b"P2PFILESHARINGPROJ");
        assert_eq!(&buf[18..28], &[0; 10]);
        assert_eq!(&buf[28..], &1001u32.to_be_bytes());
    }

    #[test]
    fn test_handshake_round_trip() {
        for peer_id in [0, 1, 1001, 0x1234_5678, i32::MAX as PeerId] {
            let mut buf = encode_handshake(Handshake::new(peer_id));
            let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.peer_id, peer_id);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_handshake_rejects_corrupted_protocol_string() {
        for pos in 0..18 {
            let mut buf = encode_handshake(Handshake::new(1001));
            buf[pos] ^= 0x01;
            assert!(matches!(
                HandshakeCodec.decode(&mut buf),
                Err(Error::HandshakeProtocol)
            ));
        }
    }

    #[test]
    fn test_handshake_waits_for_full_record() {
        let full = encode_handshake(Handshake::new(42));
        let mut buf = BytesMut::from(&full[..31]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[31..]);
        assert_eq!(
            HandshakeCodec.decode(&mut buf).unwrap(),
            Some(Handshake::new(42))
        );
    }

    fn round_trip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_flag_message_round_trips() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_indexed_message_round_trips() {
        assert_eq!(
            round_trip(Message::Have { piece_index: 311 }),
            Message::Have { piece_index: 311 }
        );
        assert_eq!(
            round_trip(Message::Request { piece_index: 0 }),
            Message::Request { piece_index: 0 }
        );
        let msg = Message::Piece {
            piece_index: 7,
            data: (0..=255).collect(),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_empty_piece_payload_round_trips() {
        let msg = Message::Piece {
            piece_index: 3,
            data: Vec::new(),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn test_bitfield_round_trips_with_zero_padding() {
        for piece_count in [1, 7, 8, 9, 100] {
            let mut bitfield = bitvec![u8, Msb0; 0; piece_count];
            for index in (0..piece_count).step_by(3) {
                bitfield.set(index, true);
            }

            let mut buf = BytesMut::new();
            PeerCodec
                .encode(Message::Bitfield(bitfield.clone()), &mut buf)
                .unwrap();
            // length prefix ‖ type ‖ ceil(piece_count / 8) payload bytes
            let expected_payload_len = (piece_count + 7) / 8;
            assert_eq!(buf.len(), 4 + 1 + expected_payload_len);

            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            let Message::Bitfield(mut decoded) = decoded else {
                panic!("expected bitfield, got {:?}", decoded);
            };
            // the wire form is rounded up to whole bytes; the receiver trims
            // it back to the piece count
            assert_eq!(decoded[piece_count..].count_ones(), 0);
            decoded.resize(piece_count, false);
            assert_eq!(decoded, bitfield);
        }
    }

    #[test]
    fn test_decoder_waits_for_full_frame() {
        let msg = Message::Piece {
            piece_index: 2,
            data: vec![9; 100],
        };
        let mut encoded = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(7) {
            let before = PeerCodec.decode(&mut buf).unwrap();
            assert_eq!(before, None);
            buf.extend_from_slice(chunk);
        }
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decoder_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(8);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidMessageId(8))
        ));
    }

    #[test]
    fn test_decoder_rejects_truncated_have() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidPayload("have"))
        ));
    }

    #[test]
    fn test_back_to_back_frames_decode_individually() {
        let first = Message::Have { piece_index: 1 };
        let second = Message::Request { piece_index: 2 };
        let mut buf = BytesMut::new();
        PeerCodec.encode(first.clone(), &mut buf).unwrap();
        PeerCodec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_framed_stream_round_trip() {
        let (near, far) = tokio::io::duplex(4096);
        let mut near = Framed::new(near, PeerCodec);
        let mut far = Framed::new(far, PeerCodec);

        let msgs = vec![
            Message::Interested,
            Message::Have { piece_index: 12 },
            Message::Piece {
                piece_index: 12,
                data: vec![3; 104],
            },
        ];
        for msg in &msgs {
            near.send(msg.clone()).await.unwrap();
        }
        drop(near);

        let mut received = Vec::new();
        while let Some(msg) = far.next().await {
            received.push(msg.unwrap());
        }
        assert_eq!(received, msgs);
    }
}
