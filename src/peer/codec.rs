//! The BitTorrent V1 wire protocol: the handshake and the length-prefixed
//! peer message frames that follow it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::{BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The static protocol string sent in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake message: 1 + 19 + 8 + 20 + 20 = 68 bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::Protocol(format!(
                "unexpected handshake protocol string length {}",
                prot_len
            )));
        }

        let total_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids of the BitTorrent peer wire protocol.
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
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(Error::Protocol(format!("unknown message id {}", id))),
        }
    }
}

/// A decoded peer message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        // KeepAlive is a zero-length frame, but it must still hit the wire:
        // a client that never sends the four zero bytes will be dropped by
        // peers after their own keep-alive timeout.
        let payload_len = match &msg {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 1 + 4,
            Message::Bitfield(bytes) => 1 + bytes.len(),
            Message::Request(_) | Message::Cancel(_) => 1 + 12,
            Message::Piece { data, .. } => 1 + 8 + data.len(),
        };

        buf.reserve(4 + payload_len);
        buf.put_u32(payload_len as u32);

        match msg {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bytes) => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Cancel(block) => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Piece { piece_index, offset, data } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }

        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0; 4];
        len_buf.copy_from_slice(&buf[0..4]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }

        buf.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::from_u8(buf[0])?;
        buf.advance(1);
        let payload_len = len - 1;

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload_len != 4 {
                    return Err(Error::Protocol(format!(
                        "have message has wrong length {}",
                        payload_len
                    )));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf[..payload_len].to_vec();
                buf.advance(payload_len);
                Message::Bitfield(bytes)
            }
            MessageId::Request | MessageId::Cancel => {
                if payload_len != 12 {
                    return Err(Error::Protocol(format!(
                        "request/cancel message has wrong length {}",
                        payload_len
                    )));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let len = buf.get_u32();
                let block = BlockInfo { piece_index, offset, len };
                if id == MessageId::Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(Error::Protocol(format!(
                        "piece message shorter than 8 bytes: {}",
                        payload_len
                    )));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf[..payload_len - 8].to_vec();
                buf.advance(payload_len - 8);
                Message::Piece { piece_index, offset, data }
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([3u8; 20], [4u8; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        PeerCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_keep_alive_is_actually_written() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_simple_messages_roundtrip() {
        assert_eq!(roundtrip(Message::Choke), Message::Choke);
        assert_eq!(roundtrip(Message::Unchoke), Message::Unchoke);
        assert_eq!(roundtrip(Message::Interested), Message::Interested);
        assert_eq!(roundtrip(Message::NotInterested), Message::NotInterested);
    }

    #[test]
    fn test_have_roundtrip() {
        let msg = Message::Have { piece_index: 42 };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_request_and_cancel_roundtrip() {
        let block = BlockInfo { piece_index: 1, offset: 0x4000, len: 0x4000 };
        assert_eq!(roundtrip(Message::Request(block)), Message::Request(block));
        assert_eq!(roundtrip(Message::Cancel(block)), Message::Cancel(block));
    }

    #[test]
    fn test_piece_roundtrip() {
        let msg = Message::Piece {
            piece_index: 2,
            offset: 0,
            data: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let msg = Message::Bitfield(vec![0xFF, 0x00, 0x80]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_incomplete_frame_awaits_more_data() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }
}
