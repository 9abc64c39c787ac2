//! Peer wire messages
//!
//! Every message after the handshake is a 4-byte big-endian length, a
//! 1-byte type and a payload. A zero length is a keep-alive.

use bytes::{Buf, BufMut, BytesMut};
use anyhow::Result;
use tracing::{error, trace};

use crate::error::TorrentError;

/// Known message type ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// A type id outside the known range, kept so the caller can log it
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Type id on the wire, `None` for keep-alives
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke as u8,
            Message::Unchoke => MessageId::Unchoke as u8,
            Message::Interested => MessageId::Interested as u8,
            Message::NotInterested => MessageId::NotInterested as u8,
            Message::Have { .. } => MessageId::Have as u8,
            Message::Bitfield { .. } => MessageId::Bitfield as u8,
            Message::Request { .. } => MessageId::Request as u8,
            Message::Piece { .. } => MessageId::Piece as u8,
            Message::Cancel { .. } => MessageId::Cancel as u8,
            Message::Port { .. } => MessageId::Port as u8,
            Message::Unknown { id, .. } => *id,
        };
        Some(id)
    }

    /// Length prefix value: type byte plus payload
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Unknown { payload, .. } => 1 + payload.len() as u32,
        }
    }

    /// Encode including the length prefix
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.id() {
            buf.put_u8(id);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Unknown { payload, .. } => buf.put_slice(payload),
            _ => {}
        }

        trace!("Serialized message {:?}: {} bytes", self.id(), buf.len());
        buf.to_vec()
    }

    /// Decode a frame body (type byte already split off).
    ///
    /// Unknown type ids decode to [`Message::Unknown`]; a payload too short
    /// for its type is a protocol error.
    pub fn parse(id: u8, payload: &[u8]) -> Result<Self> {
        let message_id = match MessageId::try_from(id) {
            Ok(message_id) => message_id,
            Err(id) => {
                return Ok(Message::Unknown {
                    id,
                    payload: payload.to_vec(),
                })
            }
        };

        let mut buf = payload;
        let need = |len: usize| -> Result<()> {
            if payload.len() < len {
                error!("{:?} payload too short: expected {} bytes, got {}", message_id, len, payload.len());
                return Err(TorrentError::protocol_error_with_source(
                    format!("{:?} message too short", message_id),
                    format!("expected {} bytes, got {}", len, payload.len()),
                )
                .into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                need(4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                need(12)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                need(8)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece { index, begin, block: buf.to_vec() }
            }
            MessageId::Port => {
                need(2)?;
                Message::Port { listen_port: buf.get_u16() }
            }
        };
        Ok(message)
    }

    /// Decode a complete frame including the length prefix
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_error("Frame shorter than its length prefix").into());
        }
        let mut buf = data;
        let length = buf.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if buf.len() < length {
            return Err(TorrentError::protocol_error_with_source(
                "Truncated frame",
                format!("expected {} bytes, got {}", length, buf.len()),
            )
            .into());
        }
        Self::parse(buf[0], &buf[1..length])
    }
}
