//! Wire framing over async streams

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};

/// Upper bound on a single frame; anything larger cannot be a valid piece
/// message for the block sizes in use
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// A raw frame as read from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    KeepAlive,
    Message { id: u8, payload: Vec<u8> },
}

impl Frame {
    /// Decode the frame body into a [`Message`]
    pub fn into_message(self) -> Result<Message> {
        match self {
            Frame::KeepAlive => Ok(Message::KeepAlive),
            Frame::Message { id, payload } => Message::parse(id, &payload),
        }
    }
}

/// Reads and writes peer wire units on any async byte stream
pub trait WireProtocol {
    /// Read one length-prefixed frame. Only transport failures are errors
    /// here; decoding happens in [`Frame::into_message`].
    async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<Frame>;

    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read exactly one 68-byte handshake
    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Standard BitTorrent framing
#[derive(Debug, Default, Clone, Copy)]
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_frame<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<Frame> {
        let length = reader.read_u32().await? as usize;
        if length == 0 {
            return Ok(Frame::KeepAlive);
        }
        if length > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", length),
            ));
        }

        let id = reader.read_u8().await?;
        let mut payload = vec![0u8; length - 1];
        reader.read_exact(&mut payload).await?;
        trace!("Read frame type {} with {} payload bytes", id, payload.len());
        Ok(Frame::Message { id, payload })
    }

    async fn write_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}
