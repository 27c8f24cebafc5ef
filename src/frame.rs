//! Frames exchanged by two multiplexers over the physical connection.
//!
//! Every frame starts with an opcode byte and a big-endian `u16` connection id.
//! REQUEST carries a `u32` byte count; TRANSMIT carries a `u32` length followed by
//! that many payload bytes, which are left on the reader for the receiving buffer
//! to consume.

use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Cursor, Read};

use error::{Error, ProtocolError};
use ConnectionId;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Open,
    Close,
    CloseAck,
    Request,
    Transmit,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Opcode> {
        match b {
            0xE1 => Some(Opcode::Open),
            0xE2 => Some(Opcode::Close),
            0xE3 => Some(Opcode::CloseAck),
            0xE4 => Some(Opcode::Request),
            0xE5 => Some(Opcode::Transmit),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match *self {
            Opcode::Open => 0xE1,
            Opcode::Close => 0xE2,
            Opcode::CloseAck => 0xE3,
            Opcode::Request => 0xE4,
            Opcode::Transmit => 0xE5,
        }
    }
}

/// A frame header. TRANSMIT payloads are not part of the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Open(ConnectionId),
    Close(ConnectionId),
    CloseAck(ConnectionId),
    Request(ConnectionId, u32),
    Transmit(ConnectionId, u32),
}

/// The largest encoded header.
pub const MAX_HEADER_LEN: usize = 7;

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match *self {
            Frame::Open(_) => Opcode::Open,
            Frame::Close(_) => Opcode::Close,
            Frame::CloseAck(_) => Opcode::CloseAck,
            Frame::Request(..) => Opcode::Request,
            Frame::Transmit(..) => Opcode::Transmit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        match *self {
            Frame::Open(id) | Frame::Close(id) | Frame::CloseAck(id) => id,
            Frame::Request(id, _) | Frame::Transmit(id, _) => id,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MAX_HEADER_LEN);
        dst.put_u8(self.opcode().as_u8());
        dst.put_u16_be(self.id().0);
        match *self {
            Frame::Request(_, n) | Frame::Transmit(_, n) => dst.put_u32_be(n),
            _ => {}
        }
    }

    /// Reads the next frame header from `src`.
    ///
    /// Returns `None` if `src` ends cleanly before a new frame starts.
    pub fn read<R: Read>(src: &mut R) -> Result<Option<Frame>, Error> {
        let mut op = [0; 1];
        loop {
            match src.read(&mut op) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let opcode = Opcode::from_u8(op[0]).ok_or(ProtocolError::UnknownOpcode(op[0]))?;

        let body_len = match opcode {
            Opcode::Request | Opcode::Transmit => 6,
            _ => 2,
        };
        let mut body = [0; MAX_HEADER_LEN - 1];
        src.read_exact(&mut body[..body_len])?;

        let mut body = Cursor::new(&body[..body_len]);
        let id = ConnectionId(body.get_u16_be());
        let frame = match opcode {
            Opcode::Open => Frame::Open(id),
            Opcode::Close => Frame::Close(id),
            Opcode::CloseAck => Frame::CloseAck(id),
            Opcode::Request => Frame::Request(id, body.get_u32_be()),
            Opcode::Transmit => Frame::Transmit(id, body.get_u32_be()),
        };
        Ok(Some(frame))
    }
}
