//! Ohm datagram header and control messages

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use super::WireReader;
use crate::constants::{MAX_FRAME_BYTES, MAX_RESEND_FRAMES};
use crate::error::ProtocolError;

/// Stream datagram signature
pub const OHM_SIGNATURE: &[u8; 4] = b"Ohm ";

/// Only supported protocol version
pub const OHM_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_BYTES: usize = 8;

/// Ohm message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Join,
    Listen,
    Leave,
    Audio,
    Track,
    Metatext,
    Slave,
    Resend,
}

impl MsgType {
    /// Wire value of the tag
    pub fn as_u8(self) -> u8 {
        match self {
            MsgType::Join => 0,
            MsgType::Listen => 1,
            MsgType::Leave => 2,
            MsgType::Audio => 3,
            MsgType::Track => 4,
            MsgType::Metatext => 5,
            MsgType::Slave => 6,
            MsgType::Resend => 7,
        }
    }

    /// Parse a wire tag
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => MsgType::Join,
            1 => MsgType::Listen,
            2 => MsgType::Leave,
            3 => MsgType::Audio,
            4 => MsgType::Track,
            5 => MsgType::Metatext,
            6 => MsgType::Slave,
            7 => MsgType::Resend,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }

    /// Join and Listen announce a consumer to the sender
    pub fn is_presence(self) -> bool {
        matches!(self, MsgType::Join | MsgType::Listen)
    }

    /// Audio, Track and Metatext carry stream payload
    pub fn is_stream(self) -> bool {
        matches!(self, MsgType::Audio | MsgType::Track | MsgType::Metatext)
    }
}

/// Parsed datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OhmHeader {
    pub msg_type: MsgType,
    /// Payload length following the header
    pub bytes: usize,
}

impl OhmHeader {
    pub fn new(msg_type: MsgType, bytes: usize) -> Self {
        Self { msg_type, bytes }
    }

    /// Split a datagram into its header and payload
    ///
    /// Trailing bytes beyond the declared length are ignored.
    pub fn parse(datagram: Bytes) -> Result<(Self, Bytes), ProtocolError> {
        if datagram.len() < HEADER_BYTES {
            return Err(ProtocolError::Truncated(datagram.len()));
        }
        if &datagram[..4] != OHM_SIGNATURE {
            return Err(ProtocolError::BadSignature);
        }

        let mut reader = WireReader::new(datagram.slice(4..));
        let version = reader.u8()?;
        if version != OHM_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = MsgType::from_u8(reader.u8()?)?;
        let bytes = reader.u16()? as usize;

        let available = reader.remaining();
        if bytes > available {
            return Err(ProtocolError::LengthMismatch { declared: bytes, available });
        }

        let payload = reader.bytes(bytes)?;
        Ok((Self { msg_type, bytes }, payload))
    }

    /// Write the header into a buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(OHM_SIGNATURE);
        buf.put_u8(OHM_VERSION);
        buf.put_u8(self.msg_type.as_u8());
        buf.put_u16(self.bytes as u16);
    }
}

/// Build a complete datagram from a type and payload
pub fn frame(msg_type: MsgType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let total = HEADER_BYTES + payload.len();
    if total > MAX_FRAME_BYTES {
        return Err(ProtocolError::TooLarge(total));
    }
    let mut buf = BytesMut::with_capacity(total);
    OhmHeader::new(msg_type, payload.len()).write(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build a payload-less control datagram (Join, Listen, Leave)
pub fn control(msg_type: MsgType) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_BYTES);
    OhmHeader::new(msg_type, 0).write(&mut buf);
    buf.freeze()
}

/// Build resend request datagrams naming the given frames
///
/// Lists longer than [`MAX_RESEND_FRAMES`] are split across datagrams.
pub fn resend_requests(frames: &[u32]) -> Vec<Bytes> {
    frames
        .chunks(MAX_RESEND_FRAMES)
        .map(|chunk| {
            let payload_len = 4 + chunk.len() * 4;
            let mut buf = BytesMut::with_capacity(HEADER_BYTES + payload_len);
            OhmHeader::new(MsgType::Resend, payload_len).write(&mut buf);
            buf.put_u32(chunk.len() as u32);
            for frame in chunk {
                buf.put_u32(*frame);
            }
            buf.freeze()
        })
        .collect()
}

/// Parse a resend payload into frame numbers
pub fn parse_resend(payload: Bytes) -> Result<Vec<u32>, ProtocolError> {
    let mut reader = WireReader::new(payload);
    let count = reader.u32()? as usize;
    if count > MAX_RESEND_FRAMES {
        return Err(ProtocolError::TooLarge(count));
    }
    (0..count).map(|_| reader.u32()).collect()
}

/// Build a slave list datagram
pub fn slave_list(slaves: &[SocketAddrV4]) -> Bytes {
    let payload_len = 4 + slaves.len() * 6;
    let mut buf = BytesMut::with_capacity(HEADER_BYTES + payload_len);
    OhmHeader::new(MsgType::Slave, payload_len).write(&mut buf);
    buf.put_u32(slaves.len() as u32);
    for slave in slaves {
        buf.put_u32(u32::from(*slave.ip()));
        buf.put_u16(slave.port());
    }
    buf.freeze()
}

/// Parse a slave payload; an empty payload yields an empty list
pub fn parse_slave_list(payload: Bytes) -> Result<Vec<SocketAddrV4>, ProtocolError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = WireReader::new(payload);
    let count = reader.u32()? as usize;
    let declared = count.checked_mul(6).ok_or(ProtocolError::TooLarge(count))?;
    if declared > reader.remaining() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            available: reader.remaining(),
        });
    }
    (0..count)
        .map(|_| {
            let ip = Ipv4Addr::from(reader.u32()?);
            let port = reader.u16()?;
            Ok(SocketAddrV4::new(ip, port))
        })
        .collect()
}
