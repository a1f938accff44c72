//! Ohm / Ohz wire format
//!
//! Every stream datagram starts with an 8 byte header:
//!
//! ```text
//! ┌──────────────┬─────────┬─────────┬────────────────┐
//! │ "Ohm " (4)   │ ver (1) │ type(1) │ payload len (2)│
//! └──────────────┴─────────┴─────────┴────────────────┘
//! ```
//!
//! Discovery datagrams use the same shape with an `"Ohz "` signature.
//! All integers are big-endian.

pub mod header;
pub mod message;
pub mod zone;

pub use header::{MsgType, OhmHeader};
pub use message::{AudioMsg, Message, MetatextMsg, TrackMsg};
pub use zone::{ZoneMsg, ZoneMsgType};

use bytes::{Buf, Bytes};

use crate::error::ProtocolError;

/// Checked big-endian reader over a received datagram
///
/// Slices handed out share the datagram's allocation.
pub(crate) struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated(self.buf.remaining()))
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn text(&mut self, n: usize) -> Result<String, ProtocolError> {
        let raw = self.bytes(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidText)
    }

    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
