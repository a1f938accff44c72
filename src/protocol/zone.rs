//! Ohz zone discovery messages

use bytes::{BufMut, Bytes, BytesMut};

use super::WireReader;
use crate::constants::{MAX_URI_BYTES, MAX_ZONE_BYTES, MAX_ZONE_FRAME_BYTES};
use crate::error::ProtocolError;

pub const OHZ_SIGNATURE: &[u8; 4] = b"Ohz ";
pub const OHZ_VERSION: u8 = 1;

/// Ohz message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMsgType {
    ZoneQuery,
    ZoneUri,
    PresetQuery,
    PresetInfo,
}

impl ZoneMsgType {
    pub fn as_u8(self) -> u8 {
        match self {
            ZoneMsgType::ZoneQuery => 0,
            ZoneMsgType::ZoneUri => 1,
            ZoneMsgType::PresetQuery => 2,
            ZoneMsgType::PresetInfo => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => ZoneMsgType::ZoneQuery,
            1 => ZoneMsgType::ZoneUri,
            2 => ZoneMsgType::PresetQuery,
            3 => ZoneMsgType::PresetInfo,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Discovery message relevant to zone resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneMsg {
    /// Who is currently streaming this zone?
    Query { zone: String },
    /// The zone is currently streamed at this uri
    Uri { zone: String, uri: String },
}

impl ZoneMsg {
    /// Parse a discovery datagram
    ///
    /// Preset traffic shares the channel and yields `Ok(None)`.
    pub fn parse(datagram: Bytes) -> Result<Option<Self>, ProtocolError> {
        if datagram.len() < 8 {
            return Err(ProtocolError::Truncated(datagram.len()));
        }
        if datagram.len() > MAX_ZONE_FRAME_BYTES {
            return Err(ProtocolError::TooLarge(datagram.len()));
        }
        if &datagram[..4] != OHZ_SIGNATURE {
            return Err(ProtocolError::BadSignature);
        }

        let mut r = WireReader::new(datagram.slice(4..));
        let version = r.u8()?;
        if version != OHZ_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = ZoneMsgType::from_u8(r.u8()?)?;
        let declared = r.u16()? as usize;
        if declared > r.remaining() {
            return Err(ProtocolError::LengthMismatch { declared, available: r.remaining() });
        }
        let mut r = WireReader::new(r.bytes(declared)?);

        match msg_type {
            ZoneMsgType::ZoneQuery => {
                let zone_len = r.u32()? as usize;
                if zone_len > MAX_ZONE_BYTES {
                    return Err(ProtocolError::TooLarge(zone_len));
                }
                Ok(Some(ZoneMsg::Query { zone: r.text(zone_len)? }))
            }
            ZoneMsgType::ZoneUri => {
                let zone_len = r.u32()? as usize;
                let uri_len = r.u32()? as usize;
                if zone_len > MAX_ZONE_BYTES {
                    return Err(ProtocolError::TooLarge(zone_len));
                }
                if uri_len > MAX_URI_BYTES {
                    return Err(ProtocolError::TooLarge(uri_len));
                }
                let zone = r.text(zone_len)?;
                let uri = r.text(uri_len)?;
                Ok(Some(ZoneMsg::Uri { zone, uri }))
            }
            ZoneMsgType::PresetQuery | ZoneMsgType::PresetInfo => Ok(None),
        }
    }

    /// Encode as a discovery datagram
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let (msg_type, payload) = match self {
            ZoneMsg::Query { zone } => {
                if zone.len() > MAX_ZONE_BYTES {
                    return Err(ProtocolError::TooLarge(zone.len()));
                }
                let mut p = BytesMut::with_capacity(4 + zone.len());
                p.put_u32(zone.len() as u32);
                p.put_slice(zone.as_bytes());
                (ZoneMsgType::ZoneQuery, p)
            }
            ZoneMsg::Uri { zone, uri } => {
                if zone.len() > MAX_ZONE_BYTES {
                    return Err(ProtocolError::TooLarge(zone.len()));
                }
                if uri.len() > MAX_URI_BYTES {
                    return Err(ProtocolError::TooLarge(uri.len()));
                }
                let mut p = BytesMut::with_capacity(8 + zone.len() + uri.len());
                p.put_u32(zone.len() as u32);
                p.put_u32(uri.len() as u32);
                p.put_slice(zone.as_bytes());
                p.put_slice(uri.as_bytes());
                (ZoneMsgType::ZoneUri, p)
            }
        };

        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_slice(OHZ_SIGNATURE);
        buf.put_u8(OHZ_VERSION);
        buf.put_u8(msg_type.as_u8());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }
}
