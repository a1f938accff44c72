//! Stream messages carried by Audio, Track and Metatext datagrams
//!
//! Payload fields are `Bytes` slices of the received datagram, so a message
//! holds a reference to the original buffer instead of copying samples.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::{self, MsgType, OhmHeader};
use super::WireReader;
use crate::error::ProtocolError;

/// Fixed part of the audio header (excluding the codec name)
pub const AUDIO_HEADER_BYTES: usize = 50;

const FLAG_HALT: u8 = 0x01;
const FLAG_LOSSLESS: u8 = 0x02;
const FLAG_TIMESTAMPED: u8 = 0x04;
const FLAG_RESENT: u8 = 0x08;

/// A decoded stream message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Audio(AudioMsg),
    Track(TrackMsg),
    Metatext(MetatextMsg),
}

impl Message {
    /// Build a message from a parsed header and its payload
    ///
    /// Returns `Ok(None)` for control types, which carry no stream payload.
    pub fn decode(header: &OhmHeader, payload: Bytes) -> Result<Option<Self>, ProtocolError> {
        Ok(match header.msg_type {
            MsgType::Audio => Some(Message::Audio(AudioMsg::decode(payload)?)),
            MsgType::Track => Some(Message::Track(TrackMsg::decode(payload)?)),
            MsgType::Metatext => Some(Message::Metatext(MetatextMsg::decode(payload)?)),
            _ => None,
        })
    }

    /// Wire type of this message
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Audio(_) => MsgType::Audio,
            Message::Track(_) => MsgType::Track,
            Message::Metatext(_) => MsgType::Metatext,
        }
    }

    /// Encode as a complete datagram
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let payload = match self {
            Message::Audio(msg) => msg.encode_payload(),
            Message::Track(msg) => msg.encode_payload(),
            Message::Metatext(msg) => msg.encode_payload(),
        };
        header::frame(self.msg_type(), &payload)
    }
}

/// One sequenced frame of audio
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioMsg {
    pub halt: bool,
    pub lossless: bool,
    pub timestamped: bool,
    /// Set by the sender on retransmitted frames
    pub resent: bool,
    /// Samples per channel in this frame
    pub samples: u16,
    pub frame: u32,
    pub network_timestamp: u32,
    /// Requested latency in milliseconds, 0 if unspecified
    pub latency: u32,
    pub media_timestamp: u32,
    pub sample_start: u64,
    pub samples_total: u64,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub volume_offset: i16,
    pub bit_depth: u8,
    pub channels: u8,
    pub codec: String,
    pub audio: Bytes,
}

impl AudioMsg {
    /// Create a frame with the given number and latency and no samples
    pub fn new(frame: u32, latency: u32) -> Self {
        Self {
            frame,
            latency,
            sample_rate: 44100,
            bit_depth: 16,
            channels: 2,
            codec: "PCM".to_string(),
            ..Default::default()
        }
    }

    fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);

        let header_bytes = r.u8()? as usize;
        let flags = r.u8()?;
        let samples = r.u16()?;
        let frame = r.u32()?;
        let network_timestamp = r.u32()?;
        let latency = r.u32()?;
        let media_timestamp = r.u32()?;
        let sample_start = r.u64()?;
        let samples_total = r.u64()?;
        let sample_rate = r.u32()?;
        let bit_rate = r.u32()?;
        let volume_offset = r.i16()?;
        let bit_depth = r.u8()?;
        let channels = r.u8()?;
        let _reserved = r.u8()?;
        let codec_len = r.u8()? as usize;

        if header_bytes != AUDIO_HEADER_BYTES + codec_len {
            return Err(ProtocolError::LengthMismatch {
                declared: header_bytes,
                available: AUDIO_HEADER_BYTES + codec_len,
            });
        }

        let codec = r.text(codec_len)?;
        let audio = r.rest();

        Ok(Self {
            halt: flags & FLAG_HALT != 0,
            lossless: flags & FLAG_LOSSLESS != 0,
            timestamped: flags & FLAG_TIMESTAMPED != 0,
            resent: flags & FLAG_RESENT != 0,
            samples,
            frame,
            network_timestamp,
            latency,
            media_timestamp,
            sample_start,
            samples_total,
            sample_rate,
            bit_rate,
            volume_offset,
            bit_depth,
            channels,
            codec,
            audio,
        })
    }

    fn encode_payload(&self) -> Bytes {
        let codec = self.codec.as_bytes();
        let codec_len = codec.len().min(u8::MAX as usize - AUDIO_HEADER_BYTES);
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_BYTES + codec_len + self.audio.len());

        let mut flags = 0;
        if self.halt {
            flags |= FLAG_HALT;
        }
        if self.lossless {
            flags |= FLAG_LOSSLESS;
        }
        if self.timestamped {
            flags |= FLAG_TIMESTAMPED;
        }
        if self.resent {
            flags |= FLAG_RESENT;
        }

        buf.put_u8((AUDIO_HEADER_BYTES + codec_len) as u8);
        buf.put_u8(flags);
        buf.put_u16(self.samples);
        buf.put_u32(self.frame);
        buf.put_u32(self.network_timestamp);
        buf.put_u32(self.latency);
        buf.put_u32(self.media_timestamp);
        buf.put_u64(self.sample_start);
        buf.put_u64(self.samples_total);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.bit_rate);
        buf.put_i16(self.volume_offset);
        buf.put_u8(self.bit_depth);
        buf.put_u8(self.channels);
        buf.put_u8(0);
        buf.put_u8(codec_len as u8);
        buf.put_slice(&codec[..codec_len]);
        buf.put_slice(&self.audio);
        buf.freeze()
    }
}

/// Track change announcement
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackMsg {
    pub sequence: u32,
    pub uri: String,
    pub metadata: String,
}

impl TrackMsg {
    fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let sequence = r.u32()?;
        let uri_len = r.u32()? as usize;
        let metadata_len = r.u32()? as usize;
        let uri = r.text(uri_len)?;
        let metadata = r.text(metadata_len)?;
        Ok(Self { sequence, uri, metadata })
    }

    fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.uri.len() + self.metadata.len());
        buf.put_u32(self.sequence);
        buf.put_u32(self.uri.len() as u32);
        buf.put_u32(self.metadata.len() as u32);
        buf.put_slice(self.uri.as_bytes());
        buf.put_slice(self.metadata.as_bytes());
        buf.freeze()
    }
}

/// Now-playing text update
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetatextMsg {
    pub sequence: u32,
    pub metatext: String,
}

impl MetatextMsg {
    fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let sequence = r.u32()?;
        let len = r.u32()? as usize;
        let metatext = r.text(len)?;
        Ok(Self { sequence, metatext })
    }

    fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.metatext.len());
        buf.put_u32(self.sequence);
        buf.put_u32(self.metatext.len() as u32);
        buf.put_slice(self.metatext.as_bytes());
        buf.freeze()
    }
}
