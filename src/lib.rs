//! # Ohm Receiver
//!
//! Receiving end of the Ohm LAN audio streaming protocol: joins a multicast
//! (`ohm://`) or unicast (`ohu://`) feed, repairs frame gaps with resend
//! requests, tracks playback readiness and resolves zone names (`ohz://`) to
//! live senders.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             RECEIVER                                  │
//! │                                                                       │
//! │   play(uri) / stop() / set_interface() / set_ttl()   (caller thread)  │
//! │        │                                                              │
//! │        ▼            mode lock                                         │
//! │  ┌───────────┐  session channel  ┌────────────────────────────────┐   │
//! │  │ Receiver  │──────────────────▶│ Processing thread              │   │
//! │  │           │                   │  ┌──────────────┐              │   │
//! │  │           │                   │  │ Multicast or │ datagrams    │   │
//! │  │           │                   │  │ Unicast      │◀──────────── UDP │
//! │  │           │                   │  │ protocol     │──▶ slaves    │   │
//! │  │           │                   │  └──────┬───────┘              │   │
//! │  │           │                   │         │ MessageSink          │   │
//! │  │           │                   │         ▼                      │   │
//! │  │           │                   │  ┌──────────────┐  resend      │   │
//! │  │           │                   │  │ Session      │─────────────▶│   │
//! │  │           │                   │  │ processor    │  (repair)    │   │
//! │  │           │                   │  └──────┬───────┘              │   │
//! │  │           │                   └─────────┼──────────────────────┘   │
//! │  │           │  zone channel     ┌─────────┼──────────────────────┐   │
//! │  │           │──────────────────▶│ Zone thread (Ohz query/uri)    │   │
//! │  └───────────┘◀── zone resolved ─└─────────┼──────────────────────┘   │
//! │                                            ▼                          │
//! │                                   ReceiverDriver::add()               │
//! │                                   ReceiverDriver::set_transport_state │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod receiver;

pub use config::ReceiverConfig;
pub use error::{Error, Result};
pub use protocol::message::{AudioMsg, Message, MetatextMsg, TrackMsg};
pub use receiver::{PlayMode, Receiver, ReceiverDriver, TransportState};

/// Protocol-wide constants
pub mod constants {
    use std::net::Ipv4Addr;

    /// Largest stream datagram accepted or relayed
    pub const MAX_FRAME_BYTES: usize = 16 * 1024;

    /// Largest zone discovery datagram
    pub const MAX_ZONE_FRAME_BYTES: usize = 1024;

    /// Longest zone name accepted in a query
    pub const MAX_ZONE_BYTES: usize = 100;

    /// Longest uri accepted in a zone announcement
    pub const MAX_URI_BYTES: usize = 100;

    /// Pause after joining a multicast group before the first Join
    pub const DEFAULT_MEMBERSHIP_DELAY_MS: u64 = 100;

    /// Join retry interval
    pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 300;

    /// Listen keepalive interval
    pub const DEFAULT_LISTEN_TIMEOUT_MS: u64 = 10_000;

    /// Unicast Leave handshake bound
    pub const DEFAULT_LEAVE_TIMEOUT_MS: u64 = 50;

    /// Read loop poll granularity
    pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10;

    /// Unicast relay slots
    pub const DEFAULT_MAX_SLAVES: usize = 4;

    /// Hard ceiling for configured relay slots
    pub const MAX_SLAVE_CAPACITY: usize = 16;

    /// Latency when the stream declares none
    pub const DEFAULT_LATENCY_MS: u32 = 50;

    /// Repair window ceiling
    pub const DEFAULT_REPAIR_TIMEOUT_MS: u64 = 200;

    /// First re-request delay
    pub const DEFAULT_RESEND_BACKOFF_MS: u64 = 20;

    /// Extra resend requests per gap; a gap is requested exactly once unless raised
    pub const DEFAULT_RESEND_RETRIES: u32 = 0;

    /// Backward jump that counts as a sender restart
    pub const DEFAULT_DISCONTINUITY_FRAMES: u32 = 1024;

    /// Widest gap worth repairing
    pub const DEFAULT_MAX_REPAIR_FRAMES: u32 = 512;

    /// Frames named per resend datagram
    pub const MAX_RESEND_FRAMES: usize = 512;

    /// Port assumed when an `ohm://` or `ohu://` uri names none
    pub const DEFAULT_STREAM_PORT: u16 = 51972;

    /// Zone discovery group
    pub const DEFAULT_ZONE_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

    /// Zone discovery port
    pub const DEFAULT_ZONE_PORT: u16 = 51972;

    /// Zone query interval
    pub const DEFAULT_ZONE_QUERY_INTERVAL_MS: u64 = 100;

    /// Zone queries before passive listening
    pub const DEFAULT_ZONE_QUERY_RETRIES: u32 = 10;
}
