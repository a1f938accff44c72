//! Network subsystem: multicast and unicast stream reception

pub mod multicast;
pub mod session;
pub mod timer;
pub mod udp;
pub mod unicast;

pub use multicast::MulticastProtocol;
pub use session::ProtocolStats;
pub use timer::Timer;
pub use udp::{create_multicast_socket, create_unicast_socket, SocketOptions};
pub use unicast::{SlaveSet, UnicastProtocol};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use crate::error::NetworkError;
use crate::protocol::Message;

/// Consumer of the messages a protocol receives
///
/// Called only from the thread running [`Protocol::run`].
pub trait MessageSink {
    /// Deliver one stream message
    fn add(&mut self, msg: Message);

    /// Called on every read loop iteration so time-based work can run
    /// even when no datagram arrives
    fn tick(&mut self, _now: Instant) {}
}

/// Ability to ask the sender to retransmit frames
pub trait Resend {
    /// Best-effort request; no acknowledgement is expected
    fn request_resend(&self, frames: &[u32]);
}

/// A stream reception protocol
///
/// `play` opens the session synchronously so a `stop` issued right after
/// it returns always reaches the session, even before `run` has started.
pub trait Protocol: Resend + Send + Sync {
    /// Open the receive path; Join follows immediately (unicast) or once the
    /// group membership has settled (multicast)
    fn play(&self, endpoint: SocketAddrV4) -> Result<(), NetworkError>;

    /// Read loop for the open session; returns once the session is stopped
    fn run(&self, sink: &mut dyn MessageSink);

    /// Stop the open session (idempotent)
    fn stop(&self);

    /// Applied on the next `play`
    fn set_interface(&self, interface: Ipv4Addr);

    /// Applied on the next `play`
    fn set_ttl(&self, ttl: u32);

    /// Counter snapshot
    fn stats(&self) -> ProtocolStats;
}
