//! Multicast stream reception (`ohm://`)
//!
//! The first Join goes out once the group membership has had time to take
//! effect, and is re-sent until stream traffic arrives from the group.
//! Join/Listen from other receivers, and our own looped-back ones, say
//! nothing about a sender serving us, so they never stop the Join retry;
//! they only push our next Listen out by a jittered interval. There is no
//! leave handshake.

use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tracing::{debug, info, trace};

use super::session::{Counters, ProtocolStats, Session, SessionSlot, Settings, StopState};
use super::timer::{jittered, Timer};
use super::udp::{create_multicast_socket, recv_datagram, SocketOptions};
use super::{MessageSink, Protocol, Resend};
use crate::config::ProtocolConfig;
use crate::constants::MAX_FRAME_BYTES;
use crate::error::NetworkError;
use crate::protocol::header::{self, MsgType, OhmHeader};
use crate::protocol::Message;

/// Multicast group receiver
pub struct MulticastProtocol {
    settings: Mutex<Settings>,
    config: ProtocolConfig,
    slot: SessionSlot,
    counters: Counters,
}

impl MulticastProtocol {
    /// Create a protocol bound to an interface
    pub fn new(interface: Ipv4Addr, ttl: u32, config: ProtocolConfig) -> Self {
        Self {
            settings: Mutex::new(Settings { interface, ttl }),
            config,
            slot: SessionSlot::default(),
            counters: Counters::default(),
        }
    }

    /// Interface used by the next `play`
    pub fn interface(&self) -> Ipv4Addr {
        self.settings.lock().interface
    }

    /// TTL used by the next `play`
    pub fn ttl(&self) -> u32 {
        self.settings.lock().ttl
    }

    /// Check if a session is open
    pub fn is_playing(&self) -> bool {
        self.slot.current().is_some()
    }

    fn send_control(&self, session: &Session, msg_type: MsgType) {
        if session.send(&header::control(msg_type)) {
            match msg_type {
                MsgType::Join => Counters::bump(&self.counters.joins_sent),
                MsgType::Listen => Counters::bump(&self.counters.listens_sent),
                _ => {}
            }
            trace!("Sent {:?} to {}", msg_type, session.endpoint);
        }
    }

    fn handle_datagram(
        &self,
        session: &Session,
        datagram: bytes::Bytes,
        join: &mut Timer,
        listen: &mut Timer,
        sink: &mut dyn MessageSink,
    ) {
        Counters::bump(&self.counters.datagrams_received);
        self.counters
            .bytes_received
            .fetch_add(datagram.len() as u64, std::sync::atomic::Ordering::Relaxed);

        let (header, payload) = match OhmHeader::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                Counters::bump(&self.counters.invalid_datagrams);
                trace!("Dropping datagram: {}", e);
                return;
            }
        };

        if header.msg_type.is_presence() {
            listen.fire_in(Instant::now(), jittered(self.config.listen_timeout()));
            return;
        }

        if session.stop_state() != StopState::Running {
            return;
        }

        match Message::decode(&header, payload) {
            Ok(Some(msg)) => {
                if join.is_armed() {
                    debug!("Multicast membership established for {}", session.endpoint);
                    join.cancel();
                }
                Counters::bump(&self.counters.messages_forwarded);
                sink.add(msg);
            }
            Ok(None) => trace!("Ignoring {:?} on multicast group", header.msg_type),
            Err(e) => {
                Counters::bump(&self.counters.invalid_datagrams);
                debug!("Malformed {:?} message: {}", header.msg_type, e);
            }
        }
    }
}

impl Resend for MulticastProtocol {
    fn request_resend(&self, frames: &[u32]) {
        if frames.is_empty() {
            return;
        }
        if let Some(session) = self.slot.current() {
            let sent = session.send_resend(frames);
            self.counters
                .resend_requests
                .fetch_add(sent as u64, std::sync::atomic::Ordering::Relaxed);
            debug!("Requested resend of {} frame(s) from {}", frames.len(), session.endpoint);
        }
    }
}

impl Protocol for MulticastProtocol {
    fn play(&self, endpoint: SocketAddrV4) -> Result<(), NetworkError> {
        let settings = *self.settings.lock();
        let options = SocketOptions {
            interface: settings.interface,
            ttl: settings.ttl,
            read_timeout: self.config.read_timeout(),
            recv_buffer_bytes: self.config.recv_buffer_bytes,
        };

        let socket = create_multicast_socket(endpoint, &options)?;
        self.slot.begin(Session::new(socket, endpoint), "multicast");
        info!("Joined multicast group {} on {}", endpoint, settings.interface);
        Ok(())
    }

    fn run(&self, sink: &mut dyn MessageSink) {
        let Some(session) = self.slot.current() else {
            return;
        };

        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let mut join = Timer::new();
        let mut listen = Timer::new();
        let start = Instant::now();
        join.fire_in(start, self.config.membership_delay());
        listen.fire_in(start, self.config.listen_timeout());

        loop {
            let now = Instant::now();
            if session.should_exit(now) {
                break;
            }

            if join.expired(now) {
                self.send_control(&session, MsgType::Join);
                join.fire_in(now, self.config.join_timeout());
            }
            if listen.expired(now) {
                self.send_control(&session, MsgType::Listen);
                listen.fire_in(now, self.config.listen_timeout());
            }

            if let Some((datagram, _from)) = recv_datagram(&session.socket, &mut buf) {
                self.handle_datagram(&session, datagram, &mut join, &mut listen, sink);
            }

            sink.tick(Instant::now());
        }

        self.slot.end(&session);
        info!("Left multicast group {}", session.endpoint);
    }

    fn stop(&self) {
        if let Some(session) = self.slot.current() {
            debug!("Stopping multicast session {}", session.endpoint);
            session.halt();
        }
    }

    fn set_interface(&self, interface: Ipv4Addr) {
        self.settings.lock().interface = interface;
    }

    fn set_ttl(&self, ttl: u32) {
        self.settings.lock().ttl = ttl;
    }

    fn stats(&self) -> ProtocolStats {
        self.counters.snapshot()
    }
}
