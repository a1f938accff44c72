//! Unicast stream reception (`ohu://`) with slave relaying
//!
//! Join and Listen work as for multicast, but are addressed to the sender.
//! Leaving is negotiated: `stop` sends Leave and the read loop lingers
//! until the sender acknowledges or the leave timeout passes.
//!
//! A unicast receiver can act as a relay. Peers register as slaves with a
//! Slave message; every stream datagram received afterwards is forwarded
//! verbatim to each slave, emulating multicast over point-to-point links.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::session::{Counters, ProtocolStats, Session, SessionSlot, Settings, StopState};
use super::timer::Timer;
use super::udp::{create_unicast_socket, recv_datagram, send_datagram, SocketOptions};
use super::{MessageSink, Protocol, Resend};
use crate::config::ProtocolConfig;
use crate::constants::MAX_FRAME_BYTES;
use crate::error::NetworkError;
use crate::protocol::header::{self, MsgType, OhmHeader};
use crate::protocol::Message;

/// Shortest socket poll while a leave is pending
const MIN_LEAVE_POLL: Duration = Duration::from_millis(1);

/// Outcome of a slave registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveInsert {
    Added,
    Duplicate,
    Rejected,
}

/// Bounded, insertion-ordered set of relay endpoints
#[derive(Debug, Clone)]
pub struct SlaveSet {
    slaves: Vec<SocketAddrV4>,
    capacity: usize,
}

impl SlaveSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            slaves: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Register a slave; duplicates are ignored and a full set rejects
    pub fn insert(&mut self, slave: SocketAddrV4) -> SlaveInsert {
        if self.slaves.contains(&slave) {
            SlaveInsert::Duplicate
        } else if self.slaves.len() >= self.capacity {
            SlaveInsert::Rejected
        } else {
            self.slaves.push(slave);
            SlaveInsert::Added
        }
    }

    pub fn clear(&mut self) {
        self.slaves.clear();
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[SocketAddrV4] {
        &self.slaves
    }
}

/// Point-to-point receiver
pub struct UnicastProtocol {
    settings: Mutex<Settings>,
    config: ProtocolConfig,
    slot: SessionSlot,
    slaves: Mutex<SlaveSet>,
    counters: Counters,
}

impl UnicastProtocol {
    /// Create a protocol bound to an interface
    pub fn new(interface: Ipv4Addr, ttl: u32, config: ProtocolConfig) -> Self {
        let slaves = SlaveSet::new(config.max_slaves);
        Self {
            settings: Mutex::new(Settings { interface, ttl }),
            config,
            slot: SessionSlot::default(),
            slaves: Mutex::new(slaves),
            counters: Counters::default(),
        }
    }

    pub fn interface(&self) -> Ipv4Addr {
        self.settings.lock().interface
    }

    pub fn ttl(&self) -> u32 {
        self.settings.lock().ttl
    }

    /// Check if a session is open
    pub fn is_playing(&self) -> bool {
        self.slot.current().is_some()
    }

    /// Local address of the open session's socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slot
            .current()
            .and_then(|session| session.socket.local_addr().ok())
    }

    /// Number of registered slaves
    pub fn slave_count(&self) -> usize {
        self.slaves.lock().len()
    }

    /// Registered slaves in insertion order
    pub fn slaves(&self) -> Vec<SocketAddrV4> {
        self.slaves.lock().as_slice().to_vec()
    }

    /// Tear down immediately, without the Leave handshake
    pub fn emergency_stop(&self) {
        if let Some(session) = self.slot.current() {
            debug!("Emergency stop of unicast session {}", session.endpoint);
            session.halt();
        }
    }

    fn send_control(&self, session: &Session, msg_type: MsgType) {
        if session.send(&header::control(msg_type)) {
            let counter = match msg_type {
                MsgType::Join => &self.counters.joins_sent,
                MsgType::Listen => &self.counters.listens_sent,
                MsgType::Leave => &self.counters.leaves_sent,
                _ => return,
            };
            Counters::bump(counter);
            trace!("Sent {:?} to {}", msg_type, session.endpoint);
        }
    }

    /// Register slaves named by a Slave message
    ///
    /// An empty list registers the message's source.
    fn handle_slave(&self, payload: Bytes, from: SocketAddr) {
        let listed = match header::parse_slave_list(payload) {
            Ok(listed) => listed,
            Err(e) => {
                Counters::bump(&self.counters.invalid_datagrams);
                debug!("Malformed slave message from {}: {}", from, e);
                return;
            }
        };

        let candidates = if listed.is_empty() {
            match from {
                SocketAddr::V4(addr) => vec![addr],
                SocketAddr::V6(_) => return,
            }
        } else {
            listed
        };

        let mut slaves = self.slaves.lock();
        for slave in candidates {
            match slaves.insert(slave) {
                SlaveInsert::Added => info!("Registered slave {} ({}/{})", slave, slaves.len(), slaves.capacity()),
                SlaveInsert::Duplicate => trace!("Slave {} already registered", slave),
                SlaveInsert::Rejected => warn!("Rejecting slave {}: relay set is full", slave),
            }
        }
    }

    /// Relay a stream datagram verbatim to every slave
    fn broadcast(&self, session: &Session, datagram: &Bytes) {
        let slaves = self.slaves.lock();
        for slave in slaves.as_slice() {
            if send_datagram(&session.socket, datagram, *slave) {
                Counters::bump(&self.counters.datagrams_relayed);
            }
        }
    }

    fn handle_stream(
        &self,
        session: &Session,
        header: &OhmHeader,
        payload: Bytes,
        datagram: &Bytes,
        sink: &mut dyn MessageSink,
    ) {
        if session.stop_state() != StopState::Running {
            return;
        }

        self.broadcast(session, datagram);

        match Message::decode(header, payload) {
            Ok(Some(msg)) => {
                Counters::bump(&self.counters.messages_forwarded);
                sink.add(msg);
            }
            Ok(None) => {}
            Err(e) => {
                Counters::bump(&self.counters.invalid_datagrams);
                debug!("Malformed {:?} message: {}", header.msg_type, e);
            }
        }
    }

    fn handle_datagram(
        &self,
        session: &Session,
        datagram: Bytes,
        from: SocketAddr,
        join: &mut Timer,
        sink: &mut dyn MessageSink,
    ) {
        Counters::bump(&self.counters.datagrams_received);
        self.counters
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        let (header, payload) = match OhmHeader::parse(datagram.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                Counters::bump(&self.counters.invalid_datagrams);
                trace!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };

        match header.msg_type {
            MsgType::Audio | MsgType::Track | MsgType::Metatext => {
                if join.is_armed() {
                    debug!("Unicast stream established from {}", session.endpoint);
                    join.cancel();
                }
                self.handle_stream(session, &header, payload, &datagram, sink);
            }
            MsgType::Slave => self.handle_slave(payload, from),
            MsgType::Leave => {
                if session.stop_state() == StopState::Leaving && from.ip() == *session.endpoint.ip() {
                    debug!("Leave acknowledged by {}", from);
                    session.halt();
                }
            }
            MsgType::Join | MsgType::Listen | MsgType::Resend => {
                trace!("Ignoring {:?} from {}", header.msg_type, from);
            }
        }
    }
}

impl Resend for UnicastProtocol {
    fn request_resend(&self, frames: &[u32]) {
        if frames.is_empty() {
            return;
        }
        if let Some(session) = self.slot.current() {
            let sent = session.send_resend(frames);
            self.counters
                .resend_requests
                .fetch_add(sent as u64, Ordering::Relaxed);
            debug!("Requested resend of {} frame(s) from {}", frames.len(), session.endpoint);
        }
    }
}

impl Protocol for UnicastProtocol {
    fn play(&self, endpoint: SocketAddrV4) -> Result<(), NetworkError> {
        let settings = *self.settings.lock();
        let options = SocketOptions {
            interface: settings.interface,
            ttl: settings.ttl,
            read_timeout: self.config.read_timeout(),
            recv_buffer_bytes: self.config.recv_buffer_bytes,
        };

        let socket = create_unicast_socket(&options)?;
        self.slaves.lock().clear();
        let session = self.slot.begin(Session::new(socket, endpoint), "unicast");
        info!("Joining unicast sender {}", endpoint);

        self.send_control(&session, MsgType::Join);
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
        join.fire_in(start, self.config.join_timeout());
        listen.fire_in(start, self.config.listen_timeout());

        loop {
            let now = Instant::now();
            if session.should_exit(now) {
                break;
            }

            if session.stop_state() == StopState::Running {
                if join.expired(now) {
                    self.send_control(&session, MsgType::Join);
                    join.fire_in(now, self.config.join_timeout());
                }
                if listen.expired(now) {
                    self.send_control(&session, MsgType::Listen);
                    listen.fire_in(now, self.config.listen_timeout());
                }
            } else if let Some(deadline) = session.leave_deadline() {
                // never sleep past the leave deadline
                let poll = deadline
                    .saturating_duration_since(now)
                    .min(self.config.read_timeout())
                    .max(MIN_LEAVE_POLL);
                if let Err(e) = session.socket.set_read_timeout(Some(poll)) {
                    trace!("Could not shorten read timeout: {}", e);
                }
            }

            if let Some((datagram, from)) = recv_datagram(&session.socket, &mut buf) {
                self.handle_datagram(&session, datagram, from, &mut join, sink);
            }

            sink.tick(Instant::now());
        }

        self.slaves.lock().clear();
        self.slot.end(&session);
        info!("Left unicast sender {}", session.endpoint);
    }

    fn stop(&self) {
        if let Some(session) = self.slot.current() {
            if session.begin_leave(Instant::now() + self.config.leave_timeout()) {
                debug!("Leaving unicast sender {}", session.endpoint);
                self.send_control(&session, MsgType::Leave);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    struct Discard;

    impl MessageSink for Discard {
        fn add(&mut self, _msg: Message) {}
    }

    fn start(config: ProtocolConfig) -> (Arc<UnicastProtocol>, UdpSocket, JoinHandle<()>) {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let endpoint = match sender.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected {}", other),
        };

        let protocol = Arc::new(UnicastProtocol::new(Ipv4Addr::LOCALHOST, 1, config));
        protocol.play(endpoint).unwrap();
        let runner = {
            let protocol = protocol.clone();
            thread::spawn(move || protocol.run(&mut Discard))
        };
        (protocol, sender, runner)
    }

    fn received(sender: &UdpSocket, within: Duration) -> Vec<MsgType> {
        let deadline = Instant::now() + within;
        let mut buf = [0u8; 2048];
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok((len, _)) = sender.recv_from(&mut buf) {
                if let Ok((parsed, _)) = OhmHeader::parse(Bytes::copy_from_slice(&buf[..len])) {
                    seen.push(parsed.msg_type);
                }
            }
        }
        seen
    }

    #[test]
    fn test_emergency_stop_skips_leave() {
        let config = ProtocolConfig {
            leave_timeout_ms: 2000,
            ..ProtocolConfig::default()
        };
        let (protocol, sender, runner) = start(config);
        assert_eq!(received(&sender, Duration::from_millis(100)), vec![MsgType::Join]);

        let started = Instant::now();
        protocol.emergency_stop();
        runner.join().unwrap();
        assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
        assert!(!protocol.is_playing());

        assert!(!received(&sender, Duration::from_millis(100)).contains(&MsgType::Leave));
        assert_eq!(protocol.stats().leaves_sent, 0);
    }

    #[test]
    fn test_unacknowledged_leave_ends_at_deadline() {
        let (protocol, sender, runner) = start(ProtocolConfig::default());
        assert_eq!(received(&sender, Duration::from_millis(100)), vec![MsgType::Join]);

        let started = Instant::now();
        protocol.stop();
        runner.join().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(60), "{:?}", elapsed);

        assert_eq!(received(&sender, Duration::from_millis(50)), vec![MsgType::Leave]);
        assert_eq!(protocol.stats().leaves_sent, 1);
    }

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_slave_set_is_bounded() {
        let mut set = SlaveSet::new(4);
        for i in 0..4 {
            assert_eq!(set.insert(addr(i, 5000)), SlaveInsert::Added);
        }
        assert_eq!(set.insert(addr(1, 5000)), SlaveInsert::Duplicate);
        assert_eq!(set.insert(addr(9, 5000)), SlaveInsert::Rejected);
        assert_eq!(set.len(), 4);
        assert_eq!(set.as_slice()[0], addr(0, 5000));
        assert_eq!(set.as_slice()[3], addr(3, 5000));

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_idle_controls_are_noops() {
        let protocol = UnicastProtocol::new(Ipv4Addr::LOCALHOST, 1, ProtocolConfig::default());
        protocol.stop();
        protocol.emergency_stop();
        protocol.request_resend(&[4]);
        assert_eq!(protocol.stats(), ProtocolStats::default());
        assert_eq!(protocol.slave_count(), 0);
        assert!(protocol.local_addr().is_none());
    }
}
