//! Per-play socket session shared between the read loop and control calls

use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::udp::send_datagram;
use crate::protocol::header;

const RUNNING: u8 = 0;
const LEAVING: u8 = 1;
const HALTED: u8 = 2;

/// How a session is being wound down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Running,
    /// Leave sent, waiting for acknowledgement or the leave deadline
    Leaving,
    /// Read loop must exit now
    Halted,
}

/// Socket and stop state for one `play` .. `stop` cycle
pub struct Session {
    pub socket: UdpSocket,
    pub endpoint: SocketAddrV4,
    stop: AtomicU8,
    leave_deadline: Mutex<Option<Instant>>,
}

impl Session {
    pub fn new(socket: UdpSocket, endpoint: SocketAddrV4) -> Self {
        Self {
            socket,
            endpoint,
            stop: AtomicU8::new(RUNNING),
            leave_deadline: Mutex::new(None),
        }
    }

    pub fn stop_state(&self) -> StopState {
        match self.stop.load(Ordering::Acquire) {
            RUNNING => StopState::Running,
            LEAVING => StopState::Leaving,
            _ => StopState::Halted,
        }
    }

    /// Begin a graceful leave; returns false if already stopping
    pub fn begin_leave(&self, deadline: Instant) -> bool {
        let began = self
            .stop
            .compare_exchange(RUNNING, LEAVING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if began {
            *self.leave_deadline.lock() = Some(deadline);
        }
        began
    }

    /// Deadline of a leave in progress
    pub fn leave_deadline(&self) -> Option<Instant> {
        match self.stop_state() {
            StopState::Leaving => *self.leave_deadline.lock(),
            _ => None,
        }
    }

    /// Force the read loop to exit
    pub fn halt(&self) {
        self.stop.store(HALTED, Ordering::Release);
    }

    /// Whether the read loop should exit at `now`
    pub fn should_exit(&self, now: Instant) -> bool {
        match self.stop_state() {
            StopState::Running => false,
            StopState::Halted => true,
            StopState::Leaving => self.leave_deadline.lock().map_or(true, |d| now >= d),
        }
    }

    /// Send to the session endpoint
    pub fn send(&self, datagram: &[u8]) -> bool {
        send_datagram(&self.socket, datagram, self.endpoint)
    }

    /// Send resend requests for `frames` to the session endpoint
    pub fn send_resend(&self, frames: &[u32]) -> usize {
        header::resend_requests(frames)
            .iter()
            .filter(|datagram| self.send(datagram))
            .count()
    }
}

/// Holder for the session currently owned by a protocol
#[derive(Default)]
pub struct SessionSlot {
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionSlot {
    /// Install a new session
    ///
    /// Panics if one is already installed: playing twice is a caller bug.
    pub fn begin(&self, session: Session, protocol: &str) -> Arc<Session> {
        let mut current = self.current.lock();
        assert!(current.is_none(), "{} protocol is already playing", protocol);
        let session = Arc::new(session);
        *current = Some(session.clone());
        session
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().clone()
    }

    /// Remove `session` if it is still the installed one
    pub fn end(&self, session: &Arc<Session>) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
            *current = None;
        }
    }
}

/// Interface and TTL applied on the next `play`
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub interface: Ipv4Addr,
    pub ttl: u32,
}

/// Protocol counters
#[derive(Debug, Default)]
pub struct Counters {
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub invalid_datagrams: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub joins_sent: AtomicU64,
    pub listens_sent: AtomicU64,
    pub leaves_sent: AtomicU64,
    pub resend_requests: AtomicU64,
    pub datagrams_relayed: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProtocolStats {
        ProtocolStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            invalid_datagrams: self.invalid_datagrams.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            joins_sent: self.joins_sent.load(Ordering::Relaxed),
            listens_sent: self.listens_sent.load(Ordering::Relaxed),
            leaves_sent: self.leaves_sent.load(Ordering::Relaxed),
            resend_requests: self.resend_requests.load(Ordering::Relaxed),
            datagrams_relayed: self.datagrams_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Protocol statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub invalid_datagrams: u64,
    pub messages_forwarded: u64,
    pub joins_sent: u64,
    pub listens_sent: u64,
    pub leaves_sent: u64,
    pub resend_requests: u64,
    pub datagrams_relayed: u64,
}
