//! Loopback fixtures: a scripted Ohm sender and a recording driver

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use ohm_receiver::protocol::header::{self, MsgType, OhmHeader};
use ohm_receiver::{AudioMsg, Message, ReceiverDriver, TransportState};

/// Driver that remembers everything it is told
#[derive(Default)]
pub struct RecordingDriver {
    pub frames: Mutex<Vec<u32>>,
    pub messages: Mutex<Vec<Message>>,
    pub states: Mutex<Vec<TransportState>>,
}

impl RecordingDriver {
    pub fn frames(&self) -> Vec<u32> {
        self.frames.lock().clone()
    }

    pub fn states(&self) -> Vec<TransportState> {
        self.states.lock().clone()
    }

    /// Poll until `check` holds or two seconds pass
    pub fn wait_until(&self, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check(self)
    }
}

impl ReceiverDriver for RecordingDriver {
    fn add(&self, msg: Message) {
        if let Message::Audio(audio) = &msg {
            self.frames.lock().push(audio.frame);
        }
        self.messages.lock().push(msg);
    }

    fn set_transport_state(&self, state: TransportState) {
        self.states.lock().push(state);
    }
}

/// A unicast Ohm sender on loopback
pub struct FakeSender {
    pub socket: UdpSocket,
}

impl FakeSender {
    pub fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        Self { socket }
    }

    pub fn endpoint(&self) -> SocketAddrV4 {
        match self.socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        }
    }

    pub fn uri(&self) -> String {
        format!("ohu://{}", self.endpoint())
    }

    /// Next datagram of `msg_type` within `within`, with its payload and source
    pub fn expect(&self, msg_type: MsgType, within: Duration) -> Option<(Bytes, SocketAddr)> {
        let deadline = Instant::now() + within;
        let mut buf = [0u8; 2048];
        while Instant::now() < deadline {
            if let Ok((len, from)) = self.socket.recv_from(&mut buf) {
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                if let Ok((parsed, payload)) = OhmHeader::parse(datagram) {
                    if parsed.msg_type == msg_type {
                        return Some((payload, from));
                    }
                }
            }
        }
        None
    }

    /// Count datagrams of `msg_type` arriving within `within`
    pub fn count(&self, msg_type: MsgType, within: Duration) -> usize {
        let deadline = Instant::now() + within;
        let mut seen = 0;
        while self
            .expect(msg_type, deadline.saturating_duration_since(Instant::now()))
            .is_some()
        {
            seen += 1;
        }
        seen
    }

    /// Wait for the receiver's Join and return its address
    pub fn accept(&self) -> SocketAddr {
        self.expect(MsgType::Join, Duration::from_secs(2))
            .map(|(_, from)| from)
            .expect("receiver never joined")
    }

    pub fn send_audio(&self, to: SocketAddr, frame: u32, latency: u32) -> Bytes {
        let mut audio = AudioMsg::new(frame, latency);
        audio.samples = 4;
        audio.audio = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let datagram = Message::Audio(audio).encode().unwrap();
        self.socket.send_to(&datagram, to).unwrap();
        datagram
    }

    pub fn send(&self, to: SocketAddr, datagram: &[u8]) {
        self.socket.send_to(datagram, to).unwrap();
    }

    pub fn leave(&self, to: SocketAddr) {
        self.send(to, &header::control(MsgType::Leave));
    }
}

/// Plain loopback socket used as a relay target
pub fn slave_socket() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    (socket, addr)
}

pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;
