//! Receiver orchestration
//!
//! The [`Receiver`] owns both protocols and two worker threads. Callers
//! change what is played under the mode lock; the processing thread runs
//! one session at a time and is the only writer of the transport state.
//! The zone thread resolves `ohz://` zones and switches the session when
//! an announcement arrives.

mod processor;
pub mod repair;
pub mod state;
mod zone;

pub use repair::{RepairOutput, Repairer};
pub use state::{resolve_uri, PlayMode, PlayTarget, TransportState};

use crossbeam_channel::{unbounded, Receiver as ChannelReceiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, Result};
use crate::network::{MulticastProtocol, Protocol, ProtocolStats, UnicastProtocol};
use crate::protocol::Message;
use processor::{SessionProcessor, Transport};
use zone::{ZoneCommand, ZoneJob, ZoneListener};

/// Consumer of everything a receiver produces
///
/// Both methods are called from the processing thread.
pub trait ReceiverDriver: Send + Sync {
    /// Stream message in frame order (audio) or arrival order (track, metatext)
    fn add(&self, msg: Message);

    /// Transport state changed
    fn set_transport_state(&self, state: TransportState);
}

/// Session handed to the processing thread
struct SessionStart {
    generation: u64,
    mode: PlayMode,
}

enum SessionCommand {
    Start(SessionStart),
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    Graceful,
    Emergency,
}

struct ZoneState {
    id: u64,
    zone: String,
    resolved: Option<String>,
}

/// Everything guarded by the mode lock
struct ModeState {
    mode: PlayMode,
    session: Option<u64>,
    /// Session abandoned by a stop that ran out of time
    lingering: Option<u64>,
    zone: Option<ZoneState>,
    interface: Ipv4Addr,
    ttl: u32,
    next_id: u64,
}

impl ModeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Shared {
    config: ReceiverConfig,
    multicast: MulticastProtocol,
    unicast: UnicastProtocol,
    transport: Transport,
    mode: Mutex<ModeState>,
    /// Session allowed to deliver; zero when none
    active: AtomicU64,
    terminating: AtomicBool,
    sessions: Sender<SessionCommand>,
    stopped: ChannelReceiver<u64>,
    null_stop: Sender<()>,
    zones: Sender<ZoneCommand>,
}

impl Shared {
    /// Open the protocol for `mode` and hand the session to the processing thread
    fn start_locked(&self, state: &mut ModeState, mode: PlayMode) -> Result<()> {
        if mode == PlayMode::None {
            return Ok(());
        }
        if let Some(generation) = state.lingering {
            let bound = self.config.protocol.stop_bound();
            if !self.wait_stopped(generation, Instant::now() + bound) {
                return Err(ReceiverError::SessionStuck(generation).into());
            }
            debug!("Abandoned session {} has stopped", generation);
            state.lingering = None;
        }

        match &mode {
            PlayMode::Multicast(endpoint) => self.multicast.play(*endpoint)?,
            PlayMode::Unicast(endpoint) => self.unicast.play(*endpoint)?,
            PlayMode::Null(_) => {}
            PlayMode::None => return Ok(()),
        }

        let generation = state.next_id();
        self.active.store(generation, Ordering::Release);
        state.session = Some(generation);
        state.mode = mode.clone();

        debug!("Starting session {} ({:?})", generation, mode);
        if self
            .sessions
            .send(SessionCommand::Start(SessionStart { generation, mode }))
            .is_err()
        {
            error!("Processing thread is gone; session {} not started", generation);
        }
        Ok(())
    }

    /// Stop the current session and wait until the processing thread is idle
    fn stop_session_locked(&self, state: &mut ModeState, kind: StopKind) {
        let Some(generation) = state.session.take() else {
            return;
        };

        self.active.store(0, Ordering::Release);
        self.interrupt(&state.mode, kind);

        let bound = self.config.protocol.stop_bound();
        if !self.wait_stopped(generation, Instant::now() + bound) {
            warn!("Session {} did not stop within {:?}; forcing", generation, bound);
            self.interrupt(&state.mode, StopKind::Emergency);
            // a halted session exits once the current driver callback returns
            if !self.wait_stopped(generation, Instant::now() + bound) {
                error!("Session {} is stuck in the driver; abandoning it", generation);
                state.lingering = Some(generation);
            }
        }

        state.mode = PlayMode::None;
    }

    fn interrupt(&self, mode: &PlayMode, kind: StopKind) {
        match mode {
            PlayMode::Multicast(_) => self.multicast.stop(),
            PlayMode::Unicast(_) if kind == StopKind::Graceful => self.unicast.stop(),
            PlayMode::Unicast(_) => self.unicast.emergency_stop(),
            PlayMode::Null(_) => {
                let _ = self.null_stop.send(());
            }
            PlayMode::None => {}
        }
    }

    fn wait_stopped(&self, generation: u64, deadline: Instant) -> bool {
        loop {
            match self.stopped.recv_deadline(deadline) {
                Ok(stopped) if stopped == generation => return true,
                Ok(stopped) => debug!("Ignoring stale stop of session {}", stopped),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn stop_zone_locked(&self, state: &mut ModeState) {
        if let Some(zone) = state.zone.take() {
            debug!("Stopping discovery of zone '{}'", zone.zone);
            let _ = self.zones.send(ZoneCommand::Stop);
        }
    }

    /// Processing thread body for one session
    fn run_session(&self, start: &SessionStart, null_stops: &ChannelReceiver<()>) {
        self.transport.set_latency(0);

        match &start.mode {
            PlayMode::Multicast(_) => {
                self.transport.set_state(TransportState::Buffering);
                let mut sink = SessionProcessor::new(
                    &self.transport,
                    &self.multicast,
                    &self.config.repair,
                    &self.active,
                    start.generation,
                );
                self.multicast.run(&mut sink);
            }
            PlayMode::Unicast(_) => {
                self.transport.set_state(TransportState::Buffering);
                let mut sink = SessionProcessor::new(
                    &self.transport,
                    &self.unicast,
                    &self.config.repair,
                    &self.active,
                    start.generation,
                );
                self.unicast.run(&mut sink);
            }
            PlayMode::Null(_) => {
                self.transport.set_state(TransportState::Waiting);
                // stops sent while no null session was running are stale
                while null_stops.try_recv().is_ok() {}
                if self.active.load(Ordering::Acquire) == start.generation {
                    let _ = null_stops.recv();
                }
            }
            PlayMode::None => {}
        }

        self.transport.set_state(TransportState::Stopped);
    }
}

impl ZoneListener for Shared {
    fn zone_resolved(&self, id: u64, uri: &str) {
        let mode = match resolve_uri(uri, &self.config.zone) {
            Ok(PlayTarget::Stream(mode)) => mode,
            Ok(PlayTarget::Zone { .. }) => {
                warn!("Zone resolved to another zone uri {}; ignoring", uri);
                return;
            }
            Err(e) => {
                warn!("Zone resolved to unusable uri: {}", e);
                return;
            }
        };

        let mut state = self.mode.lock();
        if self.terminating.load(Ordering::Acquire) {
            return;
        }

        let zone = match state.zone.as_mut() {
            Some(zone) if zone.id == id => zone,
            _ => return,
        };
        if zone.resolved.as_deref() == Some(uri) {
            return;
        }
        info!("Zone '{}' is playing {}", zone.zone, uri);
        zone.resolved = Some(uri.to_string());
        let fallback = PlayMode::Null(Some(zone.zone.clone()));

        self.stop_session_locked(&mut state, StopKind::Graceful);
        if let Err(e) = self.start_locked(&mut state, mode) {
            warn!("Cannot play {}: {}; waiting for the zone", uri, e);
            if let Some(zone) = state.zone.as_mut() {
                zone.resolved = None;
            }
            if let Err(e) = self.start_locked(&mut state, fallback) {
                warn!("Cannot wait for zone: {}", e);
            }
        }
    }
}

/// Ohm stream receiver
///
/// Dropping the receiver stops any session without a Leave handshake and
/// joins both worker threads.
pub struct Receiver {
    shared: Arc<Shared>,
    processing: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Create a receiver with default configuration
    pub fn new(interface: Ipv4Addr, ttl: u32, driver: Arc<dyn ReceiverDriver>) -> Result<Self> {
        Self::with_config(interface, ttl, driver, ReceiverConfig::default())
    }

    pub fn with_config(
        interface: Ipv4Addr,
        ttl: u32,
        driver: Arc<dyn ReceiverDriver>,
        config: ReceiverConfig,
    ) -> Result<Self> {
        config.validate()?;

        let (session_tx, session_rx) = unbounded();
        let (stopped_tx, stopped_rx) = unbounded();
        let (null_tx, null_rx) = unbounded();
        let (zone_tx, zone_rx) = unbounded();

        let shared = Arc::new(Shared {
            multicast: MulticastProtocol::new(interface, ttl, config.protocol.clone()),
            unicast: UnicastProtocol::new(interface, ttl, config.protocol.clone()),
            transport: Transport::new(driver),
            mode: Mutex::new(ModeState {
                mode: PlayMode::None,
                session: None,
                lingering: None,
                zone: None,
                interface,
                ttl,
                next_id: 0,
            }),
            active: AtomicU64::new(0),
            terminating: AtomicBool::new(false),
            sessions: session_tx,
            stopped: stopped_rx,
            null_stop: null_tx,
            zones: zone_tx,
            config,
        });

        let processing = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("ohm-receiver".into())
                .spawn(move || processing_thread(&shared, session_rx, null_rx, stopped_tx))
                .map_err(|e| ReceiverError::ThreadSpawn(e.to_string()))?
        };

        let discovery = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("ohm-zone".into())
                .spawn(move || zone::run(&*shared, &shared.config, zone_rx))
        };
        let discovery = match discovery {
            Ok(handle) => handle,
            Err(e) => {
                let _ = shared.sessions.send(SessionCommand::Terminate);
                let _ = processing.join();
                return Err(ReceiverError::ThreadSpawn(e.to_string()).into());
            }
        };

        info!("Receiver ready on {} (ttl {})", interface, ttl);

        Ok(Self {
            shared,
            processing: Some(processing),
            discovery: Some(discovery),
        })
    }

    /// Play a `ohm://`, `ohu://` or `ohz://` uri, replacing any current session
    ///
    /// Returns once the new session has been handed to the processing
    /// thread. On error the receiver is left stopped.
    pub fn play(&self, uri: &str) -> Result<()> {
        let target = resolve_uri(uri, &self.shared.config.zone)?;
        let shared = &self.shared;
        let mut state = shared.mode.lock();

        shared.stop_session_locked(&mut state, StopKind::Graceful);
        info!("Play {}", uri);

        match target {
            PlayTarget::Stream(mode) => {
                shared.stop_zone_locked(&mut state);
                shared.start_locked(&mut state, mode)
            }
            PlayTarget::Zone { discovery, zone } => {
                if let Err(e) = shared.start_locked(&mut state, PlayMode::Null(Some(zone.clone()))) {
                    shared.stop_zone_locked(&mut state);
                    return Err(e);
                }
                let id = state.next_id();
                let job = ZoneJob {
                    id,
                    zone: zone.clone(),
                    endpoint: discovery,
                    interface: state.interface,
                    ttl: state.ttl,
                };
                state.zone = Some(ZoneState {
                    id,
                    zone: zone.clone(),
                    resolved: None,
                });
                let _ = shared.zones.send(ZoneCommand::Start(job));
                Ok(())
            }
        }
    }

    /// Stop playing
    ///
    /// Returns once the session has ended, or has been abandoned because a
    /// driver callback held it past two stop bounds. A later `play` waits
    /// for an abandoned session and fails with `SessionStuck` if it is still
    /// running.
    pub fn stop(&self) {
        let mut state = self.shared.mode.lock();
        self.shared.stop_session_locked(&mut state, StopKind::Graceful);
        self.shared.stop_zone_locked(&mut state);
    }

    /// Interface used by subsequent sessions
    pub fn set_interface(&self, interface: Ipv4Addr) {
        let mut state = self.shared.mode.lock();
        state.interface = interface;
        self.shared.multicast.set_interface(interface);
        self.shared.unicast.set_interface(interface);
    }

    /// TTL used by subsequent sessions
    pub fn set_ttl(&self, ttl: u32) {
        let mut state = self.shared.mode.lock();
        state.ttl = ttl;
        self.shared.multicast.set_ttl(ttl);
        self.shared.unicast.set_ttl(ttl);
    }

    pub fn interface(&self) -> Ipv4Addr {
        self.shared.mode.lock().interface
    }

    pub fn ttl(&self) -> u32 {
        self.shared.mode.lock().ttl
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.transport.state()
    }

    /// Latency of the current stream in milliseconds; zero before the first frame
    pub fn latency(&self) -> u32 {
        self.shared.transport.latency()
    }

    pub fn play_mode(&self) -> PlayMode {
        self.shared.mode.lock().mode.clone()
    }

    /// Zone being resolved and the uri it last resolved to
    pub fn zone(&self) -> Option<(String, Option<String>)> {
        self.shared
            .mode
            .lock()
            .zone
            .as_ref()
            .map(|zone| (zone.zone.clone(), zone.resolved.clone()))
    }

    pub fn multicast_stats(&self) -> ProtocolStats {
        self.shared.multicast.stats()
    }

    pub fn unicast_stats(&self) -> ProtocolStats {
        self.shared.unicast.stats()
    }

    /// Relay endpoints registered with the unicast session
    pub fn slaves(&self) -> Vec<SocketAddrV4> {
        self.shared.unicast.slaves()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.terminating.store(true, Ordering::Release);
        {
            let mut state = shared.mode.lock();
            shared.stop_session_locked(&mut state, StopKind::Emergency);
            state.zone = None;
        }

        let _ = shared.sessions.send(SessionCommand::Terminate);
        let _ = shared.zones.send(ZoneCommand::Terminate);

        if let Some(handle) = self.processing.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.discovery.take() {
            let _ = handle.join();
        }
        debug!("Receiver shut down");
    }
}

fn processing_thread(
    shared: &Shared,
    sessions: ChannelReceiver<SessionCommand>,
    null_stops: ChannelReceiver<()>,
    stopped: Sender<u64>,
) {
    while let Ok(SessionCommand::Start(start)) = sessions.recv() {
        shared.run_session(&start, &null_stops);
        let _ = stopped.send(start.generation);
    }
    debug!("Processing thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{MsgType, OhmHeader};
    use bytes::Bytes;
    use std::net::{SocketAddr, UdpSocket};
    use std::time::Duration;

    #[derive(Default)]
    struct States(Mutex<Vec<TransportState>>);

    impl ReceiverDriver for States {
        fn add(&self, _msg: Message) {}

        fn set_transport_state(&self, state: TransportState) {
            self.0.lock().push(state);
        }
    }

    fn wait_for(receiver: &Receiver, state: TransportState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if receiver.transport_state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn sender() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => (socket, addr),
            other => panic!("unexpected {}", other),
        }
    }

    fn joined(sender: &UdpSocket) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            if let Ok((len, _)) = sender.recv_from(&mut buf) {
                let datagram = Bytes::copy_from_slice(&buf[..len]);
                if OhmHeader::parse(datagram).is_ok_and(|(h, _)| h.msg_type == MsgType::Join) {
                    return true;
                }
            }
        }
        false
    }

    fn zone_id(receiver: &Receiver) -> u64 {
        receiver.shared.mode.lock().zone.as_ref().map(|zone| zone.id).unwrap()
    }

    fn session(receiver: &Receiver) -> Option<u64> {
        receiver.shared.mode.lock().session
    }

    #[test]
    fn test_zone_resolution_switches_session() {
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, Arc::new(States::default())).unwrap();
        receiver.play("ohz://239.255.255.250:51995/office").unwrap();
        assert!(wait_for(&receiver, TransportState::Waiting));
        let id = zone_id(&receiver);

        let (sender, endpoint) = sender();
        let uri = format!("ohu://{}", endpoint);
        receiver.shared.zone_resolved(id, &uri);
        assert_eq!(receiver.play_mode(), PlayMode::Unicast(endpoint));
        assert_eq!(receiver.zone(), Some(("office".to_string(), Some(uri.clone()))));
        assert!(joined(&sender));
        assert!(wait_for(&receiver, TransportState::Buffering));
        let current = session(&receiver);

        // repeating the uri keeps the session
        receiver.shared.zone_resolved(id, &uri);
        assert_eq!(session(&receiver), current);

        // answers for a zone no longer being resolved are dropped
        let (_other, elsewhere) = self::sender();
        receiver.shared.zone_resolved(id + 100, &format!("ohu://{}", elsewhere));
        assert_eq!(receiver.play_mode(), PlayMode::Unicast(endpoint));
        assert_eq!(session(&receiver), current);

        // as are uris naming another zone
        receiver.shared.zone_resolved(id, "ohz://239.255.255.250:51995/den");
        assert_eq!(session(&receiver), current);
    }

    #[test]
    fn test_unopenable_zone_uri_falls_back_to_waiting() {
        let driver = Arc::new(States::default());
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, driver.clone()).unwrap();
        receiver.play("ohz://239.255.255.250:51994/office").unwrap();
        assert!(wait_for(&receiver, TransportState::Waiting));
        let id = zone_id(&receiver);

        // out of range for IP_TTL, so the unicast socket cannot be opened
        receiver.set_ttl(256);
        let (_sender, endpoint) = sender();
        receiver.shared.zone_resolved(id, &format!("ohu://{}", endpoint));

        assert_eq!(receiver.play_mode(), PlayMode::Null(Some("office".into())));
        assert_eq!(receiver.zone(), Some(("office".to_string(), None)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while driver.0.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            *driver.0.lock(),
            vec![TransportState::Waiting, TransportState::Stopped, TransportState::Waiting]
        );
    }

    #[test]
    fn test_null_uri_waits_then_stops() {
        let driver = Arc::new(States::default());
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, driver.clone()).unwrap();

        receiver.play("ohu://0.0.0.0:0").unwrap();
        assert_eq!(receiver.play_mode(), PlayMode::Null(None));
        assert!(wait_for(&receiver, TransportState::Waiting));

        receiver.stop();
        assert_eq!(receiver.transport_state(), TransportState::Stopped);
        assert_eq!(receiver.play_mode(), PlayMode::None);
        assert_eq!(
            *driver.0.lock(),
            vec![TransportState::Waiting, TransportState::Stopped]
        );
    }

    #[test]
    fn test_invalid_uri_leaves_receiver_idle() {
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, Arc::new(States::default())).unwrap();
        assert!(receiver.play("bogus").is_err());
        assert!(receiver.play("rtsp://10.0.0.1:554").is_err());
        assert_eq!(receiver.play_mode(), PlayMode::None);
        assert_eq!(receiver.transport_state(), TransportState::Stopped);
    }

    #[test]
    fn test_settings_round_trip() {
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, Arc::new(States::default())).unwrap();
        receiver.set_interface(Ipv4Addr::UNSPECIFIED);
        receiver.set_ttl(8);
        assert_eq!(receiver.interface(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(receiver.ttl(), 8);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let driver = Arc::new(States::default());
        let receiver = Receiver::new(Ipv4Addr::LOCALHOST, 1, driver.clone()).unwrap();
        receiver.stop();
        receiver.stop();
        drop(receiver);
        assert!(driver.0.lock().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ReceiverConfig::default();
        config.repair.playing_after_frames = 0;
        assert!(Receiver::with_config(Ipv4Addr::LOCALHOST, 1, Arc::new(States::default()), config).is_err());
    }
}
