//! Per-session message handling on the processing thread

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use super::repair::{RepairOutput, Repairer};
use super::state::TransportState;
use super::ReceiverDriver;
use crate::config::RepairConfig;
use crate::network::{MessageSink, Resend};
use crate::protocol::{AudioMsg, Message};

#[derive(Debug, Clone, Copy)]
struct TransportStatus {
    state: TransportState,
    latency_ms: u32,
}

/// Transport state and latency, plus the driver they are reported to
///
/// Only the processing thread writes here; readers take a snapshot.
pub(crate) struct Transport {
    driver: Arc<dyn ReceiverDriver>,
    status: Mutex<TransportStatus>,
}

impl Transport {
    pub fn new(driver: Arc<dyn ReceiverDriver>) -> Self {
        Self {
            driver,
            status: Mutex::new(TransportStatus {
                state: TransportState::Stopped,
                latency_ms: 0,
            }),
        }
    }

    pub fn state(&self) -> TransportState {
        self.status.lock().state
    }

    pub fn latency(&self) -> u32 {
        self.status.lock().latency_ms
    }

    /// Record a new state, notifying the driver on change
    pub fn set_state(&self, state: TransportState) {
        let previous = {
            let mut status = self.status.lock();
            std::mem::replace(&mut status.state, state)
        };
        if previous != state {
            debug!("Transport {} -> {}", previous, state);
            self.driver.set_transport_state(state);
        }
    }

    pub fn set_latency(&self, latency_ms: u32) {
        self.status.lock().latency_ms = latency_ms;
    }

    pub fn deliver(&self, msg: Message) {
        self.driver.add(msg);
    }
}

/// Message sink for one stream session
///
/// Repairs audio gaps, establishes latency from the first frame and moves
/// the transport from Buffering to Playing once frames flow contiguously.
/// Everything is dropped as soon as `active` no longer names this session.
pub(crate) struct SessionProcessor<'a> {
    transport: &'a Transport,
    resend: &'a dyn Resend,
    config: &'a RepairConfig,
    active: &'a AtomicU64,
    generation: u64,
    repair: Option<Repairer>,
    previous: Option<u32>,
    contiguous: u32,
    playing: bool,
}

impl<'a> SessionProcessor<'a> {
    pub fn new(
        transport: &'a Transport,
        resend: &'a dyn Resend,
        config: &'a RepairConfig,
        active: &'a AtomicU64,
        generation: u64,
    ) -> Self {
        Self {
            transport,
            resend,
            config,
            active,
            generation,
            repair: None,
            previous: None,
            contiguous: 0,
            playing: false,
        }
    }

    fn is_current(&self) -> bool {
        self.active.load(Ordering::Acquire) == self.generation
    }

    /// Handle a message as if it arrived at `now`
    pub fn add_at(&mut self, msg: Message, now: Instant) {
        if !self.is_current() {
            trace!("Dropping {:?} from stopped session", msg.msg_type());
            return;
        }

        match msg {
            Message::Audio(audio) => self.audio(audio, now),
            other => self.transport.deliver(other),
        }
    }

    fn audio(&mut self, audio: AudioMsg, now: Instant) {
        match self.repair.as_mut() {
            Some(repair) => {
                let out = repair.process(audio, now);
                self.apply(out);
            }
            None => {
                let latency = if audio.latency != 0 {
                    audio.latency
                } else {
                    self.config.default_latency_ms
                };
                info!("Stream starts at frame {} with {} ms latency", audio.frame, latency);
                self.transport.set_latency(latency);
                self.repair = Some(Repairer::new(self.config, latency, audio.frame));
                self.release(audio);
            }
        }
    }

    fn apply(&mut self, out: RepairOutput) {
        if !out.resend.is_empty() {
            self.resend.request_resend(&out.resend);
        }
        for (index, audio) in out.deliver.into_iter().enumerate() {
            if out.restarted_at == Some(index) {
                self.previous = None;
                self.contiguous = 0;
                self.playing = false;
                self.transport.set_state(TransportState::Buffering);
            }
            self.release(audio);
        }
    }

    fn release(&mut self, audio: AudioMsg) {
        let follows = self
            .previous
            .is_some_and(|previous| audio.frame == previous.wrapping_add(1));
        self.contiguous = if follows { self.contiguous + 1 } else { 1 };
        self.previous = Some(audio.frame);

        self.transport.deliver(Message::Audio(audio));

        if !self.playing && self.contiguous >= self.config.playing_after_frames {
            self.playing = true;
            self.transport.set_state(TransportState::Playing);
        }
    }
}

impl MessageSink for SessionProcessor<'_> {
    fn add(&mut self, msg: Message) {
        self.add_at(msg, Instant::now());
    }

    fn tick(&mut self, now: Instant) {
        if !self.is_current() {
            return;
        }
        if let Some(repair) = self.repair.as_mut() {
            let out = repair.tick(now);
            self.apply(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackMsg;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<u32>>,
        others: Mutex<Vec<Message>>,
        states: Mutex<Vec<TransportState>>,
    }

    impl ReceiverDriver for Recorder {
        fn add(&self, msg: Message) {
            match msg {
                Message::Audio(audio) => self.frames.lock().push(audio.frame),
                other => self.others.lock().push(other),
            }
        }

        fn set_transport_state(&self, state: TransportState) {
            self.states.lock().push(state);
        }
    }

    #[derive(Default)]
    struct Requests(Mutex<Vec<Vec<u32>>>);

    impl Resend for Requests {
        fn request_resend(&self, frames: &[u32]) {
            self.0.lock().push(frames.to_vec());
        }
    }

    struct Fixture {
        recorder: Arc<Recorder>,
        transport: Transport,
        requests: Requests,
        config: RepairConfig,
        active: AtomicU64,
    }

    impl Fixture {
        fn new() -> Self {
            let recorder = Arc::new(Recorder::default());
            let transport = Transport::new(recorder.clone());
            transport.set_state(TransportState::Buffering);
            Self {
                recorder,
                transport,
                requests: Requests::default(),
                config: RepairConfig::default(),
                active: AtomicU64::new(1),
            }
        }

        fn processor(&self) -> SessionProcessor<'_> {
            SessionProcessor::new(&self.transport, &self.requests, &self.config, &self.active, 1)
        }
    }

    fn audio(frame: u32, latency: u32) -> Message {
        Message::Audio(AudioMsg::new(frame, latency))
    }

    #[test]
    fn test_latency_from_first_frame() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(audio(1, 120));
        p.add(audio(2, 80));
        assert_eq!(fx.transport.latency(), 120);
    }

    #[test]
    fn test_latency_defaults_when_undeclared() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(audio(1, 0));
        assert_eq!(fx.transport.latency(), 50);
    }

    #[test]
    fn test_buffering_to_playing() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(audio(7, 0));
        assert_eq!(fx.transport.state(), TransportState::Buffering);
        p.add(audio(8, 0));
        assert_eq!(fx.transport.state(), TransportState::Playing);
        assert_eq!(
            *fx.recorder.states.lock(),
            vec![TransportState::Buffering, TransportState::Playing]
        );
    }

    #[test]
    fn test_gap_requests_exactly_once() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        let t = Instant::now();
        for frame in [10, 11, 13, 14] {
            p.add_at(audio(frame, 0), t);
        }
        p.tick(t + Duration::from_millis(20));
        p.add_at(audio(12, 0), t + Duration::from_millis(30));
        p.tick(t + Duration::from_millis(300));

        assert_eq!(*fx.requests.0.lock(), vec![vec![12]]);
        assert_eq!(*fx.recorder.frames.lock(), vec![10, 11, 12, 13, 14]);
        assert_eq!(fx.transport.state(), TransportState::Playing);
    }

    #[test]
    fn test_unfilled_gap_skipped_after_window() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        let t = Instant::now();
        for frame in [10, 11, 13, 14] {
            p.add_at(audio(frame, 0), t);
        }
        // default latency 50ms caps the window
        p.tick(t + Duration::from_millis(49));
        assert_eq!(*fx.recorder.frames.lock(), vec![10, 11]);
        p.tick(t + Duration::from_millis(50));
        p.add_at(audio(12, 0), t + Duration::from_millis(60));

        assert_eq!(*fx.requests.0.lock(), vec![vec![12]]);
        assert_eq!(*fx.recorder.frames.lock(), vec![10, 11, 13, 14]);
    }

    #[test]
    fn test_restart_keeps_latency_and_rebuffers() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(audio(5000, 90));
        p.add(audio(5001, 90));
        p.add(audio(3, 40));

        assert_eq!(fx.transport.latency(), 90);
        assert_eq!(fx.transport.state(), TransportState::Buffering);
        p.add(audio(4, 40));
        assert_eq!(fx.transport.state(), TransportState::Playing);
        assert_eq!(*fx.recorder.frames.lock(), vec![5000, 5001, 3, 4]);
    }

    #[test]
    fn test_old_stream_frames_do_not_count_after_restart() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        let t = Instant::now();
        p.add_at(audio(5000, 0), t);
        p.add_at(audio(5001, 0), t);
        p.add_at(audio(5003, 0), t);
        p.add_at(audio(5004, 0), t);
        assert_eq!(fx.transport.state(), TransportState::Playing);

        // the expired gap releases 5003 and 5004 ahead of the restarted frame
        p.add_at(audio(2, 0), t + Duration::from_secs(1));
        assert_eq!(*fx.recorder.frames.lock(), vec![5000, 5001, 5003, 5004, 2]);
        assert_eq!(fx.transport.state(), TransportState::Buffering);

        p.add_at(audio(3, 0), t + Duration::from_secs(1));
        assert_eq!(fx.transport.state(), TransportState::Playing);
        assert_eq!(
            *fx.recorder.states.lock(),
            vec![
                TransportState::Buffering,
                TransportState::Playing,
                TransportState::Buffering,
                TransportState::Playing
            ]
        );
    }

    #[test]
    fn test_stale_session_is_silent() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(audio(1, 0));
        fx.active.store(2, Ordering::Release);
        p.add(audio(3, 0));
        p.add(Message::Track(TrackMsg::default()));
        p.tick(Instant::now() + Duration::from_secs(1));

        assert_eq!(*fx.recorder.frames.lock(), vec![1]);
        assert!(fx.recorder.others.lock().is_empty());
        assert!(fx.requests.0.lock().is_empty());
    }

    #[test]
    fn test_track_forwarded() {
        let fx = Fixture::new();
        let mut p = fx.processor();
        p.add(Message::Track(TrackMsg {
            sequence: 3,
            uri: "http://x/y".into(),
            metadata: String::new(),
        }));
        assert_eq!(fx.recorder.others.lock().len(), 1);
    }
}
