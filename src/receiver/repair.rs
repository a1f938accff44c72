//! Frame gap repair
//!
//! Audio frames are numbered sequentially by the sender. When a frame
//! arrives ahead of the next expected one, the missing frames are
//! requested once and later arrivals are held back until the hole fills,
//! the repair window closes or the stream jumps too far to be worth it.
//! Frames are always released in order.
//!
//! Numbers wrap, so every comparison is a wrapping distance from the last
//! released frame.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::RepairConfig;
use crate::protocol::AudioMsg;

/// Work produced by one repair step
#[derive(Debug, Default)]
pub struct RepairOutput {
    /// Frames ready for the driver, in order
    pub deliver: Vec<AudioMsg>,
    /// Frames to request from the sender
    pub resend: Vec<u32>,
    /// Index in `deliver` where a restarted stream begins; frames before it
    /// belong to the old stream
    pub restarted_at: Option<usize>,
}

impl RepairOutput {
    /// Check if the sender restarted and the stream was re-baselined
    pub fn restarted(&self) -> bool {
        self.restarted_at.is_some()
    }
}

#[derive(Debug)]
struct Gap {
    /// Frame number offsets are measured from
    base: u32,
    missing: BTreeSet<u32>,
    held: BTreeMap<u32, AudioMsg>,
    deadline: Instant,
    next_retry: Option<Instant>,
    retries_left: u32,
    backoff: Duration,
}

impl Gap {
    fn highest(&self) -> u32 {
        let missing = self.missing.last().copied().unwrap_or(0);
        let held = self.held.last_key_value().map(|(k, _)| *k).unwrap_or(0);
        missing.max(held)
    }

    fn missing_frames(&self) -> Vec<u32> {
        self.missing
            .iter()
            .map(|offset| self.base.wrapping_add(*offset))
            .collect()
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.next_retry = if self.retries_left == 0 {
            None
        } else {
            Some(now + self.backoff).filter(|at| *at < self.deadline)
        };
    }
}

/// Per-session repair state
#[derive(Debug)]
pub struct Repairer {
    config: RepairConfig,
    window: Duration,
    last: u32,
    gap: Option<Gap>,
}

impl Repairer {
    /// Start from `baseline`, the first frame released in this session
    ///
    /// The repair window is the configured timeout capped by the stream
    /// latency; a repair that outlives the latency cannot be played anyway.
    pub fn new(config: &RepairConfig, latency_ms: u32, baseline: u32) -> Self {
        let window = config
            .repair_timeout()
            .min(Duration::from_millis(u64::from(latency_ms.max(1))));
        Self {
            config: config.clone(),
            window,
            last: baseline,
            gap: None,
        }
    }

    /// Last frame released
    pub fn last_frame(&self) -> u32 {
        self.last
    }

    /// Check if a gap is open
    pub fn is_repairing(&self) -> bool {
        self.gap.is_some()
    }

    /// Frames currently awaited
    pub fn missing(&self) -> Vec<u32> {
        self.gap.as_ref().map(Gap::missing_frames).unwrap_or_default()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept one arriving audio frame
    pub fn process(&mut self, msg: AudioMsg, now: Instant) -> RepairOutput {
        let mut out = self.tick(now);

        let distance = msg.frame.wrapping_sub(self.last) as i32;

        if distance <= 0 {
            if distance.unsigned_abs() >= self.config.discontinuity_frames {
                info!(
                    "Frame {} is {} behind {}; sender restarted",
                    msg.frame,
                    distance.unsigned_abs(),
                    self.last
                );
                out.restarted_at = Some(out.deliver.len());
                self.rebaseline(msg, &mut out);
            } else {
                debug!("Discarding late frame {} (at {})", msg.frame, self.last);
            }
            return out;
        }

        let offset = distance as u32;
        if offset - 1 > self.config.max_repair_frames {
            debug!(
                "Frame {} skips {} frames; not repairing",
                msg.frame,
                offset - 1
            );
            self.accept_gap(&mut out);
            self.rebaseline(msg, &mut out);
            return out;
        }

        match self.gap.take() {
            None if offset == 1 => {
                self.last = msg.frame;
                out.deliver.push(msg);
            }
            None => {
                let mut gap = Gap {
                    base: self.last,
                    missing: (1..offset).collect(),
                    held: BTreeMap::new(),
                    deadline: now + self.window,
                    next_retry: None,
                    retries_left: self.config.resend_retries,
                    backoff: self.config.resend_backoff(),
                };
                gap.held.insert(offset, msg);
                gap.schedule_retry(now);
                out.resend = gap.missing_frames();
                debug!(
                    "Gap of {} frame(s) after {}; requesting resend",
                    out.resend.len(),
                    self.last
                );
                self.gap = Some(gap);
            }
            Some(mut gap) => {
                let at = msg.frame.wrapping_sub(gap.base);
                let highest = gap.highest();
                if gap.missing.remove(&at) {
                    gap.held.insert(at, msg);
                } else if at > highest {
                    let extra: Vec<u32> = (highest + 1..at).collect();
                    out.resend = extra.iter().map(|o| gap.base.wrapping_add(*o)).collect();
                    gap.missing.extend(extra);
                    gap.held.insert(at, msg);
                } else {
                    debug!("Discarding duplicate frame {}", msg.frame);
                }
                self.gap = Some(gap);
                self.release(&mut out);
            }
        }

        out
    }

    /// Advance timers; re-requests outstanding frames or gives up on the gap
    pub fn tick(&mut self, now: Instant) -> RepairOutput {
        let mut out = RepairOutput::default();
        let Some(gap) = self.gap.as_mut() else {
            return out;
        };

        if now >= gap.deadline {
            debug!(
                "Repair window closed with {} frame(s) missing; skipping",
                gap.missing.len()
            );
            self.accept_gap(&mut out);
            return out;
        }

        if gap.next_retry.is_some_and(|at| now >= at) {
            gap.retries_left -= 1;
            gap.backoff *= 2;
            gap.schedule_retry(now);
            out.resend = gap.missing_frames();
        }

        out
    }

    /// Release held frames that now follow on without a hole
    fn release(&mut self, out: &mut RepairOutput) {
        let Some(gap) = self.gap.as_mut() else {
            return;
        };

        let mut next = self.last.wrapping_sub(gap.base) + 1;
        while let Some(msg) = gap.held.remove(&next) {
            self.last = msg.frame;
            out.deliver.push(msg);
            next += 1;
        }

        if gap.missing.is_empty() && gap.held.is_empty() {
            debug!("Gap repaired up to frame {}", self.last);
            self.gap = None;
        }
    }

    /// Give up on missing frames and release everything held
    fn accept_gap(&mut self, out: &mut RepairOutput) {
        if let Some(gap) = self.gap.take() {
            for (_, msg) in gap.held {
                self.last = msg.frame;
                out.deliver.push(msg);
            }
        }
    }

    fn rebaseline(&mut self, msg: AudioMsg, out: &mut RepairOutput) {
        self.gap = None;
        self.last = msg.frame;
        out.deliver.push(msg);
    }
}
