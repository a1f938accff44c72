//! Ohm Receiver Application
//!
//! Plays an `ohm://`, `ohu://` or `ohz://` uri and logs what arrives.
//!
//! ```text
//! ohm-receiver <uri> [--config path] [--interface addr] [--ttl n]
//! ```

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ohm_receiver::{Message, Receiver, ReceiverConfig, ReceiverDriver, TransportState};

/// Driver that logs messages instead of rendering them
#[derive(Default)]
struct LogDriver {
    frames: AtomicU64,
    samples: AtomicU64,
}

impl ReceiverDriver for LogDriver {
    fn add(&self, msg: Message) {
        match msg {
            Message::Audio(audio) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                self.samples.fetch_add(u64::from(audio.samples), Ordering::Relaxed);
                tracing::trace!(
                    "Frame {}: {} samples, {} Hz, {} ch, {}",
                    audio.frame,
                    audio.samples,
                    audio.sample_rate,
                    audio.channels,
                    audio.codec
                );
            }
            Message::Track(track) => {
                tracing::info!("Track {}: {}", track.sequence, track.uri);
            }
            Message::Metatext(meta) => {
                tracing::info!("Metatext {}: {}", meta.sequence, meta.metatext);
            }
        }
    }

    fn set_transport_state(&self, state: TransportState) {
        tracing::info!("Transport state: {}", state);
    }
}

struct Args {
    uri: String,
    config: Option<PathBuf>,
    interface: Ipv4Addr,
    ttl: u32,
}

fn parse_args() -> Result<Args> {
    let mut uri = None;
    let mut config = None;
    let mut interface = Ipv4Addr::UNSPECIFIED;
    let mut ttl = 1;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--interface" => {
                let value = args.next().context("--interface needs an address")?;
                interface = value.parse().with_context(|| format!("bad interface '{}'", value))?;
            }
            "--ttl" => {
                let value = args.next().context("--ttl needs a value")?;
                ttl = value.parse().with_context(|| format!("bad ttl '{}'", value))?;
            }
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other => uri = Some(other.to_string()),
        }
    }

    let Some(uri) = uri else {
        bail!("usage: ohm-receiver <uri> [--config path] [--interface addr] [--ttl n]");
    };

    Ok(Args { uri, config, interface, ttl })
}

fn load_config(path: Option<PathBuf>) -> Result<ReceiverConfig> {
    if let Some(path) = path {
        return ReceiverConfig::load(&path).with_context(|| format!("loading {}", path.display()));
    }

    let default_path = ProjectDirs::from("org", "openhome", "ohm-receiver")
        .map(|dirs| dirs.config_dir().join("receiver.toml"))
        .filter(|path| path.exists());

    match default_path {
        Some(path) => {
            tracing::info!("Using config {}", path.display());
            ReceiverConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(ReceiverConfig::default()),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ohm Receiver");

    let args = parse_args()?;
    let config = load_config(args.config)?;

    let driver = Arc::new(LogDriver::default());
    let receiver = Receiver::with_config(args.interface, args.ttl, driver.clone(), config)?;
    receiver.play(&args.uri)?;

    let mut last_frames = 0;
    loop {
        std::thread::sleep(Duration::from_secs(5));

        let frames = driver.frames.load(Ordering::Relaxed);
        let stats = receiver.multicast_stats();
        let unicast = receiver.unicast_stats();
        tracing::info!(
            "{} | {} frames (+{}), {} samples, latency {} ms | {} datagrams, {} invalid, {} resend requests, {} slaves",
            receiver.transport_state(),
            frames,
            frames - last_frames,
            driver.samples.load(Ordering::Relaxed),
            receiver.latency(),
            stats.datagrams_received + unicast.datagrams_received,
            stats.invalid_datagrams + unicast.invalid_datagrams,
            stats.resend_requests + unicast.resend_requests,
            receiver.slaves().len()
        );
        last_frames = frames;
    }
}
