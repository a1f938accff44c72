//! Zone discovery thread
//!
//! Resolves a zone name to the uri currently streaming it. Queries are
//! sent to the discovery group a bounded number of times; after that the
//! thread keeps listening for unsolicited announcements, so a zone that
//! starts (or moves) later is still picked up.

use bytes::Bytes;
use crossbeam_channel::{Receiver, TryRecvError};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ReceiverConfig;
use crate::constants::MAX_ZONE_FRAME_BYTES;
use crate::network::udp::{create_multicast_socket, recv_datagram, send_datagram, SocketOptions};
use crate::network::Timer;
use crate::protocol::ZoneMsg;

/// One zone to resolve
#[derive(Debug, Clone)]
pub(crate) struct ZoneJob {
    /// Distinguishes this request from earlier ones for the same zone
    pub id: u64,
    pub zone: String,
    pub endpoint: SocketAddrV4,
    pub interface: Ipv4Addr,
    pub ttl: u32,
}

pub(crate) enum ZoneCommand {
    Start(ZoneJob),
    Stop,
    Terminate,
}

/// Receives resolved uris
pub(crate) trait ZoneListener: Send + Sync {
    fn zone_resolved(&self, id: u64, uri: &str);
}

/// Thread body: serve commands until told to terminate
pub(crate) fn run(listener: &dyn ZoneListener, config: &ReceiverConfig, commands: Receiver<ZoneCommand>) {
    let mut next = commands.recv().ok();

    loop {
        match next.take() {
            Some(ZoneCommand::Start(job)) => {
                next = discover(listener, config, &job, &commands);
                if next.is_none() {
                    // socket setup failed; wait for the next request
                    next = commands.recv().ok();
                }
            }
            Some(ZoneCommand::Stop) => next = commands.recv().ok(),
            Some(ZoneCommand::Terminate) | None => break,
        }
    }

    debug!("Zone discovery thread exiting");
}

/// Uri announced for `zone`, if the datagram is such an announcement
pub(crate) fn announced_uri(zone: &str, datagram: Bytes) -> Option<String> {
    match ZoneMsg::parse(datagram) {
        Ok(Some(ZoneMsg::Uri { zone: announced, uri })) if announced == zone => Some(uri),
        Ok(Some(ZoneMsg::Uri { zone: other, .. })) => {
            trace!("Ignoring announcement for zone '{}'", other);
            None
        }
        Ok(_) => None,
        Err(e) => {
            trace!("Dropping discovery datagram: {}", e);
            None
        }
    }
}

/// Query and listen for one zone; returns the command that interrupted it
fn discover(
    listener: &dyn ZoneListener,
    config: &ReceiverConfig,
    job: &ZoneJob,
    commands: &Receiver<ZoneCommand>,
) -> Option<ZoneCommand> {
    let options = SocketOptions {
        interface: job.interface,
        ttl: job.ttl,
        read_timeout: config.protocol.read_timeout(),
        recv_buffer_bytes: config.protocol.recv_buffer_bytes,
    };
    let socket = match create_multicast_socket(job.endpoint, &options) {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Zone discovery for '{}' unavailable: {}", job.zone, e);
            return None;
        }
    };

    let query = match (ZoneMsg::Query { zone: job.zone.clone() }).encode() {
        Ok(query) => query,
        Err(e) => {
            warn!("Cannot query zone '{}': {}", job.zone, e);
            return None;
        }
    };

    info!("Resolving zone '{}' via {}", job.zone, job.endpoint);

    let mut buf = vec![0u8; MAX_ZONE_FRAME_BYTES];
    let mut timer = Timer::new();
    let mut queries = 0u32;
    timer.fire_in(Instant::now(), config.zone.query_interval());

    loop {
        match commands.try_recv() {
            Ok(cmd) => return Some(cmd),
            Err(TryRecvError::Disconnected) => return Some(ZoneCommand::Terminate),
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if timer.expired(now) {
            if send_datagram(&socket, &query, job.endpoint) {
                queries += 1;
                trace!("Sent zone query {} for '{}'", queries, job.zone);
            }
            if queries < config.zone.query_retries {
                timer.fire_in(now, config.zone.query_interval());
            } else {
                debug!("No answer for zone '{}' yet; listening for announcements", job.zone);
            }
        }

        if let Some((datagram, from)) = recv_datagram(&socket, &mut buf) {
            if let Some(uri) = announced_uri(&job.zone, datagram) {
                debug!("Zone '{}' announced at {} by {}", job.zone, uri, from);
                timer.cancel();
                listener.zone_resolved(job.id, &uri);
            }
        }
    }
}
