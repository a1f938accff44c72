//! Transport state, play mode and uri resolution

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use url::Url;

use crate::config::ZoneConfig;
use crate::constants::{DEFAULT_STREAM_PORT, MAX_URI_BYTES, MAX_ZONE_BYTES};
use crate::error::ReceiverError;

/// Playback readiness reported to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Playing,
    Stopped,
    /// Nothing to play yet (null endpoint or unresolved zone)
    Waiting,
    /// Session open, frame continuity not yet established
    Buffering,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Playing => "Playing",
            TransportState::Stopped => "Stopped",
            TransportState::Waiting => "Waiting",
            TransportState::Buffering => "Buffering",
        };
        f.write_str(name)
    }
}

/// Which protocol, if any, is active
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlayMode {
    #[default]
    None,
    Multicast(SocketAddrV4),
    Unicast(SocketAddrV4),
    /// Session without a sender; carries the zone being resolved, if any
    Null(Option<String>),
}

/// What a play uri asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayTarget {
    Stream(PlayMode),
    Zone { discovery: SocketAddrV4, zone: String },
}

/// Resolve an `ohm://`, `ohu://` or `ohz://` uri
///
/// An `ohm`/`ohu` endpoint with address `0.0.0.0` selects null mode.
/// Zone uris carry the discovery endpoint and the zone name as path:
/// `ohz://239.255.255.250:51972/kitchen`. A zone uri without a host
/// (`ohz:///kitchen` or `ohz:kitchen`) uses the configured discovery group,
/// and one without a port uses the configured discovery port.
pub fn resolve_uri(uri: &str, zones: &ZoneConfig) -> Result<PlayTarget, ReceiverError> {
    if uri.len() > MAX_URI_BYTES {
        return Err(ReceiverError::InvalidUri(format!("longer than {} bytes", MAX_URI_BYTES)));
    }

    let url = Url::parse(uri).map_err(|e| ReceiverError::InvalidUri(format!("{}: {}", uri, e)))?;

    match url.scheme() {
        "ohm" | "ohu" => {
            let endpoint = endpoint(&url, DEFAULT_STREAM_PORT)?;
            let mode = if endpoint.ip().is_unspecified() {
                PlayMode::Null(None)
            } else if url.scheme() == "ohm" {
                PlayMode::Multicast(endpoint)
            } else {
                PlayMode::Unicast(endpoint)
            };
            Ok(PlayTarget::Stream(mode))
        }
        "ohz" => {
            let discovery = if has_host(&url) {
                endpoint(&url, zones.port)?
            } else {
                SocketAddrV4::new(zones.address, url.port().unwrap_or(zones.port))
            };
            let segment = if url.cannot_be_a_base() {
                Some(url.path()).filter(|path| !path.is_empty())
            } else {
                url.path_segments()
                    .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            }
            .ok_or_else(|| ReceiverError::InvalidUri(format!("{}: missing zone", uri)))?;
            let zone = urlencoding::decode(segment)
                .map_err(|e| ReceiverError::InvalidUri(format!("{}: {}", uri, e)))?
                .into_owned();
            if zone.len() > MAX_ZONE_BYTES {
                return Err(ReceiverError::InvalidUri(format!("{}: zone name too long", uri)));
            }
            Ok(PlayTarget::Zone { discovery, zone })
        }
        other => Err(ReceiverError::UnsupportedScheme(other.to_string())),
    }
}

fn has_host(url: &Url) -> bool {
    url.host_str().is_some_and(|host| !host.is_empty())
}

fn endpoint(url: &Url, default_port: u16) -> Result<SocketAddrV4, ReceiverError> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ReceiverError::InvalidUri(format!("{}: missing host", url)))?;
    let port = url.port().unwrap_or(default_port);

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| ReceiverError::InvalidUri(format!("{}: {}", host, e)))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| ReceiverError::InvalidUri(format!("{}: no IPv4 address", host)))
}
