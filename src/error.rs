//! Error types for the stream receiver

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("Bad signature")]
    BadSignature,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Invalid text field")]
    InvalidText,
}

/// Socket setup errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Multicast join failed: {0}")]
    JoinFailed(String),

    #[error("Socket option failed: {0}")]
    SocketOption(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Invalid uri: {0}")]
    InvalidUri(String),

    #[error("Unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    #[error("Session {0} has not stopped yet")]
    SessionStuck(u64),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
