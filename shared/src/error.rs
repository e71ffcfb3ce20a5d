//! Error types for l7proxify.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of failure, used to pick a log level and a metrics bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Oversized or malformed framing, SSLv2 hellos.
    Framing,
    /// A well-formed message arrived in the wrong state.
    Protocol,
    /// The connection was refused by policy.
    Policy,
    /// Socket, dial and timeout failures.
    Transport,
    /// Ruleset or configuration problems.
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Framing => "framing",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed cleanly on a record boundary.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Peer closed in the middle of a record.
    #[error("Unexpected EOF inside a TLS record")]
    UnexpectedEof,

    #[error("Oversized record received with length {0}")]
    OversizedRecord(usize),

    #[error("Oversized handshake message with length {0}")]
    OversizedHandshake(usize),

    #[error("Unsupported SSLv2 handshake received")]
    UnsupportedSslv2,

    #[error("Wanted record type {want} got {got}")]
    UnexpectedRecord { want: u8, got: u8 },

    #[error("Empty handshake record")]
    EmptyRecord,

    #[error("Unknown handshake message type {0}")]
    UnknownMessage(u8),

    #[error("Malformed {0} message")]
    Malformed(&'static str),

    #[error("Cannot encode ClientHello: {0}")]
    Encode(&'static str),

    #[error("Expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("ClientHello carries no server name")]
    MissingServerName,

    #[error("No rule matches {0}")]
    NoMatchingRule(String),

    #[error("Rule '{rule}' denies {host}")]
    Denied { host: String, rule: String },

    #[error("Certificate chain rejected: {0}")]
    CertificateRejected(String),

    #[error("Failed to connect to backend '{addr}': {message}")]
    Dial { addr: String, message: String },

    #[error("Handshake timed out")]
    Timeout,

    #[error("Invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::OversizedRecord(_)
            | Error::OversizedHandshake(_)
            | Error::UnsupportedSslv2
            | Error::EmptyRecord
            | Error::Malformed(_) => ErrorCategory::Framing,
            Error::UnexpectedRecord { .. }
            | Error::UnknownMessage(_)
            | Error::UnexpectedMessage { .. }
            | Error::Encode(_) => ErrorCategory::Protocol,
            Error::MissingServerName
            | Error::NoMatchingRule(_)
            | Error::Denied { .. }
            | Error::CertificateRejected(_) => ErrorCategory::Policy,
            Error::Io(_)
            | Error::ConnectionClosed
            | Error::UnexpectedEof
            | Error::Dial { .. }
            | Error::Timeout => ErrorCategory::Transport,
            Error::InvalidRule { .. } => ErrorCategory::Configuration,
        }
    }
}
