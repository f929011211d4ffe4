//! Error types for the inbound engine
//!
//! Errors are categorized by subsystem and composed into a single
//! top-level type. Closed-or-cancelled conditions are detectable via
//! [`Error::is_closed`] so callers can demote them to debug logging.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors (file parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener setup and accept errors
    #[error("listen error: {0}")]
    Listen(#[from] ListenError),

    /// UDP receive/send/write-back errors
    #[error("udp error: {0}")]
    Udp(#[from] UdpError),

    /// Service lifecycle errors
    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    /// Protocol decoding errors (SOCKS/HTTP/PROXY-protocol framing)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Routing errors (no matching outbound, dial failures)
    #[error("route error: {0}")]
    Route(String),

    /// I/O errors not covered by other categories
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error means the peer or socket is gone rather than
    /// something actionable. Such errors are logged at debug level.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Udp(e) => e.is_closed(),
            Self::Io(e) => is_closed_io(e),
            _ => false,
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Check an `io::Error` for closed-or-cancelled conditions
#[must_use]
pub fn is_closed_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("parse {section}: {cause}")]
    Parse { section: String, cause: String },

    /// Validation error (invalid values, missing required fields)
    #[error("parse {section}: {cause}")]
    Validation { section: String, cause: String },

    /// I/O error while reading config
    #[error("i/o error reading configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Parse error scoped to a config section, e.g. `inbound[2]`
    pub fn parse(section: impl Into<String>, cause: impl ToString) -> Self {
        Self::Parse {
            section: section.into(),
            cause: cause.to_string(),
        }
    }

    /// Validation error scoped to a config section
    pub fn validation(section: impl Into<String>, cause: impl ToString) -> Self {
        Self::Validation {
            section: section.into(),
            cause: cause.to_string(),
        }
    }
}

/// Listener setup and accept errors
#[derive(Debug, Error)]
pub enum ListenError {
    /// Failed to create the socket
    #[error("failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option
    #[error("failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to the configured address
    #[error("failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// TCP fast open requested on a platform without support
    #[error("tcp fast open is not supported on this platform")]
    FastOpenUnsupported,

    /// System proxy installation failed
    #[error("set system proxy: {0}")]
    SystemProxy(String),
}

impl ListenError {
    /// Socket option error helper
    pub fn socket_option(option: impl Into<String>, reason: impl ToString) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.to_string(),
        }
    }
}

/// UDP receive/send/write-back errors
#[derive(Debug, Error)]
pub enum UdpError {
    /// Receive failed; the receive loop exits on this
    #[error("failed to receive packet: {0}")]
    Recv(String),

    /// Send failed; the writer logs and continues
    #[error("failed to send packet to {destination}: {reason}")]
    Send {
        destination: String,
        reason: String,
    },

    /// FQDN destination could not be resolved
    #[error("failed to resolve {destination}: {reason}")]
    Resolve {
        destination: String,
        reason: String,
    },

    /// The write-back path has shut down; the packet was released
    #[error("packet connection closed")]
    Closed,
}

impl UdpError {
    /// Send error helper
    pub fn send(destination: impl ToString, reason: impl ToString) -> Self {
        Self::Send {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Resolve error helper
    pub fn resolve(destination: impl ToString, reason: impl ToString) -> Self {
        Self::Resolve {
            destination: destination.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the write-back path or socket is gone
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Service lifecycle errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A component failed to start; startup is aborted
    #[error("start {component}: {cause}")]
    Start { component: String, cause: String },

    /// One or more components failed to close. Individual errors are
    /// aggregated rather than short-circuited.
    #[error("close errors: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl ServiceError {
    /// Start error helper
    pub fn start(component: impl Into<String>, cause: impl ToString) -> Self {
        Self::Start {
            component: component.into(),
            cause: cause.to_string(),
        }
    }
}

/// Aggregate a list of close errors into at most one `ServiceError`
#[must_use]
pub fn join_close_errors(errors: Vec<Error>) -> Option<ServiceError> {
    if errors.is_empty() {
        None
    } else {
        Some(ServiceError::Close(
            errors.iter().map(ToString::to_string).collect(),
        ))
    }
}
