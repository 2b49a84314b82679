//! Error types for address discovery
//!
//! Errors are split by the layer that raises them:
//!
//! - **Transport**: socket bind/send/receive failures. Bind failures are
//!   retried with a fresh ephemeral port; everything else aborts only the
//!   diagnostics run that hit it.
//! - **Protocol**: malformed or incomplete STUN messages. Never propagated
//!   out of a diagnostics run; treated the same as "no response".
//! - **Discovery**: pool-level failures, surfaced to the caller of
//!   [`AddressPool::init_pool`](crate::AddressPool::init_pool).
//!
//! A STUN timeout is not an error. It is a normal branch of the
//! classification algorithm and is reported as `Ok(None)`.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Socket-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not bind the local STUN socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Local address we attempted to bind
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Could not send a datagram
    #[error("failed to send to {dest}: {source}")]
    Send {
        /// Destination of the failed send
        dest: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Receive loop failed
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    /// Could not resolve a STUN server host name
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Host:port string that failed to resolve
        host: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The client was shut down
    #[error("STUN client is shut down")]
    Closed,
}

impl TransportError {
    /// Returns true if retrying with a different local port may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bind { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::AddrInUse
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::Interrupted
            ),
            Self::Send { .. } | Self::Receive(_) => true,
            Self::Resolve { .. } | Self::Closed => false,
        }
    }
}

/// Malformed or incomplete STUN messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer than 20 header bytes
    #[error("STUN message too short: {0} bytes")]
    MessageTooShort(usize),

    /// Header length disagrees with the datagram
    #[error("STUN length field {declared} exceeds payload {actual}")]
    LengthMismatch {
        /// Length declared in the header
        declared: usize,
        /// Attribute bytes actually present
        actual: usize,
    },

    /// Message type outside the binding method
    #[error("unknown STUN message type 0x{0:04x}")]
    UnknownMessageType(u16),

    /// Attribute body cannot be parsed
    #[error("invalid STUN attribute 0x{0:04x}")]
    InvalidAttribute(u16),

    /// Address family other than IPv4/IPv6
    #[error("unsupported address family 0x{0:02x}")]
    UnsupportedFamily(u8),

    /// A response lacks a required attribute
    #[error("missing STUN attribute {0}")]
    MissingAttribute(&'static str),

    /// A change request was answered from the address it asked the
    /// server not to use
    #[error("change request ignored: reply came from {from}")]
    ChangeRequestIgnored {
        /// Where the reply came from
        from: SocketAddr,
    },

    /// Server answered with a Binding Error Response
    #[error("STUN error response {code}: {reason}")]
    ErrorResponse {
        /// Error class * 100 + number
        code: u16,
        /// Reason phrase
        reason: String,
    },
}

/// Pool-level failures
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Local interfaces could not be enumerated
    #[error("interface enumeration failed: {0}")]
    Enumeration(String),

    /// A caller handed in an unusable value
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Configuration is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket failure outside a diagnostics run
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for pool and manager operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
