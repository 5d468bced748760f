//! Error types for the node transport layer.

use {
    crate::config::ConfigError,
    std::{fmt, net::SocketAddr},
    thiserror::Error,
};

/// Why a write never reached the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The shared bandwidth limiter refused the buffer.
    BandwidthLimited,
    /// The connection's write queue was over its drop threshold.
    QueueFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BandwidthLimited => f.write_str("bandwidth limited"),
            Self::QueueFull => f.write_str("write queue full"),
        }
    }
}

/// Why an inbound connection was refused by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionLimit {
    /// Too many live connections from the same address.
    PerIp,
    /// Too many live connections from the same subnet.
    PerSubnet,
}

/// Errors that can occur in the transport layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// The peer refused or could not be reached.
    #[error("connection failed to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The outbound connect did not finish within the io timeout.
    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// The listener could not bind its local address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an open connection.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was idle or silent for too long and has been closed.
    #[error("connection timed out")]
    Timeout,

    /// The connection is closed; the operation was not performed or its
    /// result was discarded.
    #[error("connection closed")]
    Closed,

    /// An I/O operation was attempted before the connection was established.
    #[error("connection not established")]
    NotConnected,

    /// A write was dropped before submission.
    #[error("write dropped: {0}")]
    Dropped(DropReason),

    /// An inbound connection exceeded an admission limit. Only used for
    /// local accounting; the remote peer is never told.
    #[error("admission rejected for {addr}: {limit:?} limit reached")]
    AdmissionRejected { addr: SocketAddr, limit: AdmissionLimit },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Convenience result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;
