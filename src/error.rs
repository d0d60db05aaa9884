use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Error delivered to disconnect callbacks and returned by constructors.
///
/// Transport failures keep the underlying I/O error as the nested cause so
/// callers can inspect the specific reason (refused, reset, unreachable).
/// The remaining kinds classify failures the library itself detects.
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// Any failure surfaced by the transport: connect, accept, read, write
    /// or handshake. The wrapped error is the specific sub-reason.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// A framing invariant was violated: the declared payload length
    /// exceeded the configured cap, or the read actor advanced the framer
    /// by the wrong byte count. Also used when a user callback panics.
    #[error("data corruption or unknown data format")]
    DataCorruption,

    /// The local side asked for the disconnect.
    #[error("user triggered disconnect")]
    UserTriggeredDisconnect,

    /// Teardown path that supplied no explicit error.
    #[error("connection aborted")]
    ConnectionAborted,

    /// Unusable configuration, e.g. a refused TLS method or missing
    /// certificate material.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NetError {
    pub fn transport(err: io::Error) -> Self {
        Self::Transport(Arc::new(err))
    }

    /// Whether a transport error classifies as the peer being unreachable.
    /// Kept as a query rather than a distinct kind; the nested cause is the
    /// source of truth.
    pub fn is_host_unreachable(&self) -> bool {
        match self {
            Self::Transport(err) => matches!(
                err.kind(),
                io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        Self::transport(err)
    }
}
