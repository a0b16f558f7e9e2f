//! Error types for the cluster crate.

use protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::exception::{RemoteError, RemoteException};

/// Errors surfaced to callers of the invocation layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire-level failure: framing, integrity, handshake or transport.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection was closed, locally or by the peer.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A request was issued before the handshake finished and queueing is
    /// disabled.
    #[error("connection is not ready")]
    NotReady,

    /// A proxy belonging to another connection was passed as an argument.
    #[error("proxy for object {object_id} belongs to a different connection")]
    ForeignProxy {
        /// Remote object id of the offending proxy.
        object_id: u64,
    },

    /// The proxy's type does not export the requested method or attribute.
    #[error("object {object_id} does not export '{member}'")]
    UnsupportedMember {
        /// Remote object id.
        object_id: u64,
        /// Method or attribute name.
        member: String,
    },

    /// The remote call raised; carries the original error.
    #[error("{0}")]
    Remote(RemoteError),

    /// The remote call raised; uniform wrapper carrying the traceback.
    #[error("{0}")]
    RemoteException(RemoteException),

    /// A record could not be encoded or decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true when the error means the connection cannot be used any
    /// more.
    pub fn is_transport_fault(&self) -> bool {
        match self {
            Error::Protocol(e) => e.is_transport_fault(),
            Error::ConnectionClosed(_) => true,
            _ => false,
        }
    }

    /// Returns true for either flavour of connection closure.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed(_) | Error::Protocol(ProtocolError::ConnectionClosed(_))
        )
    }

    /// The original remote error, if this error came from a remote call.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Error::Remote(e) => Some(e),
            Error::RemoteException(e) => Some(&e.error),
            _ => None,
        }
    }
}
