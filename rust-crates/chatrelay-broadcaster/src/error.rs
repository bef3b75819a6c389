use std::net::SocketAddr;

use thiserror::Error;

use crate::client::ConnectionId;

/// Reasons a listener could not claim its address. Always fatal to startup.
#[derive(Error, Debug)]
pub enum BindError {
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("Permission denied binding {0}")]
    PermissionDenied(SocketAddr),

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl BindError {
    /// Classify an I/O error raised while binding or listening on `addr`.
    pub fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddressInUse(addr),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr),
            std::io::ErrorKind::AddrNotAvailable => Self::InvalidAddress(addr.to_string()),
            _ => Self::Io { addr, source },
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Accept error: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Read error on connection {0}: {1}")]
    Read(ConnectionId, #[source] std::io::Error),

    #[error("Write error on connection {0}: {1}")]
    Write(ConnectionId, #[source] std::io::Error),

    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Connection {0} was removed and cannot be registered again")]
    RetiredConnection(ConnectionId),

    #[error("Connection {0} is not writable")]
    NotWritable(ConnectionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener not started")]
    NotStarted,

    #[error("Listener already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, RelayError>;
