//! Error types for the fake server

use std::net::SocketAddr;

/// Errors surfaced to callers of the fake server
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Host key material could not be parsed or generated
    #[error("invalid host key: {0}")]
    HostKey(String),

    /// Authorized client key could not be parsed
    #[error("invalid public key: {0}")]
    PublicKey(String),

    /// Configuration rejected by validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Listener could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server already started on {0}")]
    AlreadyStarted(SocketAddr),

    #[error("server not started")]
    NotStarted,

    #[error("server already closed")]
    AlreadyClosed,

    /// Pseudo-terminal allocation or shell spawn failed
    #[error("pty: {0}")]
    Pty(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
