//! Crate-wide error type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A bounded wait (`recv`/`emit_event` with a timeout, or a client call)
    /// elapsed without an event. The second field, when non-empty, names the
    /// operation that timed out (e.g. the remote method being called).
    #[error("timed out{}", if .1.is_empty() { String::new() } else { format!(" ({})", .1) })]
    TimeoutExpired(Option<std::time::Duration>, String),

    /// The heartbeat overlay detected no inbound traffic within the liveness
    /// deadline, or the underlying transport reported the peer as gone.
    #[error("lost remote peer")]
    LostRemote,

    /// An `ERR` event was received and reconstructed into an exception.
    #[error("{message}")]
    RemoteError {
        name: String,
        message: String,
        traceback: Option<String>,
    },

    /// The peer sent more events than the credit it was granted.
    #[error("BufferedChannel queue overflow, peer violated credit accounting")]
    QueueOverflow,

    /// No method registered under this name (server), or no pattern accepts
    /// a reply event of this name (client).
    #[error("name error: {0}")]
    NameError(String),

    /// The EventSource reported a transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The EventSource (or a channel derived from it) has been closed.
    #[error("transport closed")]
    TransportClosed,
}

impl Error {
    /// The name to use when forwarding this error over the wire as an `ERR`
    /// event, mirroring the exception type name a Python peer would send.
    pub fn remote_name(&self) -> String {
        match self {
            Error::RemoteError { name, .. } => name.clone(),
            Error::TimeoutExpired(..) => "TimeoutExpired".to_string(),
            Error::LostRemote => "LostRemote".to_string(),
            Error::QueueOverflow => "QueueOverflow".to_string(),
            Error::NameError(_) => "NameError".to_string(),
            Error::Transport(_) => "TransportError".to_string(),
            Error::TransportClosed => "TransportClosed".to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
