//! Channel level error types.

use gpuchan_core::{Error, RouteId};
use thiserror::Error;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a command handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The GPU context backing the handler is gone
    #[error("GPU context lost")]
    ContextLost,

    /// The client sent a command the handler cannot execute
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The handler could not be created
    #[error("Handler creation failed: {0}")]
    Creation(String),
}

/// Conditions that tear the whole channel down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer closed the transport
    #[error("Transport closed")]
    TransportClosed,

    /// The transport reported a failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A handler hit an unrecoverable error
    #[error("Handler on route {route_id} failed: {source}")]
    Handler {
        route_id: RouteId,
        #[source]
        source: HandlerError,
    },

    /// The channel was shut down by its owner
    #[error("Channel shut down")]
    Shutdown,
}

impl From<HandlerError> for Error {
    fn from(err: HandlerError) -> Self {
        Error::Handler(err.to_string())
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::TransportClosed | ChannelError::Transport(_) => {
                Error::Transport(err.to_string())
            },
            ChannelError::Handler { .. } => Error::Handler(err.to_string()),
            ChannelError::Shutdown => Error::Protocol(err.to_string()),
        }
    }
}
