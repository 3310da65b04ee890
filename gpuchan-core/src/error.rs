//! Error types for the gpuchan core library.

use crate::types::{RouteId, SequenceId, StreamId};
use thiserror::Error;

/// Main error type for gpuchan operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A message violated the channel protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The underlying transport failed or was closed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Stream lifecycle errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Route table errors
    #[error("Route error: {0}")]
    Route(String),

    /// A command handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Order number tracking errors
    #[error(transparent)]
    Order(#[from] OrderError),

    /// File system errors while reading configuration
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for gpuchan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while waiting on order numbers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderError {
    /// The order number has not been handed out yet by any stream
    #[error("Order number {order_number} has not been issued (latest: {latest})")]
    NotIssued { order_number: u32, latest: u32 },

    /// The tracker was destroyed before the wait completed
    #[error("Order tracker {sequence_id} was destroyed")]
    Destroyed { sequence_id: SequenceId },

    /// No tracker is registered for the sequence
    #[error("Unknown order sequence {sequence_id}")]
    UnknownSequence { sequence_id: SequenceId },
}

/// Stream and route bookkeeping errors raised by the channel controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Route already exists: {route_id}")]
    RouteExists { route_id: RouteId },

    #[error("Route not found: {route_id}")]
    RouteNotFound { route_id: RouteId },

    #[error("Stream not found: {stream_id}")]
    StreamNotFound { stream_id: StreamId },

    #[error("Share group {share_group} is on stream {expected}, not {requested}")]
    ShareGroupStreamMismatch { share_group: RouteId, expected: StreamId, requested: StreamId },

    #[error("Unknown share group: {share_group}")]
    UnknownShareGroup { share_group: RouteId },

    #[error("Real-time stream priority not allowed on this channel")]
    RealTimeNotAllowed,

    #[error("Handler for route {route_id} could not be created: {reason}")]
    HandlerCreation { route_id: RouteId, reason: String },
}

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::StreamNotFound { .. } => Error::Stream(err.to_string()),
            RouteError::RealTimeNotAllowed => Error::Stream(err.to_string()),
            RouteError::HandlerCreation { .. } => Error::Handler(err.to_string()),
            _ => Error::Route(err.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}
