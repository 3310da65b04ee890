//! # gpuchan core
//!
//! Foundational types for the gpuchan channel scheduler: identifiers and
//! stream priorities, the channel message model, per-stream order number
//! tracking, the process-wide sync point manager, layered configuration and
//! tracing setup.
//!
//! ## Architecture
//!
//! - [`types`]: stream, route, channel and sequence identifiers; stream priorities
//! - [`message`]: messages, replies and the queued message envelope
//! - [`order`]: order number generation, tracking and waiting
//! - [`sync_point`]: registry of order trackers sharing one generator
//! - [`config`]: configuration schema, loading and validation
//! - [`telemetry`]: tracing subscriber setup
//! - [`error`]: error types and result handling
//!
//! ```rust
//! use gpuchan_core::{Message, MessageKind, RouteId};
//!
//! let request = Message::sync(RouteId::new(1), MessageKind::Command { opcode: 4 }, 9);
//! let reply = Message::error_reply_to(&request);
//! assert!(reply.reply_error);
//! assert_eq!(reply.sync_id, Some(9));
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod order;
pub mod prelude;
pub mod sync_point;
pub mod telemetry;
pub mod types;

pub use config::{ChannelConfig, ConfigLoader, LoggingConfig, PreemptionConfig, StreamConfig};
pub use error::{Error, OrderError, Result, RouteError};
pub use message::{CreateCommandBufferParams, Message, MessageEnvelope, MessageKind};
pub use order::{OrderNumberGenerator, OrderTracker, OrderWatcher};
pub use sync_point::SyncPointManager;
pub use types::{ChannelId, RouteId, SequenceId, StreamId, StreamPriority};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
