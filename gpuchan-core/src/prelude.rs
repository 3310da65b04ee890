//! # Prelude
//!
//! Commonly used types of the gpuchan core library.

pub use crate::{
    config::{ChannelConfig, PreemptionConfig},
    error::{Error, OrderError, Result, RouteError},
    message::{CreateCommandBufferParams, Message, MessageEnvelope, MessageKind},
    order::{OrderTracker, OrderWatcher},
    sync_point::SyncPointManager,
    types::{ChannelId, RouteId, SequenceId, StreamId, StreamPriority},
};

pub use bytes::Bytes;
