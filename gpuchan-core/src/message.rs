//! Message model for the GPU channel.
//!
//! A [`Message`] is one request or reply travelling over a channel. Requests
//! accepted for a stream are wrapped in a [`MessageEnvelope`] carrying the
//! order number and arrival time used by scheduling and preemption.

use crate::types::{RouteId, StreamId, StreamPriority};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Parameters of a command buffer creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommandBufferParams {
    /// Route the new command buffer will receive messages on
    pub route_id: RouteId,
    /// Stream the command buffer is scheduled on
    pub stream_id: StreamId,
    /// Priority the stream is created with if it does not exist yet
    pub priority: StreamPriority,
    /// Existing command buffer whose context is shared, if any
    pub share_group: Option<RouteId>,
}

/// Message tag and typed parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ping answered directly on the ingest context
    Nop,
    /// Control request creating a command buffer route
    CreateCommandBuffer(CreateCommandBufferParams),
    /// Control request destroying a command buffer route
    DestroyCommandBuffer { route_id: RouteId },
    /// Flush of commands written into the shared ring buffer
    AsyncFlush { put_offset: u32, flush_id: u32 },
    /// Wait on a sync token before executing further commands
    WaitSyncToken { release_count: u64 },
    /// Block the client until the command buffer token is in range
    WaitForTokenInRange { start: i32, end: i32 },
    /// Block the client until the ring buffer get offset is in range
    WaitForGetOffsetInRange { start: i32, end: i32 },
    /// Opaque command executed by the route handler
    Command { opcode: u32 },
    /// Reply to an earlier request
    Reply,
}

impl MessageKind {
    /// Kinds that bypass the stream FIFO and run as soon as dispatch picks them up.
    #[must_use]
    pub const fn is_out_of_order(&self) -> bool {
        matches!(self, Self::WaitForTokenInRange { .. } | Self::WaitForGetOffsetInRange { .. })
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::CreateCommandBuffer(_) => "CreateCommandBuffer",
            Self::DestroyCommandBuffer { .. } => "DestroyCommandBuffer",
            Self::AsyncFlush { .. } => "AsyncFlush",
            Self::WaitSyncToken { .. } => "WaitSyncToken",
            Self::WaitForTokenInRange { .. } => "WaitForTokenInRange",
            Self::WaitForGetOffsetInRange { .. } => "WaitForGetOffsetInRange",
            Self::Command { .. } => "Command",
            Self::Reply => "Reply",
        }
    }
}

/// One request or reply on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Route the message is addressed to
    pub routing_id: RouteId,
    /// Tag and parameters
    pub kind: MessageKind,
    /// Present on blocking requests and on their replies
    pub sync_id: Option<u32>,
    /// Set on replies
    pub reply: bool,
    /// Set on replies reporting failure
    pub reply_error: bool,
    /// Set on messages that unblock a waiting peer
    pub unblock: bool,
    /// Opaque payload
    pub body: Bytes,
}

impl Message {
    /// Create an asynchronous request.
    #[must_use]
    pub fn new(routing_id: RouteId, kind: MessageKind) -> Self {
        Self {
            routing_id,
            kind,
            sync_id: None,
            reply: false,
            reply_error: false,
            unblock: false,
            body: Bytes::new(),
        }
    }

    /// Create a blocking request expecting exactly one reply.
    #[must_use]
    pub fn sync(routing_id: RouteId, kind: MessageKind, sync_id: u32) -> Self {
        Self { sync_id: Some(sync_id), ..Self::new(routing_id, kind) }
    }

    /// Create a control route request.
    #[must_use]
    pub fn control(kind: MessageKind) -> Self {
        Self::new(RouteId::CONTROL, kind)
    }

    /// Attach an opaque payload.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the sender blocks until it gets a reply. Replies carry the
    /// request's sync id but never expect an answer themselves.
    #[must_use]
    pub const fn is_sync(&self) -> bool {
        self.sync_id.is_some() && !self.reply
    }

    /// Whether this is a reply to an earlier request.
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.reply
    }

    /// Build a success reply to `request`.
    #[must_use]
    pub fn reply_to(request: &Message) -> Self {
        Self {
            routing_id: request.routing_id,
            kind: MessageKind::Reply,
            sync_id: request.sync_id,
            reply: true,
            reply_error: false,
            unblock: false,
            body: Bytes::new(),
        }
    }

    /// Build an error reply to `request`.
    #[must_use]
    pub fn error_reply_to(request: &Message) -> Self {
        Self { reply_error: true, ..Self::reply_to(request) }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind.name(), self.routing_id)?;
        if let Some(sync_id) = self.sync_id {
            write!(f, " sync={sync_id}")?;
        }
        Ok(())
    }
}

/// A request accepted for a stream, waiting in its FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    message: Message,
    order_number: u32,
    time_received: Instant,
}

impl MessageEnvelope {
    /// Wrap an accepted message.
    #[must_use]
    pub fn new(message: Message, order_number: u32, time_received: Instant) -> Self {
        Self { message, order_number, time_received }
    }

    /// The wrapped message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Order number assigned on acceptance.
    #[must_use]
    pub const fn order_number(&self) -> u32 {
        self.order_number
    }

    /// When the message was accepted.
    #[must_use]
    pub const fn time_received(&self) -> Instant {
        self.time_received
    }

    /// Unwrap into the message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }
}
