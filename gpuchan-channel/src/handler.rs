//! Handler seam
//!
//! Command execution lives outside this crate. The controller drives one
//! [`CommandHandler`] per command buffer route and creates them through a
//! [`HandlerFactory`] when the client asks for a new command buffer.

use crate::error::HandlerError;
use crate::task::{DispatchPoster, DispatchTask};
use crate::transport::Transport;
use gpuchan_core::{CreateCommandBufferParams, Message, RouteId, StreamId};

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The message is done; the stream advances
    Completed,
    /// The message needs another turn; the head stays queued
    Yield,
    /// The handler cannot proceed until it reschedules itself
    Deschedule,
    /// The handler does not understand the message
    Unhandled,
    /// Unrecoverable failure; the channel is torn down
    Fatal(HandlerError),
}

/// Per-call context handed to a handler.
pub struct HandlerContext<'a> {
    route_id: RouteId,
    stream_id: StreamId,
    transport: &'a dyn Transport,
    replied: bool,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(route_id: RouteId, stream_id: StreamId, transport: &'a dyn Transport) -> Self {
        Self { route_id, stream_id, transport, replied: false }
    }

    #[must_use]
    pub fn route_id(&self) -> RouteId {
        self.route_id
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Send a reply to the client.
    pub fn reply(&mut self, message: Message) -> bool {
        self.replied = true;
        self.transport.send(message)
    }

    /// Whether the handler already replied during this call.
    #[must_use]
    pub fn has_replied(&self) -> bool {
        self.replied
    }
}

/// Executes messages for one command buffer route.
pub trait CommandHandler: Send {
    /// Whether the handler can currently make progress.
    fn is_scheduled(&self) -> bool {
        true
    }

    /// Whether work from the last message is still outstanding. A completed
    /// message with outstanding work is handled again on the next turn.
    fn has_unprocessed_commands(&self) -> bool {
        false
    }

    /// Execute `message`.
    fn handle(&mut self, message: &Message, cx: &mut HandlerContext<'_>) -> HandleOutcome;

    /// Called once when the route is removed or the channel closes.
    fn on_destroy(&mut self) {}
}

/// Creates handlers for new command buffer routes.
pub trait HandlerFactory: Send {
    /// Create the handler for `params.route_id`.
    ///
    /// # Errors
    /// Returns a [`HandlerError`] if the command buffer cannot be created; the
    /// client gets an error reply.
    fn create(
        &mut self,
        params: &CreateCommandBufferParams,
        reschedule: RescheduleHandle,
    ) -> Result<Box<dyn CommandHandler>, HandlerError>;
}

/// Lets a handler report schedulability changes from any thread.
#[derive(Debug, Clone)]
pub struct RescheduleHandle {
    stream_id: StreamId,
    dispatch: DispatchPoster,
}

impl RescheduleHandle {
    pub(crate) fn new(stream_id: StreamId, dispatch: DispatchPoster) -> Self {
        Self { stream_id, dispatch }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Mark the stream schedulable or not. Returns `false` once the channel is gone.
    pub fn reschedule(&self, scheduled: bool) -> bool {
        self.dispatch.post(DispatchTask::StreamRescheduled { stream_id: self.stream_id, scheduled })
    }
}
