//! Transport seam
//!
//! The byte transport and its wire format live outside this crate. The channel
//! only needs to send whole messages out and receive [`ChannelEvent`]s in.

use crate::error::ChannelError;
use gpuchan_core::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of a channel's transport.
pub trait Transport: Send + Sync + 'static {
    /// Queue `message` for delivery to the client. Returns `false` if the
    /// transport is closed and the message was dropped.
    fn send(&self, message: Message) -> bool;
}

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A message from the client
    Message(Message),
    /// The transport failed
    Error(ChannelError),
    /// The client closed the transport
    Closed,
}

/// Sender side of the inbound event stream.
pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Receiver side of the inbound event stream, consumed by the ingest loop.
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// In-process transport delivering outbound messages to a [`MemoryPeer`].
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Stop delivering messages.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(%message, "Dropping message on closed transport");
            return false;
        }
        self.outbound.send(message).is_ok()
    }
}

/// Client end of an in-process transport.
#[derive(Debug)]
pub struct MemoryPeer {
    events: EventSender,
    inbound: mpsc::UnboundedReceiver<Message>,
}

impl MemoryPeer {
    /// Send a message to the channel.
    pub fn send(&self, message: Message) -> bool {
        self.events.send(ChannelEvent::Message(message)).is_ok()
    }

    /// Report a transport failure to the channel.
    pub fn fail(&self, error: ChannelError) -> bool {
        self.events.send(ChannelEvent::Error(error)).is_ok()
    }

    /// Close the transport from the client side.
    pub fn close(&self) -> bool {
        self.events.send(ChannelEvent::Closed).is_ok()
    }

    /// Next message sent by the channel.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Next message sent by the channel, if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.try_recv().ok()
    }

    /// Every message already sent by the channel.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create a connected in-process transport.
///
/// Returns the channel side transport, the client side peer and the event
/// receiver to hand to the channel's ingest loop.
#[must_use]
pub fn memory_pair() -> (Arc<MemoryTransport>, MemoryPeer, EventReceiver) {
    let (outbound, inbound) = mpsc::unbounded_channel();
    let (events, event_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport { outbound, closed: AtomicBool::new(false) });
    (transport, MemoryPeer { events, inbound }, event_rx)
}
