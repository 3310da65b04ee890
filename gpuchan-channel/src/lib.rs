//! # gpuchan channel
//!
//! Per-client GPU channel: ordered stream queues, cross-channel preemption,
//! ingest routing and handler dispatch.
//!
//! ## Architecture
//!
//! A channel runs on two tokio tasks. The ingest task receives transport
//! events and routes each message to the [`StreamMessageQueue`] its route maps
//! to. The dispatch task runs the [`ChannelController`], which executes queued
//! messages one at a time through [`CommandHandler`]s.
//!
//! - [`router`]: routing table, ingest filters and the ingest loop
//! - [`queue`]: per-stream FIFO with order tracking
//! - [`preemption`]: starvation detection for the default stream
//! - [`controller`]: streams, routes, handlers and the dispatch loop
//! - [`channel`]: wiring a channel together and spawning it
//! - [`manager`]: registry of live channels sharing one preemption flag
//!
//! ```rust,no_run
//! use gpuchan_channel::prelude::*;
//!
//! struct Echo;
//!
//! impl CommandHandler for Echo {
//!     fn handle(&mut self, message: &Message, cx: &mut HandlerContext<'_>) -> HandleOutcome {
//!         if message.is_sync() {
//!             cx.reply(Message::reply_to(message));
//!         }
//!         HandleOutcome::Completed
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl HandlerFactory for EchoFactory {
//!     fn create(
//!         &mut self,
//!         _params: &CreateCommandBufferParams,
//!         _reschedule: RescheduleHandle,
//!     ) -> Result<Box<dyn CommandHandler>, HandlerError> {
//!         Ok(Box::new(Echo))
//!     }
//! }
//!
//! # async fn run() -> gpuchan_core::Result<()> {
//! let (transport, peer, events) = memory_pair();
//! let handle = ChannelBuilder::new(transport, EchoFactory).build()?.spawn(events);
//! peer.send(Message::sync(RouteId::CONTROL, MessageKind::Nop, 1));
//! handle.shutdown();
//! handle.closed().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod channel;
pub mod context;
pub mod controller;
pub mod error;
pub mod handler;
pub mod manager;
pub mod metrics;
pub mod preemption;
pub mod queue;
pub mod router;
pub mod task;
pub mod transport;

mod timer;

pub use channel::{ChannelBuilder, ChannelHandle, ChannelStatus, GpuChannel};
pub use context::ExecutionContext;
pub use controller::{ChannelController, DispatchLoop, PREEMPTED_RETRY_DELAY};
pub use error::{ChannelError, HandlerError, Result};
pub use handler::{CommandHandler, HandleOutcome, HandlerContext, HandlerFactory, RescheduleHandle};
pub use manager::{ChannelManager, PreemptionRole};
pub use metrics::{ChannelMetrics, ChannelMetricsSnapshot, StreamMetrics, StreamMetricsSnapshot};
pub use preemption::{PreemptionMachine, PreemptionOutcome, PreemptionState, TimerCommand};
pub use queue::{PreemptionFlags, QueueServices, StreamMessageQueue};
pub use router::{ChannelRouter, IngestFilter, IngestLoop};
pub use task::{DispatchTask, IngestTask};
pub use transport::{memory_pair, ChannelEvent, MemoryPeer, MemoryTransport, Transport};

/// Commonly used types.
pub mod prelude {
    pub use crate::channel::{ChannelBuilder, ChannelHandle, ChannelStatus, GpuChannel};
    pub use crate::error::{ChannelError, HandlerError};
    pub use crate::handler::{
        CommandHandler, HandleOutcome, HandlerContext, HandlerFactory, RescheduleHandle,
    };
    pub use crate::manager::{ChannelManager, PreemptionRole};
    pub use crate::transport::{memory_pair, ChannelEvent, MemoryPeer, Transport};
    pub use gpuchan_core::{
        ChannelConfig, CreateCommandBufferParams, Message, MessageKind, RouteId, StreamId,
        StreamPriority,
    };
}
