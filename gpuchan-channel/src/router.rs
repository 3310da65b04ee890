//! Channel router
//!
//! Entry point of every inbound message. Runs on the ingest context, answers
//! what it can inline, and pushes everything else into the stream queue its
//! route maps to.

use crate::channel::ChannelStatus;
use crate::context::{debug_assert_context, ExecutionContext};
use crate::error::ChannelError;
use crate::metrics::ChannelMetrics;
use crate::queue::StreamMessageQueue;
use crate::task::{DispatchPoster, DispatchTask, IngestTask};
use crate::transport::{ChannelEvent, EventReceiver, Transport};
use gpuchan_core::{ChannelId, Message, MessageKind, RouteId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Hook that sees every message before route lookup.
pub trait IngestFilter: Send + Sync {
    /// Return `true` to claim the message; it is then not routed.
    fn on_message_received(&self, message: &Message) -> bool;

    /// The channel is being torn down.
    fn on_channel_error(&self, _error: &ChannelError) {}

    fn on_filter_added(&self) {}

    fn on_filter_removed(&self) {}
}

/// Routing table and ingest filter of one channel.
pub struct ChannelRouter {
    channel_id: ChannelId,
    routes: RwLock<HashMap<RouteId, Arc<StreamMessageQueue>>>,
    filters: RwLock<Vec<Arc<dyn IngestFilter>>>,
    transport: Arc<dyn Transport>,
    dispatch: DispatchPoster,
    metrics: Arc<ChannelMetrics>,
}

impl ChannelRouter {
    #[must_use]
    pub fn new(
        channel_id: ChannelId,
        transport: Arc<dyn Transport>,
        dispatch: DispatchPoster,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        Self {
            channel_id,
            routes: RwLock::new(HashMap::new()),
            filters: RwLock::new(Vec::new()),
            transport,
            dispatch,
            metrics,
        }
    }

    /// Route an inbound message. Always returns `true`: every message is
    /// either answered here or handed to a stream.
    pub fn on_message_received(&self, message: Message) -> bool {
        debug_assert_context(ExecutionContext::Ingest);
        self.metrics.record_received();

        if message.reply || message.unblock {
            warn!(channel = %self.channel_id, %message, "Unexpected reply or unblock message");
            self.reject(&message);
            return true;
        }

        if matches!(message.kind, MessageKind::Nop) {
            if message.is_sync() {
                self.transport.send(Message::reply_to(&message));
            }
            self.metrics.record_nop();
            return true;
        }

        let claimed = {
            let filters = self.filters.read();
            filters.iter().any(|filter| filter.on_message_received(&message))
        };
        if claimed {
            trace!(channel = %self.channel_id, %message, "Message claimed by ingest filter");
            return true;
        }

        let queue = self.routes.read().get(&message.routing_id).cloned();
        let Some(queue) = queue else {
            debug!(channel = %self.channel_id, %message, "No route for message");
            self.reject(&message);
            return true;
        };

        if message.kind.is_out_of_order() {
            self.metrics.record_out_of_order();
        }

        if !queue.push_back(message.clone()) {
            debug!(channel = %self.channel_id, stream = %queue.stream_id(), %message, "Stream disabled");
            self.reject(&message);
        }
        true
    }

    fn reject(&self, message: &Message) {
        let error_replied = message.is_sync() && self.transport.send(Message::error_reply_to(message));
        self.metrics.record_rejected(error_replied);
    }

    /// Map `route_id` to `queue`, replacing any previous mapping.
    pub fn add_route(&self, route_id: RouteId, queue: Arc<StreamMessageQueue>) {
        trace!(channel = %self.channel_id, route = %route_id, stream = %queue.stream_id(), "Adding route");
        self.routes.write().insert(route_id, queue);
    }

    /// Drop the mapping of `route_id`.
    pub fn remove_route(&self, route_id: RouteId) -> Option<Arc<StreamMessageQueue>> {
        trace!(channel = %self.channel_id, route = %route_id, "Removing route");
        self.routes.write().remove(&route_id)
    }

    /// Drop every mapping.
    pub fn clear_routes(&self) {
        self.routes.write().clear();
    }

    #[must_use]
    pub fn has_route(&self, route_id: RouteId) -> bool {
        self.routes.read().contains_key(&route_id)
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn add_filter(&self, filter: Arc<dyn IngestFilter>) {
        filter.on_filter_added();
        self.filters.write().push(filter);
    }

    /// Remove `filter`; returns `false` if it was not registered.
    pub fn remove_filter(&self, filter: &Arc<dyn IngestFilter>) -> bool {
        let removed = {
            let mut filters = self.filters.write();
            let before = filters.len();
            filters.retain(|registered| !Arc::ptr_eq(registered, filter));
            before != filters.len()
        };
        if removed {
            filter.on_filter_removed();
        }
        removed
    }

    /// Report a fatal transport condition: filters are told first, then the
    /// dispatch context tears the channel down.
    pub fn on_channel_error(&self, error: ChannelError) {
        info!(channel = %self.channel_id, %error, "Channel error on ingest");
        for filter in self.filters.read().iter() {
            filter.on_channel_error(&error);
        }
        self.dispatch.post(DispatchTask::ChannelError(error));
    }

    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("channel_id", &self.channel_id)
            .field("routes", &self.route_count())
            .field("filters", &self.filters.read().len())
            .finish_non_exhaustive()
    }
}

/// Drives a channel's ingest context.
pub struct IngestLoop {
    router: Arc<ChannelRouter>,
    tasks: mpsc::UnboundedReceiver<IngestTask>,
    status: watch::Receiver<ChannelStatus>,
}

impl IngestLoop {
    pub(crate) fn new(
        router: Arc<ChannelRouter>,
        tasks: mpsc::UnboundedReceiver<IngestTask>,
        status: watch::Receiver<ChannelStatus>,
    ) -> Self {
        Self { router, tasks, status }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    /// Handle one transport event. Returns `false` when the transport is done.
    pub fn handle_event(&self, event: ChannelEvent) -> bool {
        ExecutionContext::Ingest.sync_scope(|| self.router_event(event))
    }

    /// Execute one ingest task.
    pub fn run_task(&self, task: IngestTask) {
        ExecutionContext::Ingest.sync_scope(|| task.run());
    }

    /// Execute every ingest task already posted. Returns how many ran.
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.tasks.try_recv() {
            self.run_task(task);
            count += 1;
        }
        count
    }

    /// Run until the transport closes or the channel is torn down.
    pub async fn run(mut self, mut events: EventReceiver) {
        info!(channel = %self.router.channel_id(), "Ingest loop started");
        ExecutionContext::Ingest
            .scope(async {
                loop {
                    tokio::select! {
                        biased;
                        changed = self.status.changed() => {
                            if changed.is_err() || self.status.borrow().is_closed() {
                                break;
                            }
                        },
                        Some(task) = self.tasks.recv() => task.run(),
                        event = events.recv() => {
                            let Some(event) = event else {
                                self.router.on_channel_error(ChannelError::TransportClosed);
                                break;
                            };
                            if !self.router_event(event) {
                                break;
                            }
                        },
                    }
                }
            })
            .await;
        info!(channel = %self.router.channel_id(), "Ingest loop stopped");
    }

    fn router_event(&self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Message(message) => self.router.on_message_received(message),
            ChannelEvent::Error(error) => {
                self.router.on_channel_error(error);
                false
            },
            ChannelEvent::Closed => {
                self.router.on_channel_error(ChannelError::TransportClosed);
                false
            },
        }
    }
}

impl fmt::Debug for IngestLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestLoop").field("router", &self.router).finish_non_exhaustive()
    }
}
