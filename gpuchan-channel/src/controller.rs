//! Channel controller
//!
//! Owns every stream queue and handler of one client connection and runs on
//! the dispatch context. Streams are created on demand by command buffer
//! creation and destroyed when their last route goes away.

use crate::channel::ChannelStatus;
use crate::context::{debug_assert_context, ExecutionContext};
use crate::error::ChannelError;
use crate::handler::{CommandHandler, HandleOutcome, HandlerContext, HandlerFactory, RescheduleHandle};
use crate::queue::{PreemptionFlags, QueueServices, StreamMessageQueue};
use crate::router::ChannelRouter;
use crate::task::DispatchTask;
use gpuchan_core::{
    ChannelConfig, ChannelId, CreateCommandBufferParams, Message, MessageKind, RouteError,
    RouteId, StreamId, StreamPriority,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Per-channel owner of streams, routes and handlers.
pub struct ChannelController {
    channel_id: ChannelId,
    config: ChannelConfig,
    services: QueueServices,
    router: Arc<ChannelRouter>,
    factory: Box<dyn HandlerFactory>,
    streams: HashMap<StreamId, Arc<StreamMessageQueue>>,
    stream_routes: HashMap<StreamId, usize>,
    route_streams: HashMap<RouteId, StreamId>,
    handlers: HashMap<RouteId, Box<dyn CommandHandler>>,
    preempting: Option<Arc<AtomicBool>>,
    preempted: Option<Arc<AtomicBool>>,
    status: watch::Sender<ChannelStatus>,
    closed: bool,
}

impl ChannelController {
    /// Create the controller with its control stream and control route.
    pub(crate) fn new(
        channel_id: ChannelId,
        config: ChannelConfig,
        services: QueueServices,
        router: Arc<ChannelRouter>,
        factory: Box<dyn HandlerFactory>,
        flags: PreemptionFlags,
        status: watch::Sender<ChannelStatus>,
    ) -> Self {
        let mut controller = Self {
            channel_id,
            config,
            services,
            router,
            factory,
            streams: HashMap::new(),
            stream_routes: HashMap::new(),
            route_streams: HashMap::new(),
            handlers: HashMap::new(),
            preempting: flags.preempting,
            preempted: flags.preempted,
            status,
            closed: false,
        };

        let control = controller.create_stream(StreamId::DEFAULT, StreamPriority::High);
        controller.route_streams.insert(RouteId::CONTROL, StreamId::DEFAULT);
        controller.stream_routes.insert(StreamId::DEFAULT, 1);
        controller.router.add_route(RouteId::CONTROL, control);

        info!(channel = %channel_id, "Channel controller created");
        controller
    }

    /// Create a stream queue.
    ///
    /// The default stream raises the channel's preempting flag; every stream
    /// observes the preempted flag. Panics if `stream_id` already exists.
    pub fn create_stream(
        &mut self,
        stream_id: StreamId,
        priority: StreamPriority,
    ) -> Arc<StreamMessageQueue> {
        assert!(!self.streams.contains_key(&stream_id), "stream {stream_id} already exists");

        let flags = PreemptionFlags {
            preempting: if stream_id.is_default() { self.preempting.clone() } else { None },
            preempted: self.preempted.clone(),
        };
        let queue = StreamMessageQueue::new(stream_id, priority, self.services.clone(), flags);
        self.streams.insert(stream_id, Arc::clone(&queue));
        self.stream_routes.entry(stream_id).or_insert(0);
        self.services.metrics.record_stream_created();
        debug!(channel = %self.channel_id, stream = %stream_id, %priority, "Stream created");
        queue
    }

    /// Register `handler` for `route_id` on an existing stream.
    ///
    /// # Errors
    /// [`RouteError::RouteExists`] if the route is taken and
    /// [`RouteError::StreamNotFound`] if the stream does not exist.
    pub fn add_route(
        &mut self,
        route_id: RouteId,
        stream_id: StreamId,
        handler: Box<dyn CommandHandler>,
    ) -> Result<(), RouteError> {
        if self.route_streams.contains_key(&route_id) {
            return Err(RouteError::RouteExists { route_id });
        }
        let queue = self
            .streams
            .get(&stream_id)
            .cloned()
            .ok_or(RouteError::StreamNotFound { stream_id })?;

        self.handlers.insert(route_id, handler);
        self.route_streams.insert(route_id, stream_id);
        *self.stream_routes.entry(stream_id).or_insert(0) += 1;
        self.router.add_route(route_id, queue);
        debug!(channel = %self.channel_id, route = %route_id, stream = %stream_id, "Route added");
        Ok(())
    }

    /// Remove a route and its handler, destroying the stream if this was its
    /// last route.
    ///
    /// # Errors
    /// [`RouteError::RouteNotFound`] if the route does not exist.
    pub fn remove_route(&mut self, route_id: RouteId) -> Result<(), RouteError> {
        if route_id.is_control() {
            return Err(RouteError::RouteNotFound { route_id });
        }
        let stream_id =
            self.route_streams.remove(&route_id).ok_or(RouteError::RouteNotFound { route_id })?;

        self.router.remove_route(route_id);
        if let Some(mut handler) = self.handlers.remove(&route_id) {
            handler.on_destroy();
        }
        if let Some(count) = self.stream_routes.get_mut(&stream_id) {
            *count = count.saturating_sub(1);
        }
        debug!(channel = %self.channel_id, route = %route_id, stream = %stream_id, "Route removed");
        self.destroy_stream_if_unreferenced(stream_id);
        Ok(())
    }

    /// Disable and drop `stream_id` if no route references it.
    pub fn destroy_stream_if_unreferenced(&mut self, stream_id: StreamId) {
        if self.stream_routes.get(&stream_id).copied().unwrap_or(0) > 0 {
            return;
        }
        self.stream_routes.remove(&stream_id);
        if let Some(queue) = self.streams.remove(&stream_id) {
            queue.disable();
            self.services.metrics.record_stream_destroyed();
            debug!(channel = %self.channel_id, stream = %stream_id, "Stream destroyed");
        }
    }

    /// Post a dispatch turn for `stream_id`.
    pub fn post_handle_message(&self, stream_id: StreamId) {
        if let Some(queue) = self.streams.get(&stream_id) {
            queue.post_handle_message();
        }
    }

    /// Run one dispatch task. Returns `false` if the task only bounced off a
    /// preempted stream.
    pub fn run_task(&mut self, task: DispatchTask) -> bool {
        debug_assert_context(ExecutionContext::Dispatch);
        match task {
            DispatchTask::HandleMessage(stream_id) => self.handle_message(stream_id),
            DispatchTask::HandleOutOfOrder(message) => {
                self.handle_out_of_order_message(&message);
                true
            },
            DispatchTask::StreamRescheduled { stream_id, scheduled } => {
                self.on_stream_rescheduled(stream_id, scheduled);
                true
            },
            DispatchTask::ChannelError(error) => {
                self.on_channel_error(error);
                true
            },
        }
    }

    /// Run the head message of `stream_id`.
    ///
    /// Returns `false` if the stream gave up its turn to a preempting channel.
    pub fn handle_message(&mut self, stream_id: StreamId) -> bool {
        let Some(queue) = self.streams.get(&stream_id).cloned() else {
            trace!(channel = %self.channel_id, stream = %stream_id, "Turn for destroyed stream");
            return true;
        };
        let Some(envelope) = queue.begin_message_processing() else {
            if queue.is_preempted() {
                self.services.metrics.record_preempted_turn();
                return false;
            }
            return true;
        };

        let message = envelope.message();
        let route_id = message.routing_id;
        trace!(
            channel = %self.channel_id,
            stream = %stream_id,
            order_number = envelope.order_number(),
            %message,
            "Dispatching message"
        );

        let outcome = if route_id.is_control() {
            self.handle_control_message(message)
        } else {
            self.dispatch_to_handler(route_id, stream_id, message)
        };

        match outcome {
            HandleOutcome::Completed => {
                let (pending, scheduled) = self
                    .handlers
                    .get(&route_id)
                    .map_or((false, true), |h| (h.has_unprocessed_commands(), h.is_scheduled()));
                if !scheduled {
                    queue.on_rescheduled(false);
                }
                if pending || !scheduled {
                    queue.pause_message_processing();
                } else {
                    queue.finish_message_processing();
                }
            },
            HandleOutcome::Unhandled => {
                debug!(channel = %self.channel_id, %message, "Unhandled message");
                if message.is_sync() {
                    self.send_error_reply(message);
                }
                queue.finish_message_processing();
            },
            HandleOutcome::Yield => queue.pause_message_processing(),
            HandleOutcome::Deschedule => {
                queue.on_rescheduled(false);
                queue.pause_message_processing();
            },
            HandleOutcome::Fatal(source) => {
                // The head is still queued; disabling the stream answers it.
                error!(channel = %self.channel_id, route = %route_id, error = %source, "Handler failed");
                self.on_channel_error(ChannelError::Handler { route_id, source });
            },
        }
        true
    }

    /// Run a message that bypassed its stream FIFO.
    pub fn handle_out_of_order_message(&mut self, message: &Message) {
        let route_id = message.routing_id;
        let Some(&stream_id) = self.route_streams.get(&route_id) else {
            if message.is_sync() {
                self.send_error_reply(message);
            }
            return;
        };

        match self.dispatch_to_handler(route_id, stream_id, message) {
            HandleOutcome::Unhandled => {
                if message.is_sync() {
                    self.send_error_reply(message);
                }
            },
            HandleOutcome::Fatal(source) => {
                if message.is_sync() {
                    self.send_error_reply(message);
                }
                self.on_channel_error(ChannelError::Handler { route_id, source });
            },
            HandleOutcome::Completed | HandleOutcome::Yield | HandleOutcome::Deschedule => {},
        }
    }

    fn dispatch_to_handler(
        &mut self,
        route_id: RouteId,
        stream_id: StreamId,
        message: &Message,
    ) -> HandleOutcome {
        let Some(handler) = self.handlers.get_mut(&route_id) else {
            return HandleOutcome::Unhandled;
        };
        let mut cx = HandlerContext::new(route_id, stream_id, self.services.transport.as_ref());
        handler.handle(message, &mut cx)
    }

    fn handle_control_message(&mut self, message: &Message) -> HandleOutcome {
        let result = match &message.kind {
            MessageKind::CreateCommandBuffer(params) => self.create_command_buffer(params),
            MessageKind::DestroyCommandBuffer { route_id } => self.destroy_command_buffer(*route_id),
            _ => return HandleOutcome::Unhandled,
        };

        match result {
            Ok(()) => {
                if message.is_sync() {
                    self.services.transport.send(Message::reply_to(message));
                }
            },
            Err(err) => {
                warn!(channel = %self.channel_id, %message, error = %err, "Control request failed");
                if message.is_sync() {
                    self.send_error_reply(message);
                }
            },
        }
        HandleOutcome::Completed
    }

    /// Create a command buffer route, creating its stream if needed.
    ///
    /// # Errors
    /// Fails if the share group is unknown or on another stream, if a
    /// real-time stream is requested without permission, if the route is
    /// taken, or if the handler factory fails.
    pub fn create_command_buffer(
        &mut self,
        params: &CreateCommandBufferParams,
    ) -> Result<(), RouteError> {
        let stream_id = params.stream_id;

        if let Some(share_group) = params.share_group {
            let expected = self
                .handlers
                .contains_key(&share_group)
                .then(|| self.route_streams.get(&share_group).copied())
                .flatten()
                .ok_or(RouteError::UnknownShareGroup { share_group })?;
            if expected != stream_id {
                return Err(RouteError::ShareGroupStreamMismatch {
                    share_group,
                    expected,
                    requested: stream_id,
                });
            }
        }

        if params.priority == StreamPriority::RealTime
            && !self.config.streams.allow_real_time_streams
        {
            return Err(RouteError::RealTimeNotAllowed);
        }

        if self.route_streams.contains_key(&params.route_id) {
            return Err(RouteError::RouteExists { route_id: params.route_id });
        }

        if !self.streams.contains_key(&stream_id) {
            self.create_stream(stream_id, params.priority);
        }

        let reschedule = RescheduleHandle::new(stream_id, self.services.dispatch.clone());
        let handler = match self.factory.create(params, reschedule) {
            Ok(handler) => handler,
            Err(err) => {
                self.destroy_stream_if_unreferenced(stream_id);
                return Err(RouteError::HandlerCreation {
                    route_id: params.route_id,
                    reason: err.to_string(),
                });
            },
        };

        if let Err(err) = self.add_route(params.route_id, stream_id, handler) {
            self.destroy_stream_if_unreferenced(stream_id);
            return Err(err);
        }
        info!(channel = %self.channel_id, route = %params.route_id, stream = %stream_id, "Command buffer created");
        Ok(())
    }

    /// Destroy a command buffer route.
    ///
    /// # Errors
    /// [`RouteError::RouteNotFound`] if the route does not exist.
    pub fn destroy_command_buffer(&mut self, route_id: RouteId) -> Result<(), RouteError> {
        let descheduled = self.handlers.get(&route_id).is_some_and(|handler| !handler.is_scheduled());
        if descheduled {
            if let Some(&stream_id) = self.route_streams.get(&route_id) {
                self.on_stream_rescheduled(stream_id, true);
            }
        }
        self.remove_route(route_id)?;
        info!(channel = %self.channel_id, route = %route_id, "Command buffer destroyed");
        Ok(())
    }

    /// Forward a schedulability change to the stream.
    pub fn on_stream_rescheduled(&mut self, stream_id: StreamId, scheduled: bool) {
        if let Some(queue) = self.streams.get(&stream_id) {
            queue.on_rescheduled(scheduled);
        }
    }

    /// Tear the channel down: disable every stream, drop every handler and
    /// route, clear the preempting flag and publish the closed status.
    /// Later calls do nothing.
    pub fn on_channel_error(&mut self, error: ChannelError) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.services.metrics.record_channel_error();
        if matches!(error, ChannelError::Shutdown | ChannelError::TransportClosed) {
            info!(channel = %self.channel_id, %error, "Closing channel");
        } else {
            error!(channel = %self.channel_id, %error, "Closing channel after error");
        }

        self.router.clear_routes();
        for (route_id, mut handler) in self.handlers.drain() {
            trace!(channel = %self.channel_id, route = %route_id, "Destroying handler");
            handler.on_destroy();
        }
        let mut streams: Vec<_> = self.streams.drain().collect();
        streams.sort_by_key(|(stream_id, _)| *stream_id);
        for (_, queue) in streams {
            queue.disable();
            self.services.metrics.record_stream_destroyed();
        }
        self.route_streams.clear();
        self.stream_routes.clear();

        if let Some(flag) = &self.preempting {
            flag.store(false, Ordering::Release);
        }
        self.status.send_replace(ChannelStatus::Closed(error));
    }

    fn send_error_reply(&self, message: &Message) {
        self.services.transport.send(Message::error_reply_to(message));
        self.services.metrics.record_error_reply();
    }

    /// Highest order number finished by any live stream.
    #[must_use]
    pub fn processed_order_num(&self) -> u32 {
        self.streams.values().map(|queue| queue.order_watcher().processed()).max().unwrap_or(0)
    }

    /// Highest order number handed out by any live stream.
    #[must_use]
    pub fn unprocessed_order_num(&self) -> u32 {
        self.streams.values().map(|queue| queue.order_watcher().unprocessed()).max().unwrap_or(0)
    }

    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    #[must_use]
    pub fn stream(&self, stream_id: StreamId) -> Option<&Arc<StreamMessageQueue>> {
        self.streams.get(&stream_id)
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Number of routes on `stream_id`, counting the control route.
    #[must_use]
    pub fn route_count(&self, stream_id: StreamId) -> usize {
        self.stream_routes.get(&stream_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn has_route(&self, route_id: RouteId) -> bool {
        self.route_streams.contains_key(&route_id)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }
}

impl Drop for ChannelController {
    fn drop(&mut self) {
        self.on_channel_error(ChannelError::Shutdown);
    }
}

impl fmt::Debug for ChannelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelController")
            .field("channel_id", &self.channel_id)
            .field("streams", &self.streams.len())
            .field("routes", &self.route_streams.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Back-off before a preempted stream retries its dispatch turn.
pub const PREEMPTED_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Drives a channel's dispatch context.
pub struct DispatchLoop {
    controller: ChannelController,
    tasks: mpsc::UnboundedReceiver<DispatchTask>,
}

impl DispatchLoop {
    pub(crate) fn new(
        controller: ChannelController,
        tasks: mpsc::UnboundedReceiver<DispatchTask>,
    ) -> Self {
        Self { controller, tasks }
    }

    #[must_use]
    pub fn controller(&self) -> &ChannelController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ChannelController {
        &mut self.controller
    }

    /// Run one dispatch task on the dispatch context.
    pub fn run_task(&mut self, task: DispatchTask) -> bool {
        let controller = &mut self.controller;
        ExecutionContext::Dispatch.sync_scope(|| controller.run_task(task))
    }

    /// Run posted tasks in rounds until none are left, or until a whole round
    /// only bounced off preempted streams. Returns how many tasks made
    /// progress; bounced turns stay posted and are not counted.
    pub fn run_until_idle(&mut self) -> usize {
        let mut progressed = 0;
        loop {
            let round: Vec<DispatchTask> = std::iter::from_fn(|| self.tasks.try_recv().ok()).collect();
            if round.is_empty() {
                return progressed;
            }

            let before = progressed;
            for task in round {
                if self.run_task(task) {
                    progressed += 1;
                }
            }
            if progressed == before {
                return progressed;
            }
        }
    }

    /// Run until the channel closes, yielding to the runtime between tasks.
    ///
    /// A turn bounced off a preempted stream is retried after
    /// [`PREEMPTED_RETRY_DELAY`], so a preempted channel does not spin while
    /// the preempting one holds the flag.
    pub async fn run(mut self) {
        info!(channel = %self.controller.channel_id(), "Dispatch loop started");
        ExecutionContext::Dispatch
            .scope(async {
                while let Some(task) = self.tasks.recv().await {
                    let progressed = self.controller.run_task(task);
                    if self.controller.is_closed() {
                        break;
                    }
                    if progressed {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(PREEMPTED_RETRY_DELAY).await;
                    }
                }
            })
            .await;
        info!(channel = %self.controller.channel_id(), "Dispatch loop stopped");
    }
}

impl fmt::Debug for DispatchLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchLoop").field("controller", &self.controller).finish_non_exhaustive()
    }
}
