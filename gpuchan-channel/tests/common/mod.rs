//! Shared fixtures for channel integration tests.

#![allow(dead_code)]

use gpuchan_channel::{
    memory_pair, ChannelBuilder, CommandHandler, GpuChannel, HandleOutcome, HandlerContext,
    HandlerError, HandlerFactory, MemoryPeer, RescheduleHandle,
};
use gpuchan_channel::transport::EventReceiver;
use gpuchan_core::{
    CreateCommandBufferParams, Message, MessageKind, RouteId, StreamId, StreamPriority,
    SyncPointManager,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Outcomes and observations shared between a test and its handlers.
#[derive(Default)]
pub struct Script {
    outcomes: Mutex<HashMap<RouteId, VecDeque<HandleOutcome>>>,
    scheduled: Mutex<HashMap<RouteId, bool>>,
    reschedule: Mutex<HashMap<RouteId, RescheduleHandle>>,
    handled: Mutex<Vec<Message>>,
    completed: Mutex<Vec<Message>>,
    destroyed: Mutex<Vec<RouteId>>,
    fail_creation: Mutex<bool>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for the next calls on `route_id`. Unscripted calls complete.
    pub fn push_outcomes(&self, route_id: RouteId, outcomes: impl IntoIterator<Item = HandleOutcome>) {
        self.outcomes.lock().entry(route_id).or_default().extend(outcomes);
    }

    /// Flip the handler of `route_id` back to schedulable and notify the channel.
    pub fn reschedule(&self, route_id: RouteId) -> bool {
        self.scheduled.lock().insert(route_id, true);
        let handle = self.reschedule.lock().get(&route_id).cloned();
        handle.is_some_and(|handle| handle.reschedule(true))
    }

    pub fn fail_next_creation(&self) {
        *self.fail_creation.lock() = true;
    }

    /// Every message handed to a handler, including repeated turns.
    pub fn handled(&self) -> Vec<Message> {
        self.handled.lock().clone()
    }

    /// Messages whose handling completed, in completion order.
    pub fn completed(&self) -> Vec<Message> {
        self.completed.lock().clone()
    }

    pub fn completed_opcodes(&self, route_id: RouteId) -> Vec<u32> {
        self.completed
            .lock()
            .iter()
            .filter(|message| message.routing_id == route_id)
            .filter_map(|message| match message.kind {
                MessageKind::Command { opcode } => Some(opcode),
                _ => None,
            })
            .collect()
    }

    pub fn destroyed(&self) -> Vec<RouteId> {
        self.destroyed.lock().clone()
    }

    fn next_outcome(&self, route_id: RouteId) -> HandleOutcome {
        self.outcomes
            .lock()
            .get_mut(&route_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(HandleOutcome::Completed)
    }
}

/// Handler that follows its route's script and echoes sync messages on completion.
pub struct ScriptedHandler {
    route_id: RouteId,
    script: Arc<Script>,
}

impl CommandHandler for ScriptedHandler {
    fn is_scheduled(&self) -> bool {
        self.script.scheduled.lock().get(&self.route_id).copied().unwrap_or(true)
    }

    fn handle(&mut self, message: &Message, cx: &mut HandlerContext<'_>) -> HandleOutcome {
        self.script.handled.lock().push(message.clone());
        let outcome = self.script.next_outcome(self.route_id);
        match outcome {
            HandleOutcome::Completed => {
                self.script.completed.lock().push(message.clone());
                if message.is_sync() {
                    cx.reply(Message::reply_to(message));
                }
            },
            HandleOutcome::Deschedule => {
                self.script.scheduled.lock().insert(self.route_id, false);
            },
            _ => {},
        }
        outcome
    }

    fn on_destroy(&mut self) {
        self.script.destroyed.lock().push(self.route_id);
    }
}

pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: &Arc<Script>) -> Self {
        Self { script: Arc::clone(script) }
    }
}

impl HandlerFactory for ScriptedFactory {
    fn create(
        &mut self,
        params: &CreateCommandBufferParams,
        reschedule: RescheduleHandle,
    ) -> Result<Box<dyn CommandHandler>, HandlerError> {
        let fail = std::mem::take(&mut *self.script.fail_creation.lock());
        if fail {
            return Err(HandlerError::Creation("scripted failure".to_string()));
        }
        self.script.reschedule.lock().insert(params.route_id, reschedule);
        Ok(Box::new(ScriptedHandler { route_id: params.route_id, script: Arc::clone(&self.script) }))
    }
}

/// A channel driven by hand, plus its client end.
pub struct Harness {
    pub channel: GpuChannel,
    pub peer: MemoryPeer,
    pub events: EventReceiver,
    pub script: Arc<Script>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_builder(|builder| builder)
    }

    pub fn with_builder(configure: impl FnOnce(ChannelBuilder) -> ChannelBuilder) -> Self {
        let script = Script::new();
        let (transport, peer, events) = memory_pair();
        let builder = ChannelBuilder::new(transport, ScriptedFactory::new(&script))
            .with_sync_points(Arc::new(SyncPointManager::new()));
        let channel = configure(builder).build().expect("valid channel");
        Self { channel, peer, events, script }
    }

    /// Send a control request, run the channel and return its reply.
    pub fn control_request(&mut self, kind: MessageKind, sync_id: u32) -> Message {
        self.channel.deliver(Message::sync(RouteId::CONTROL, kind, sync_id));
        self.channel.run_until_idle();
        self.peer.try_recv().expect("control reply")
    }

    /// Create a command buffer through the control route and expect success.
    pub fn create_command_buffer(&mut self, route_id: RouteId, stream_id: StreamId) {
        let params = create_params(route_id, stream_id, StreamPriority::Normal);
        let reply =
            self.control_request(MessageKind::CreateCommandBuffer(params), route_id.value());
        assert!(reply.reply && !reply.reply_error, "create failed: {reply:?}");
    }

    /// Destroy a command buffer through the control route and return the reply.
    pub fn destroy_command_buffer(&mut self, route_id: RouteId) -> Message {
        self.control_request(MessageKind::DestroyCommandBuffer { route_id }, route_id.value())
    }

    pub fn send_command(&self, route_id: RouteId, opcode: u32) {
        self.channel.deliver(command(route_id, opcode));
    }
}

pub fn create_params(
    route_id: RouteId,
    stream_id: StreamId,
    priority: StreamPriority,
) -> CreateCommandBufferParams {
    CreateCommandBufferParams { route_id, stream_id, priority, share_group: None }
}

pub fn command(route_id: RouteId, opcode: u32) -> Message {
    Message::new(route_id, MessageKind::Command { opcode })
}

pub fn sync_command(route_id: RouteId, opcode: u32, sync_id: u32) -> Message {
    Message::sync(route_id, MessageKind::Command { opcode }, sync_id)
}
