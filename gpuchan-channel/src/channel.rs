//! Channel wiring
//!
//! [`ChannelBuilder`] assembles the router, controller and both execution
//! loops of one client channel. The resulting [`GpuChannel`] can be driven by
//! hand (tests, embedding) or spawned onto tokio, which yields a
//! [`ChannelHandle`].

use crate::controller::{ChannelController, DispatchLoop};
use crate::error::{ChannelError, Result};
use crate::handler::HandlerFactory;
use crate::metrics::{ChannelMetrics, ChannelMetricsSnapshot};
use crate::queue::{PreemptionFlags, QueueServices};
use crate::router::{ChannelRouter, IngestLoop};
use crate::task::{dispatch_channel, ingest_channel, DispatchPoster, DispatchTask};
use crate::transport::{ChannelEvent, EventReceiver, Transport};
use gpuchan_core::config::ConfigValidator;
use gpuchan_core::{ChannelConfig, ChannelId, Error, Message, SyncPointManager};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Lifecycle status of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Accepting and dispatching messages
    Open,
    /// Torn down; every stream is disabled
    Closed(ChannelError),
}

impl ChannelStatus {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Builder for a [`GpuChannel`].
pub struct ChannelBuilder {
    transport: Arc<dyn Transport>,
    factory: Box<dyn HandlerFactory>,
    config: ChannelConfig,
    sync_points: Option<Arc<SyncPointManager>>,
    flags: PreemptionFlags,
}

impl ChannelBuilder {
    pub fn new(transport: Arc<dyn Transport>, factory: impl HandlerFactory + 'static) -> Self {
        Self {
            transport,
            factory: Box::new(factory),
            config: ChannelConfig::default(),
            sync_points: None,
            flags: PreemptionFlags::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Share order numbers with other channels. Defaults to the process-wide manager.
    #[must_use]
    pub fn with_sync_points(mut self, sync_points: Arc<SyncPointManager>) -> Self {
        self.sync_points = Some(sync_points);
        self
    }

    /// Raise `flag` while this channel's default stream is starved.
    #[must_use]
    pub fn preempts(mut self, flag: Arc<AtomicBool>) -> Self {
        self.flags.preempting = Some(flag);
        self
    }

    /// Give up dispatch turns while `flag` is raised.
    #[must_use]
    pub fn preempted_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.flags.preempted = Some(flag);
        self
    }

    /// Validate the configuration and assemble the channel.
    ///
    /// # Errors
    /// Returns a configuration error if the config is invalid or the same
    /// flag was given for both preemption roles.
    pub fn build(self) -> Result<GpuChannel> {
        ConfigValidator::validate(&self.config)?;
        if let (Some(preempting), Some(preempted)) = (&self.flags.preempting, &self.flags.preempted) {
            if Arc::ptr_eq(preempting, preempted) {
                return Err(Error::Configuration(
                    "a channel cannot preempt and be preempted by the same flag".to_string(),
                ));
            }
        }

        let id = ChannelId::new();
        let (dispatch_poster, dispatch_rx) = dispatch_channel();
        let (ingest_poster, ingest_rx) = ingest_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Open);
        let metrics = Arc::new(ChannelMetrics::default());

        let router = Arc::new(ChannelRouter::new(
            id,
            Arc::clone(&self.transport),
            dispatch_poster.clone(),
            Arc::clone(&metrics),
        ));
        let services = QueueServices {
            dispatch: dispatch_poster.clone(),
            ingest: ingest_poster,
            transport: self.transport,
            sync_points: self.sync_points.unwrap_or_else(SyncPointManager::global),
            preemption: self.config.preemption,
            metrics: Arc::clone(&metrics),
        };
        let controller = ChannelController::new(
            id,
            self.config,
            services,
            Arc::clone(&router),
            self.factory,
            self.flags,
            status_tx,
        );

        info!(channel = %id, "Channel built");
        Ok(GpuChannel {
            id,
            ingest: IngestLoop::new(router, ingest_rx, status_rx.clone()),
            dispatch: DispatchLoop::new(controller, dispatch_rx),
            dispatch_poster,
            status: status_rx,
            metrics,
        })
    }
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("config", &self.config)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A fully wired channel whose loops have not been spawned.
#[derive(Debug)]
pub struct GpuChannel {
    id: ChannelId,
    ingest: IngestLoop,
    dispatch: DispatchLoop,
    dispatch_poster: DispatchPoster,
    status: watch::Receiver<ChannelStatus>,
    metrics: Arc<ChannelMetrics>,
}

impl GpuChannel {
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ChannelRouter> {
        self.ingest.router()
    }

    #[must_use]
    pub fn controller(&self) -> &ChannelController {
        self.dispatch.controller()
    }

    pub fn controller_mut(&mut self) -> &mut ChannelController {
        self.dispatch.controller_mut()
    }

    pub fn ingest_mut(&mut self) -> &mut IngestLoop {
        &mut self.ingest
    }

    pub fn dispatch_mut(&mut self) -> &mut DispatchLoop {
        &mut self.dispatch
    }

    /// Feed one inbound message through the router on the ingest context.
    pub fn deliver(&self, message: Message) -> bool {
        self.ingest.handle_event(ChannelEvent::Message(message))
    }

    /// Alternate both loops until neither makes progress. Returns how many
    /// tasks ran, not counting turns bounced off a preempted stream.
    pub fn run_until_idle(&mut self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.ingest.run_until_idle() + self.dispatch.run_until_idle();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    #[must_use]
    pub fn metrics(&self) -> ChannelMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Spawn both loops onto the current tokio runtime.
    #[must_use]
    pub fn spawn(self, events: EventReceiver) -> ChannelHandle {
        let Self { id, ingest, dispatch, dispatch_poster, status, metrics } = self;
        let ingest_task = tokio::spawn(ingest.run(events));
        let dispatch_task = tokio::spawn(dispatch.run());
        ChannelHandle { id, status, dispatch: dispatch_poster, metrics, ingest_task, dispatch_task }
    }
}

/// Handle to a spawned channel.
#[derive(Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    status: watch::Receiver<ChannelStatus>,
    dispatch: DispatchPoster,
    metrics: Arc<ChannelMetrics>,
    ingest_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl ChannelHandle {
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn metrics(&self) -> ChannelMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until the channel is closed and return the reason.
    pub async fn closed(&self) -> ChannelError {
        let mut status = self.status.clone();
        let result = status.wait_for(ChannelStatus::is_closed).await.map(|status| status.clone());
        match result {
            Ok(ChannelStatus::Closed(error)) => error,
            _ => ChannelError::Shutdown,
        }
    }

    /// Ask the dispatch context to tear the channel down.
    pub fn shutdown(&self) {
        self.dispatch.post(DispatchTask::ChannelError(ChannelError::Shutdown));
    }

    /// Wait for both loops to exit.
    pub async fn join(self) {
        let _ = self.dispatch_task.await;
        let _ = self.ingest_task.await;
    }
}
