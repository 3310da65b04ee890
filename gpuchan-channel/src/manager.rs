//! Channel manager
//!
//! Process-wide registry of spawned channels. It hands every channel the same
//! sync point manager and wires the single preemption flag: at most one
//! channel preempts, the preemptible ones yield while the flag is raised.

use crate::channel::{ChannelBuilder, ChannelHandle, ChannelStatus};
use crate::error::Result;
use crate::handler::HandlerFactory;
use crate::transport::{EventReceiver, Transport};
use dashmap::DashMap;
use parking_lot::Mutex;
use gpuchan_core::config::ConfigValidator;
use gpuchan_core::{ChannelConfig, ChannelId, Error, SyncPointManager};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// How a channel takes part in cross-channel preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PreemptionRole {
    /// Neither preempts nor yields
    #[default]
    None,
    /// Raises the shared flag while its default stream is starved
    Preempting,
    /// Yields dispatch turns while the shared flag is raised
    Preemptible,
}

impl fmt::Display for PreemptionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Preempting => write!(f, "preempting"),
            Self::Preemptible => write!(f, "preemptible"),
        }
    }
}

struct ManagedChannel {
    handle: ChannelHandle,
    role: PreemptionRole,
}

/// Registry of live channels sharing one configuration.
pub struct ChannelManager {
    config: ChannelConfig,
    sync_points: Arc<SyncPointManager>,
    preemption_flag: Arc<AtomicBool>,
    channels: Arc<DashMap<ChannelId, ManagedChannel>>,
    /// Serializes the preempting-role check with the registration it guards
    registration: Mutex<()>,
}

impl ChannelManager {
    /// Create a manager using the process-wide sync point manager.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        Self::with_sync_points(config, SyncPointManager::global())
    }

    /// Create a manager with its own sync point manager.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn with_sync_points(config: ChannelConfig, sync_points: Arc<SyncPointManager>) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        Ok(Self {
            config,
            sync_points,
            preemption_flag: Arc::new(AtomicBool::new(false)),
            channels: Arc::new(DashMap::new()),
            registration: Mutex::new(()),
        })
    }

    /// Builder for a channel wired into this manager's sync points and flag.
    pub fn builder(
        &self,
        transport: Arc<dyn Transport>,
        factory: impl HandlerFactory + 'static,
        role: PreemptionRole,
    ) -> ChannelBuilder {
        let builder = ChannelBuilder::new(transport, factory)
            .with_config(self.config.clone())
            .with_sync_points(Arc::clone(&self.sync_points));
        match role {
            PreemptionRole::None => builder,
            PreemptionRole::Preempting => builder.preempts(Arc::clone(&self.preemption_flag)),
            PreemptionRole::Preemptible => builder.preempted_by(Arc::clone(&self.preemption_flag)),
        }
    }

    /// Build and spawn a channel and register it.
    ///
    /// # Errors
    /// Returns a configuration error if a live channel already holds the
    /// preempting role.
    pub fn spawn_channel(
        &self,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        factory: impl HandlerFactory + 'static,
        role: PreemptionRole,
    ) -> Result<ChannelId> {
        let _registration = self.registration.lock();
        if role == PreemptionRole::Preempting && self.has_live_preempting_channel() {
            return Err(Error::Configuration("a preempting channel already exists".to_string()));
        }

        let handle = self.builder(transport, factory, role).build()?.spawn(events);
        let id = handle.id();
        self.channels.insert(id, ManagedChannel { handle, role });
        info!(channel = %id, %role, channels = self.channels.len(), "Channel registered");
        Ok(id)
    }

    fn has_live_preempting_channel(&self) -> bool {
        self.channels.iter().any(|entry| {
            entry.role == PreemptionRole::Preempting && !entry.handle.status().is_closed()
        })
    }

    /// Ask a channel to shut down. Returns `false` for unknown ids.
    pub fn shutdown_channel(&self, id: ChannelId) -> bool {
        match self.channels.get(&id) {
            Some(entry) => {
                entry.handle.shutdown();
                true
            },
            None => false,
        }
    }

    #[must_use]
    pub fn channel_status(&self, id: ChannelId) -> Option<ChannelStatus> {
        self.channels.get(&id).map(|entry| entry.handle.status())
    }

    /// Unregister a channel, returning its handle.
    #[must_use]
    pub fn remove_channel(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.channels.remove(&id).map(|(_, entry)| entry.handle)
    }

    /// Drop every closed channel. Returns how many were removed.
    pub fn remove_closed(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, entry| !entry.handle.status().is_closed());
        let removed = before.saturating_sub(self.channels.len());
        if removed > 0 {
            debug!(removed, "Removed closed channels");
        }
        removed
    }

    /// Shut every channel down and wait for its loops to exit.
    pub async fn shutdown_all(&self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.channels.remove(&id) {
                entry.handle.shutdown();
                handles.push(entry.handle);
            }
        }

        let count = handles.len();
        for handle in handles {
            handle.closed().await;
            handle.join().await;
        }
        self.preemption_flag.store(false, Ordering::Release);
        info!(channels = count, "All channels shut down");
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Flag shared by the preempting channel and the preemptible ones.
    #[must_use]
    pub fn preemption_flag(&self) -> &Arc<AtomicBool> {
        &self.preemption_flag
    }

    #[must_use]
    pub fn sync_points(&self) -> &Arc<SyncPointManager> {
        &self.sync_points
    }

    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.len())
            .field("preempting", &self.preemption_flag.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
