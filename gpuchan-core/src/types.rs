//! Common identifier and priority types used throughout gpuchan.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Identifier of a logical command stream, unique within one channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamId(pub u32);

impl StreamId {
    /// The default stream. It carries the control route and is the only
    /// stream allowed to own a preempting flag.
    pub const DEFAULT: StreamId = StreamId(0);

    /// Create a new stream ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw stream ID value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this is the default (control) stream.
    #[must_use]
    pub const fn is_default(self) -> bool {
        self.0 == Self::DEFAULT.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Routing identifier carried by every message, mapping it to one handler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RouteId(pub u32);

impl RouteId {
    /// Route of channel-level control messages, handled by the controller itself.
    pub const CONTROL: RouteId = RouteId(u32::MAX);

    /// Create a new route ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw route ID value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this is the control route.
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.0 == Self::CONTROL.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "control")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for RouteId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Unique identifier for a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Generate a new unique channel ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static SEQUENCE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-wide identifier of one order tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Generate a new unique sequence ID.
    #[must_use]
    pub fn next() -> Self {
        Self(SEQUENCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw sequence ID value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Stream priorities, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StreamPriority {
    /// Background work such as offscreen compute
    Low = 0,
    /// Regular client rendering
    Normal = 1,
    /// Latency sensitive work; used by the control stream
    High = 2,
    /// Real-time media, only on channels that allow it
    RealTime = 3,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for StreamPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::RealTime => write!(f, "real_time"),
        }
    }
}
