//! Execution contexts
//!
//! A channel runs on two contexts. The ingest context receives transport
//! events, routes messages into stream queues and drives preemption timers.
//! The dispatch context owns the handlers and executes queued messages. Each
//! context is one tokio task; the marker below lets code assert where it runs.

use std::future::Future;

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// The two execution contexts of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// Transport events, routing and preemption bookkeeping
    Ingest,
    /// Handler execution
    Dispatch,
}

impl ExecutionContext {
    /// Context of the running task, if it was entered through [`scope`](Self::scope).
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|context| *context).ok()
    }

    /// Run `future` marked as executing on this context.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT.scope(self, future).await
    }

    /// Run `f` marked as executing on this context.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }

    /// Whether the caller runs on this context.
    #[must_use]
    pub fn is_current(self) -> bool {
        Self::current() == Some(self)
    }
}

/// Debug check that the caller is not on the wrong context. Code running
/// outside any marked context (direct calls from tests) passes.
pub(crate) fn debug_assert_context(expected: ExecutionContext) {
    debug_assert!(
        ExecutionContext::current().map_or(true, |current| current == expected),
        "expected to run on the {expected:?} context, running on {:?}",
        ExecutionContext::current()
    );
}
