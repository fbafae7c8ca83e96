//! Wake signalling between producers and idle workers.
//!
//! A signal only shortens the wait; workers always wake after the poll
//! interval and try to claim anyway, so a lost signal costs latency, never work.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

/// Why a worker stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A producer signalled new work.
    Signalled,
    /// The poll interval elapsed.
    TimedOut,
}

/// Low-latency hint that work may be available.
#[async_trait]
pub trait WakeChannel: Send + Sync {
    /// Signal that new work may be available. Never blocks.
    fn notify(&self);

    /// Wait for a signal for at most `timeout`.
    async fn wait(&self, timeout: Duration) -> WakeReason;
}

/// In-process wake channel backed by [`tokio::sync::Notify`].
///
/// A signal sent while no worker waits is kept as a single permit and
/// consumed by the next waiter.
#[derive(Debug, Default)]
pub struct NotifyWake {
    notify: Notify,
}

impl NotifyWake {
    /// New channel with no pending permit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WakeChannel for NotifyWake {
    fn notify(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self, timeout: Duration) -> WakeReason {
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => WakeReason::Signalled,
            Err(_) => WakeReason::TimedOut,
        }
    }
}

/// Channel that never signals; workers fall back to pure polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollOnlyWake;

#[async_trait]
impl WakeChannel for PollOnlyWake {
    fn notify(&self) {}

    async fn wait(&self, timeout: Duration) -> WakeReason {
        tokio::time::sleep(timeout).await;
        WakeReason::TimedOut
    }
}
