//! Cooperative cancellation signal shared by a stage and its worker task.
//!
//! A [`StopNotifier`] is a three-state latch backed by a
//! [`tokio::sync::watch`] channel:
//!
//! ```text
//! Running ──request_stop()──► StopRequested ──notify_stop()──► Stopped
//!    └──────────────────────notify_stop()───────────────────────┘
//! ```
//!
//! Transitions only move forward, and every transition method is safe to call
//! any number of times. Clones share the same state, so the stage's `close()`
//! and its worker loop can each hold one, and any number of tasks can await
//! [`requested`](StopNotifier::requested) or [`done`](StopNotifier::done)
//! concurrently.

use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle state of a [`StopNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopState {
    Running,
    StopRequested,
    Stopped,
}

/// Idempotent, multi-observer stop signal.
#[derive(Debug, Clone)]
pub struct StopNotifier {
    tx: Arc<watch::Sender<StopState>>,
}

impl StopNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StopState::Running);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn state(&self) -> StopState {
        *self.tx.borrow()
    }

    /// Ask the worker to stop. Returns `true` only for the call that moved the
    /// state out of `Running`.
    pub fn request_stop(&self) -> bool {
        self.advance(StopState::StopRequested)
    }

    /// Mark the notifier stopped. Returns `true` only for the first call.
    pub fn notify_stop(&self) -> bool {
        self.advance(StopState::Stopped)
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.state() >= StopState::StopRequested
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state() == StopState::Stopped
    }

    /// Resolves once a stop has been requested (or the notifier is stopped).
    ///
    /// This is the future worker loops race against their blocking waits.
    pub async fn requested(&self) {
        self.wait_for(StopState::StopRequested).await;
    }

    /// Resolves once the notifier reaches `Stopped`.
    pub async fn done(&self) {
        self.wait_for(StopState::Stopped).await;
    }

    fn advance(&self, to: StopState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    async fn wait_for(&self, at_least: StopState) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state >= at_least).await;
    }
}

impl Default for StopNotifier {
    fn default() -> Self {
        Self::new()
    }
}
