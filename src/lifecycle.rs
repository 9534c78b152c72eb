//! Consumer lifecycle state machine
//!
//! ```text
//! Starting ──► Running ──► Draining ──► Stopped
//!     │                        ▲           ▲
//!     └────────────────────────┘           │
//!   (any state) ───────────────────────────┘  fatal failure
//! ```
//!
//! `Stopped` is terminal.

use crate::error::{ConsumerError, Result};
use std::fmt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Lifecycle state of a consumer or coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Draining)
                | (Running, Draining)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Observable lifecycle with validated transitions
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Create a lifecycle in `Starting`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Starting);
        Self { tx }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                result = Err(ConsumerError::Lifecycle {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                false
            }
        });
        result
    }

    /// Move to `Stopped` from wherever we are; no-op if already stopped
    pub fn stop(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = LifecycleState::Stopped;
                true
            }
        });
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Stream of states, starting with the current one
    pub fn states(&self) -> WatchStream<LifecycleState> {
        WatchStream::new(self.subscribe())
    }

    /// Wait until the lifecycle reaches `target` or a later state
    pub async fn wait_for(&self, target: LifecycleState) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| rank(*s) >= rank(target)).await;
    }
}

fn rank(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Starting => 0,
        LifecycleState::Running => 1,
        LifecycleState::Draining => 2,
        LifecycleState::Stopped => 3,
    }
}
