use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::{BlockId, HostSink, SessionEvent};

/// Lifecycle of one block session.
///
/// ```text
/// Idle -> Starting -> Running -> Stopping -> Idle
///                        |
///                        +-> Recovering -> Starting | Idle
/// (any) -> Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Recovering,
    Stopping,
    Disposed,
}

impl SessionState {
    /// The transition table. Self-transitions are never valid.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Idle, Starting) => true,
            (Starting, Running) | (Starting, Idle) | (Starting, Stopping) => true,
            (Running, Stopping) | (Running, Recovering) | (Running, Idle) => true,
            (Recovering, Starting) | (Recovering, Idle) | (Recovering, Stopping) => true,
            (Stopping, Idle) => true,
            _ => false,
        }
    }
}

/// Shared, observable state of a session.
/// Every accepted transition is reported to the host.
pub struct StateCell {
    block: BlockId,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("block", &self.block)
            .field("state", &self.get())
            .finish()
    }
}

impl StateCell {
    pub fn new(block: BlockId) -> Self {
        Self {
            block,
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `next` if the table allows it. Refused transitions are logged
    /// and leave the state untouched.
    pub fn transition(&self, next: SessionState, sink: &dyn HostSink) -> bool {
        self.apply(None, next, sink)
    }

    /// Transition only when the current state is `from`.
    pub fn transition_from(&self, from: SessionState, next: SessionState, sink: &dyn HostSink) -> bool {
        self.apply(Some(from), next, sink)
    }

    fn apply(&self, expected: Option<SessionState>, next: SessionState, sink: &dyn HostSink) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        if expected.is_some_and(|from| from != current) {
            return false;
        }
        if !current.can_transition_to(next) {
            if current != next {
                tracing::debug!(block = %self.block, ?current, ?next, "refused state transition");
            }
            return false;
        }
        *state = next;

        // Emit under the lock so hosts observe transitions in order.
        tracing::debug!(block = %self.block, from = ?current, to = ?next, "state transition");
        sink.emit(SessionEvent::StateChanged {
            block: self.block,
            state: next,
        });
        true
    }
}
