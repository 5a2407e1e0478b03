//! Component lifecycle state.
//!
//! `Unstarted → Running → (Stopping → Stopped | Failed)`. Transitions only
//! move forward; a request to go backwards is refused and reported to the
//! caller.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a long-running component.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Unstarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl From<u8> for LifecycleState {
    fn from(val: u8) -> Self {
        match val {
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            3 => LifecycleState::Stopped,
            4 => LifecycleState::Failed,
            _ => LifecycleState::Unstarted,
        }
    }
}

impl LifecycleState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Unstarted, Running | Stopping | Stopped | Failed) => true,
            (Running, Stopping | Stopped | Failed) => true,
            (Stopping, Stopped | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Unstarted => "unstarted",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Atomic, monotonic holder for a [`LifecycleState`].
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Unstarted as u8),
        }
    }

    /// Current state.
    pub fn get(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a forward transition.
    ///
    /// Returns the previous state on success and the current state when the
    /// transition was refused.
    pub fn advance(&self, next: LifecycleState) -> Result<LifecycleState, LifecycleState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let cur = LifecycleState::from(current);
            if !cur.can_advance_to(next) {
                return Err(cur);
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(cur),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
