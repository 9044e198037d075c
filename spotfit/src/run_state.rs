//! Run lifecycle: `Idle → Running → (Stopping →) Stopped`.
//!
//! Only the orchestrator transitions the state. Dispatcher, workers and the
//! position synchronizer hold a [`StopSignal`] and can only observe it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u8)]
pub enum RunState {
    /// No run has been started yet.
    Idle = 0,
    Running = 1,
    /// Stop requested; the run thread is winding down.
    Stopping = 2,
    /// The last run has ended, normally or not.
    Stopped = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    state: Arc<AtomicU8>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RunState::Idle as u8)),
        }
    }
}

impl StateCell {
    pub(crate) fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Idle | Stopped → Running`. Returns false if a run is already active.
    pub(crate) fn try_start(&self) -> bool {
        for from in [RunState::Idle, RunState::Stopped] {
            if self.transition(from, RunState::Running) {
                return true;
            }
        }
        false
    }

    /// `Running → Stopping`. Returns false if nothing was running.
    pub(crate) fn request_stop(&self) -> bool {
        self.transition(RunState::Running, RunState::Stopping)
    }

    /// Any state → `Stopped`.
    pub(crate) fn finish(&self) {
        self.state.store(RunState::Stopped as u8, Ordering::Release);
    }

    pub(crate) fn signal(&self) -> StopSignal {
        StopSignal {
            state: Arc::clone(&self.state),
        }
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Read-only view of the run state handed to pipeline stages.
#[derive(Debug, Clone)]
pub struct StopSignal {
    state: Arc<AtomicU8>,
}

impl StopSignal {
    /// A signal that never fires, for driving stages outside an orchestrated run.
    pub fn never() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RunState::Running as u8)),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        RunState::from_u8(self.state.load(Ordering::Acquire)) == RunState::Stopping
    }
}
