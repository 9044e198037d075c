//! Rendezvous between the dispatcher thread and the host display.
//!
//! The dispatcher asks the host to show a stage position and then blocks
//! until the host reports, through [`PositionSync::pixels_updated`], that the
//! requested position has been rendered. The confirmation is stored in the
//! slot, so a notification that arrives before the waiter sleeps is not lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::run_state::StopSignal;
use crate::stack::DisplayHost;

/// Upper bound on how long a stop request can go unnoticed by a waiter.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Slot {
    desired: Option<usize>,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    slot: Mutex<Slot>,
    cond: Condvar,
}

/// Single-slot condition keyed by the desired position.
///
/// At most one wait may be outstanding; a second concurrent
/// [`PositionSync::sync_to`] fails with [`Error::PositionSyncBusy`].
#[derive(Debug, Clone, Default)]
pub struct PositionSync {
    inner: Arc<Inner>,
}

impl PositionSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host callback: the display now shows `position`. Any thread.
    pub fn pixels_updated(&self, position: usize) {
        let mut slot = self.inner.slot.lock();
        if slot.desired == Some(position) {
            slot.confirmed = true;
            self.inner.cond.notify_one();
        }
    }

    /// Wake a pending waiter so it re-checks the stop signal.
    pub fn interrupt(&self) {
        let _slot = self.inner.slot.lock();
        self.inner.cond.notify_all();
    }

    /// Make `host` display `position` and wait for confirmation.
    ///
    /// Returns immediately if the host already shows `position`.
    pub fn sync_to(
        &self,
        host: &dyn DisplayHost,
        position: usize,
        stop: &StopSignal,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if host.current_position() == position {
            return Ok(());
        }

        {
            let mut slot = self.inner.slot.lock();
            if slot.desired.is_some() {
                return Err(Error::PositionSyncBusy);
            }
            slot.desired = Some(position);
            slot.confirmed = false;
        }

        tracing::debug!(position, "Requesting display position");
        // Outside the lock: hosts may confirm synchronously from this call.
        host.request_position(position);

        let started = Instant::now();
        let mut slot = self.inner.slot.lock();
        let result = loop {
            if slot.confirmed {
                break Ok(());
            }
            if stop.is_stop_requested() {
                break Err(Error::Interrupted);
            }
            let mut wait = STOP_POLL_INTERVAL;
            if let Some(timeout) = timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    break Err(Error::PositionSyncTimeout { position, waited });
                }
                wait = wait.min(timeout - waited);
            }
            self.inner.cond.wait_for(&mut slot, wait);
        };

        slot.desired = None;
        slot.confirmed = false;
        result
    }
}
