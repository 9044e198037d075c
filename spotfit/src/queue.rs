//! Hand-off queue between the dispatcher and the fitting workers.
//!
//! A multi-consumer channel, optionally bounded. The end of the stream is marked with a
//! single [`SpotCandidate::sentinel`]; a worker that receives it pushes it
//! back with [`SpotQueue::relay_sentinel`] before exiting, so every worker
//! sees it regardless of pool size.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::error::{Error, Result};
use crate::spot::SpotCandidate;

#[derive(Debug, Default)]
struct QueueCounters {
    pushed: AtomicUsize,
    sentinels: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct SpotQueue {
    tx: Sender<SpotCandidate>,
    rx: Receiver<SpotCandidate>,
    counters: Arc<QueueCounters>,
}

impl SpotQueue {
    /// Queue holding at most `capacity` items. Slots are allocated up front.
    pub fn new(capacity: usize) -> Self {
        Self::from_channel(bounded(capacity))
    }

    pub fn unbounded() -> Self {
        Self::from_channel(unbounded())
    }

    fn from_channel((tx, rx): (Sender<SpotCandidate>, Receiver<SpotCandidate>)) -> Self {
        Self {
            tx,
            rx,
            counters: Arc::new(QueueCounters::default()),
        }
    }

    /// Enqueue a candidate, blocking while the queue is full.
    pub fn push(&self, candidate: SpotCandidate) -> Result<()> {
        debug_assert!(!candidate.is_sentinel(), "use push_sentinel");
        self.tx.send(candidate).map_err(|_| Error::Interrupted)?;
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Mark the end of the stream. Called once per dispatch.
    pub fn push_sentinel(&self) -> Result<()> {
        self.tx
            .send(SpotCandidate::sentinel())
            .map_err(|_| Error::Interrupted)?;
        self.counters.sentinels.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hand a received sentinel on to the next worker. Not counted.
    pub fn relay_sentinel(&self, sentinel: SpotCandidate) {
        debug_assert!(sentinel.is_sentinel());
        // Both channel ends live in `self`, so the send cannot fail.
        let _ = self.tx.send(sentinel);
    }

    /// Block until a candidate is available.
    pub fn pop(&self) -> SpotCandidate {
        self.rx.recv().unwrap_or_else(|_| SpotCandidate::sentinel())
    }

    pub fn try_pop(&self) -> Option<SpotCandidate> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(usize::MAX)
    }

    /// Real candidates enqueued so far (sentinels excluded).
    pub fn pushed(&self) -> usize {
        self.counters.pushed.load(Ordering::Relaxed)
    }

    /// Sentinels enqueued via [`SpotQueue::push_sentinel`].
    pub fn sentinels(&self) -> usize {
        self.counters.sentinels.load(Ordering::Relaxed)
    }

    /// Drop everything still queued, including a leftover relayed sentinel.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}
