//! Append-only store of fitted spots shared by all workers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::spot::FittedSpot;

/// Thread-safe result list. Arrival order across workers is arbitrary.
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    spots: Arc<Mutex<Vec<FittedSpot>>>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, spot: FittedSpot) {
        self.spots.lock().push(spot);
    }

    pub fn len(&self) -> usize {
        self.spots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spots.lock().is_empty()
    }

    /// Copy of everything collected so far.
    pub fn snapshot(&self) -> Vec<FittedSpot> {
        self.spots.lock().clone()
    }
}
