//! Progress reporting for a run.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub stage: ProgressStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ProgressStage {
    /// Planes scanned out of planes requested, across all positions.
    Detecting,
    /// Spots fitted so far out of candidates enqueued.
    Fitting,
}

/// Shared progress callback; `None` disables reporting.
pub type ProgressCallback = Option<Arc<dyn Fn(Progress) + Send + Sync>>;

pub(crate) fn report_progress(
    callback: &ProgressCallback,
    current: usize,
    total: usize,
    stage: ProgressStage,
) {
    if let Some(f) = callback {
        f(Progress {
            current,
            total,
            stage,
        });
    }
}
