//! Test doubles: synthetic stacks, a scripted display host, recording sinks.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use common::Buffer2;
use parking_lot::Mutex;

use crate::config::{PipelineConfig, PrefilterType};
use crate::error::{Error, Result};
use crate::fit::{FitError, SpotFitter};
use crate::maxima::MaximaFinder;
use crate::position_sync::PositionSync;
use crate::report::{ReportSink, RunReport};
use crate::spot::{FittedSpot, SpotCandidate};
use crate::stack::{DisplayHost, Region, StackDims, StackSource};

pub fn init_tracing() {
    common::log_setup::setup_test_logging();
}

// ============================================================================
// Synthetic stack
// ============================================================================

/// One Gaussian blob. `frame`/`position` restrict where it appears
/// (1-based frame, 0-based position); `None` means everywhere.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSpot {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub sigma: f64,
    pub frame: Option<usize>,
    pub position: Option<usize>,
}

impl SyntheticSpot {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            amplitude: 1000.0,
            sigma: 1.3,
            frame: None,
            position: None,
        }
    }

    pub fn in_frame(mut self, frame: usize) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }
}

/// Flat background with Gaussian blobs; reads follow the shared display position.
pub struct SyntheticStack {
    pub dims: StackDims,
    pub background: f32,
    pub spots: Vec<SyntheticSpot>,
    /// 0-based position currently displayed; shared with [`ScriptedHost`].
    pub current_position: Arc<AtomicUsize>,
    /// Plane `(channel, slice, frame)` whose read fails with an allocation error.
    pub fail_at: Option<(usize, usize, usize)>,
    /// `(position, channel, slice, frame)` of every read.
    pub reads: Mutex<Vec<(usize, usize, usize, usize)>>,
}

impl SyntheticStack {
    pub fn new(width: usize, height: usize, channels: usize, slices: usize, frames: usize) -> Self {
        Self {
            dims: StackDims {
                width,
                height,
                channels,
                slices,
                frames,
            },
            background: 100.0,
            spots: Vec::new(),
            current_position: Arc::new(AtomicUsize::new(0)),
            fail_at: None,
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_spot(mut self, spot: SyntheticSpot) -> Self {
        self.spots.push(spot);
        self
    }

    pub fn failing_at(mut self, channel: usize, slice: usize, frame: usize) -> Self {
        self.fail_at = Some((channel, slice, frame));
        self
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }
}

impl StackSource for SyntheticStack {
    fn title(&self) -> String {
        "synthetic".into()
    }

    fn dims(&self) -> StackDims {
        self.dims
    }

    fn plane(&self, channel: usize, slice: usize, frame: usize) -> Result<Buffer2<f32>> {
        let position = self.current_position.load(Ordering::SeqCst);
        self.reads.lock().push((position, channel, slice, frame));
        if self.fail_at == Some((channel, slice, frame)) {
            return Err(Error::Allocation {
                channel,
                slice,
                frame,
            });
        }

        let spots: Vec<_> = self
            .spots
            .iter()
            .filter(|s| s.frame.is_none_or(|f| f == frame))
            .filter(|s| s.position.is_none_or(|p| p == position))
            .copied()
            .collect();
        let bg = self.background as f64;
        Ok(Buffer2::from_fn(self.dims.width, self.dims.height, |x, y| {
            let signal: f64 = spots
                .iter()
                .map(|s| {
                    let r2 = (x as f64 - s.x).powi(2) + (y as f64 - s.y).powi(2);
                    s.amplitude * (-r2 / (2.0 * s.sigma * s.sigma)).exp()
                })
                .sum();
            (bg + signal) as f32
        }))
    }
}

// ============================================================================
// Scripted host display
// ============================================================================

/// In-memory display. Confirms position changes from its own thread after
/// `confirm_after`, or never when that is `None`.
pub struct ScriptedHost {
    pub position_count: usize,
    pub current: Arc<AtomicUsize>,
    pub confirm_after: Option<Duration>,
    subscriber: Arc<Mutex<Option<PositionSync>>>,
    pub requests: Mutex<Vec<usize>>,
    pub region: Mutex<Option<Region>>,
    /// Every value passed to `set_region`, in order.
    pub region_history: Mutex<Vec<Option<Region>>>,
    pub subscriptions: AtomicUsize,
    pub unsubscriptions: AtomicUsize,
}

impl ScriptedHost {
    pub fn new(position_count: usize, current: Arc<AtomicUsize>) -> Self {
        Self {
            position_count,
            current,
            confirm_after: Some(Duration::from_millis(5)),
            subscriber: Arc::new(Mutex::new(None)),
            requests: Mutex::new(Vec::new()),
            region: Mutex::new(None),
            region_history: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
            unsubscriptions: AtomicUsize::new(0),
        }
    }

    pub fn never_confirming(mut self) -> Self {
        self.confirm_after = None;
        self
    }

    pub fn with_region(self, region: Region) -> Self {
        *self.region.lock() = Some(region);
        self
    }

    pub fn requests(&self) -> Vec<usize> {
        self.requests.lock().clone()
    }
}

impl DisplayHost for ScriptedHost {
    fn position_count(&self) -> usize {
        self.position_count
    }

    fn current_position(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn request_position(&self, position: usize) {
        self.requests.lock().push(position);
        let Some(delay) = self.confirm_after else {
            return;
        };
        let current = Arc::clone(&self.current);
        let subscriber = Arc::clone(&self.subscriber);
        thread::spawn(move || {
            thread::sleep(delay);
            current.store(position, Ordering::SeqCst);
            if let Some(sync) = subscriber.lock().clone() {
                sync.pixels_updated(position);
            }
        });
    }

    fn subscribe(&self, sync: PositionSync) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.subscriber.lock() = Some(sync);
    }

    fn unsubscribe(&self) {
        self.unsubscriptions.fetch_add(1, Ordering::SeqCst);
        *self.subscriber.lock() = None;
    }

    fn region(&self) -> Option<Region> {
        *self.region.lock()
    }

    fn set_region(&self, region: Option<Region>) {
        self.region_history.lock().push(region);
        *self.region.lock() = region;
    }
}

// ============================================================================
// Sinks, finders, fitters
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<RunReport>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn last(&self) -> Option<RunReport> {
        self.reports.lock().last().cloned()
    }
}

impl ReportSink for RecordingSink {
    fn publish(&self, report: RunReport) -> io::Result<()> {
        self.reports.lock().push(report);
        Ok(())
    }
}

/// Returns the same coordinates for every plane, in the given order.
pub struct ListFinder {
    pub maxima: Vec<(u32, u32)>,
    pub calls: AtomicUsize,
}

impl ListFinder {
    pub fn new(maxima: Vec<(u32, u32)>) -> Self {
        Self {
            maxima,
            calls: AtomicUsize::new(0),
        }
    }
}

impl MaximaFinder for ListFinder {
    fn find(
        &self,
        _plane: &Buffer2<f32>,
        _half_size: usize,
        _noise_tolerance: f32,
        _prefilter: PrefilterType,
        region: Option<Region>,
    ) -> Vec<(u32, u32)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.maxima
            .iter()
            .copied()
            .filter(|&(x, y)| region.is_none_or(|r| r.contains(x as usize, y as usize)))
            .collect()
    }
}

/// Accepts every candidate unchanged, optionally slowly.
#[derive(Default)]
pub struct PassThroughFitter {
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl PassThroughFitter {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        }
    }
}

impl SpotFitter for PassThroughFitter {
    fn fit(
        &self,
        candidate: &SpotCandidate,
        _config: &PipelineConfig,
    ) -> std::result::Result<FittedSpot, FitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        Ok(FittedSpot::from_candidate(candidate))
    }
}
