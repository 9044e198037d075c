//! Run lifecycle: position iteration, pool management and final aggregation.
//!
//! One run is driven by a dedicated thread that owns the dispatcher. The
//! fitting pool lives for the whole run; all requested positions feed the
//! same queue and the stream is closed by a single sentinel at the end.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::collector::ResultCollector;
use crate::config::{FitMode, FitShape, PipelineConfig, PrefilterType};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{Error, Result};
use crate::fit::{GaussianFitter, SpotFitter};
use crate::maxima::{LocalMaxima, MaximaFinder};
use crate::position_sync::PositionSync;
use crate::progress::ProgressCallback;
use crate::queue::SpotQueue;
use crate::report::{self, ReportSink, RunOutcome, RunReport, RunSummary};
use crate::run_state::{RunState, StateCell, StopSignal};
use crate::spot::FittedSpot;
use crate::stack::{DisplayHost, Region, StackSource};
use crate::worker_pool::{FitWorkerPool, PoolStats};

// ============================================================================
// Run parameters
// ============================================================================

/// Per-run choices made by the user, layered over [`PipelineConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    pub shape: FitShape,
    pub fit_mode: FitMode,
    pub prefilter: PrefilterType,
    /// 1-based `"start-end"` or `"start"`; empty means every position.
    pub positions: String,
    /// Search regions. Empty means the host's selection, or the whole plane.
    pub regions: Vec<Region>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RunParams {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            shape: config.shape,
            fit_mode: config.fit_mode,
            prefilter: config.prefilter,
            positions: String::new(),
            regions: Vec::new(),
        }
    }

    pub fn with_positions(mut self, positions: impl Into<String>) -> Self {
        self.positions = positions.into();
        self
    }
}

/// Inclusive, 1-based range of stage positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRange {
    pub start: usize,
    pub end: usize,
}

impl PositionRange {
    /// Parse `spec` and fit it to `available` positions.
    ///
    /// The end is clamped to `[start, available]`; a start outside
    /// `1..=available` is an error.
    pub fn resolve(spec: &str, available: usize) -> Result<Self> {
        let available = available.max(1);
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self {
                start: 1,
                end: available,
            });
        }

        let invalid = || Error::InvalidPositionRange(spec.to_string());
        let parse = |s: &str| s.trim().parse::<usize>().map_err(|_| invalid());
        let (start, end) = match spec.split_once('-') {
            Some((start, end)) => (parse(start)?, parse(end)?),
            None => {
                let start = parse(spec)?;
                (start, start)
            }
        };
        if start == 0 || start > available {
            return Err(invalid());
        }

        Ok(Self {
            start,
            end: end.clamp(start, available),
        })
    }

    /// Number of positions; never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn iter(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

impl fmt::Display for PositionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// State visible to callers while and after a run thread executes.
#[derive(Debug, Default)]
struct RunShared {
    results: Mutex<Vec<FittedSpot>>,
    summary: Mutex<Option<RunSummary>>,
    done: Mutex<bool>,
    done_cond: Condvar,
}

impl RunShared {
    fn reset(&self) {
        self.results.lock().clear();
        *self.summary.lock() = None;
        *self.done.lock() = false;
    }

    fn mark_done(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.done_cond.notify_all();
    }
}

/// Drives detection and fitting over a stack, one run at a time.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use spotfit::{JsonReportSink, Orchestrator, PipelineConfig, RunParams, StackSource};
/// # fn demo(source: Arc<dyn StackSource>) -> spotfit::Result<()> {
/// let orchestrator = Orchestrator::new(
///     PipelineConfig::default(),
///     RunParams::default(),
///     source,
///     Arc::new(JsonReportSink::new("spots.json")),
/// );
/// orchestrator.init()?;
/// orchestrator.join(Duration::from_secs(60));
/// println!("{:?}", orchestrator.summary());
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    config: PipelineConfig,
    params: RunParams,
    source: Arc<dyn StackSource>,
    sink: Arc<dyn ReportSink>,
    host: Option<Arc<dyn DisplayHost>>,
    finder: Arc<dyn MaximaFinder>,
    fitter: Arc<dyn SpotFitter>,
    progress: ProgressCallback,

    state: StateCell,
    sync: PositionSync,
    show_window: Arc<AtomicBool>,
    shared: Arc<RunShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        params: RunParams,
        source: Arc<dyn StackSource>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            config,
            params,
            source,
            sink,
            host: None,
            finder: Arc::new(LocalMaxima),
            fitter: Arc::new(GaussianFitter),
            progress: None,
            state: StateCell::default(),
            sync: PositionSync::new(),
            show_window: Arc::new(AtomicBool::new(true)),
            shared: Arc::new(RunShared::default()),
            handle: Mutex::new(None),
        }
    }

    /// Attach a multi-position display; without one a single position is scanned.
    pub fn with_host(mut self, host: Arc<dyn DisplayHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_finder(mut self, finder: Arc<dyn MaximaFinder>) -> Self {
        self.finder = finder;
        self
    }

    pub fn with_fitter(mut self, fitter: Arc<dyn SpotFitter>) -> Self {
        self.fitter = fitter;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Start a run on a background thread.
    ///
    /// Returns `Ok(false)` without doing anything if a run is already active.
    /// Configuration and position range are validated before starting.
    pub fn init(&self) -> Result<bool> {
        if self.is_running() {
            tracing::debug!("Run already active; init ignored");
            return Ok(false);
        }

        let mut config = self.config.clone();
        config.shape = self.params.shape;
        config.fit_mode = self.params.fit_mode;
        config.prefilter = self.params.prefilter;
        config.validate()?;

        let range = self
            .host
            .as_ref()
            .map(|host| PositionRange::resolve(&self.params.positions, host.position_count()))
            .transpose()?;
        let regions = if self.params.regions.is_empty() {
            self.host.as_ref().and_then(|h| h.region()).into_iter().collect()
        } else {
            self.params.regions.clone()
        };

        if !self.state.try_start() {
            return Ok(false);
        }
        // A previous run thread has finished by now; reap it.
        if let Some(previous) = self.handle.lock().take() {
            let _ = previous.join();
        }
        self.shared.reset();

        let ctx = RunContext {
            config: Arc::new(config),
            range,
            regions,
            source: Arc::clone(&self.source),
            sink: Arc::clone(&self.sink),
            host: self.host.clone(),
            finder: Arc::clone(&self.finder),
            fitter: Arc::clone(&self.fitter),
            progress: self.progress.clone(),
            state: self.state.clone(),
            stop: self.state.signal(),
            sync: self.sync.clone(),
            show_window: Arc::clone(&self.show_window),
            shared: Arc::clone(&self.shared),
        };

        let name = "spotfit-run".to_string();
        match thread::Builder::new().name(name.clone()).spawn(move || ctx.run()) {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(true)
            }
            Err(source) => {
                self.state.finish();
                self.shared.mark_done();
                Err(Error::Spawn { name, source })
            }
        }
    }

    /// Request a cooperative stop. No-op unless a run is active.
    pub fn stop(&self) {
        if self.state.request_stop() {
            tracing::info!("Stop requested");
            self.sync.interrupt();
        }
    }

    /// Wait up to `timeout` for the run thread to finish. True if it did.
    ///
    /// Returns true immediately if no run was ever started.
    pub fn join(&self, timeout: Duration) -> bool {
        if self.state.get() == RunState::Idle {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut done = self.shared.done.lock();
        while !*done {
            if self.shared.done_cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        drop(done);

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        true
    }

    /// Block until the current run, if any, has finished.
    pub fn wait(&self) {
        while !self.join(Duration::from_secs(3600)) {}
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state.get(), RunState::Running | RunState::Stopping)
    }

    /// Spots of the last finished run. Empty while a run is in progress.
    pub fn results(&self) -> Vec<FittedSpot> {
        self.shared.results.lock().clone()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.shared.summary.lock().clone()
    }

    /// Whether the published report should be shown to the user.
    pub fn show_window(&self, show: bool) {
        self.show_window.store(show, Ordering::Relaxed);
    }

    /// The host synchronizer; hosts call `pixels_updated` on it.
    pub fn position_sync(&self) -> &PositionSync {
        &self.sync
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.get_mut().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Run thread
// ============================================================================

struct RunContext {
    config: Arc<PipelineConfig>,
    range: Option<PositionRange>,
    regions: Vec<Region>,
    source: Arc<dyn StackSource>,
    sink: Arc<dyn ReportSink>,
    host: Option<Arc<dyn DisplayHost>>,
    finder: Arc<dyn MaximaFinder>,
    fitter: Arc<dyn SpotFitter>,
    progress: ProgressCallback,
    state: StateCell,
    stop: StopSignal,
    sync: PositionSync,
    show_window: Arc<AtomicBool>,
    shared: Arc<RunShared>,
}

impl RunContext {
    fn run(self) {
        let started = Instant::now();
        let dims = self.source.dims();
        let workers = self.config.worker_count();
        tracing::info!(
            title = %self.source.title(),
            width = dims.width,
            height = dims.height,
            channels = dims.channels,
            slices = dims.slices,
            frames = dims.frames,
            workers,
            positions = %self.range.map(|r| r.to_string()).unwrap_or_else(|| "1".into()),
            "Run started"
        );

        let queue = self
            .config
            .queue_capacity
            .map_or_else(SpotQueue::unbounded, SpotQueue::new);
        let collector = ResultCollector::new();
        let mut dispatched = DispatchStats::default();

        let (result, pool_stats) = match FitWorkerPool::spawn(
            workers,
            &queue,
            &collector,
            Arc::clone(&self.config),
            Arc::clone(&self.fitter),
            self.stop.clone(),
            self.progress.clone(),
        ) {
            Ok(pool) => {
                let dispatcher = Dispatcher::new(
                    self.source.as_ref(),
                    self.finder.as_ref(),
                    &self.config,
                    &queue,
                    &self.stop,
                )
                .with_regions(&self.regions);
                let planes_total =
                    dispatcher.planes_per_position() * self.range.map_or(1, |r| r.len());
                let dispatcher = dispatcher.with_progress(self.progress.clone(), planes_total);

                let scanned = self.scan(&dispatcher, &mut dispatched);
                let finished = dispatcher.finish();
                let joined = pool.join();

                let stats = joined.as_ref().copied().unwrap_or_default();
                (scanned.and(finished).and(joined.map(|_| ())), stats)
            }
            Err(err) => (Err(err), PoolStats::default()),
        };
        queue.clear();

        let spots = collector.snapshot();
        let outcome = self.conclude(result, &spots);
        let elapsed = started.elapsed();
        let summary = RunSummary {
            spots: spots.len(),
            candidates: dispatched.candidates,
            rejected: pool_stats.rejected + pool_stats.failed,
            planes: dispatched.planes,
            elapsed,
            spots_per_second: report::throughput(spots.len(), elapsed),
            outcome,
        };
        tracing::info!(
            outcome = %summary.outcome,
            candidates = summary.candidates,
            rejected = summary.rejected,
            "Analyzed {} spots in {:.2} seconds ({:.0} spots/sec.)",
            summary.spots,
            elapsed.as_secs_f64(),
            summary.spots_per_second
        );

        *self.shared.results.lock() = spots;
        *self.shared.summary.lock() = Some(summary);
        self.state.finish();
        self.shared.mark_done();
    }

    /// Scan every requested position, restoring the host's selection after each.
    fn scan(&self, dispatcher: &Dispatcher<'_>, stats: &mut DispatchStats) -> Result<()> {
        let (Some(host), Some(range)) = (&self.host, self.range) else {
            return dispatcher.scan_position(1, stats);
        };

        host.subscribe(self.sync.clone());
        let original = host.region();
        let mut result = Ok(());
        for position in range.iter() {
            if self.stop.is_stop_requested() {
                result = Err(Error::Interrupted);
                break;
            }
            tracing::info!(position, "Switching stage position");

            result = self
                .sync
                .sync_to(
                    host.as_ref(),
                    position - 1,
                    &self.stop,
                    self.config.position_sync_timeout(),
                )
                .and_then(|()| {
                    host.set_region(None);
                    dispatcher.scan_position(position as i32, stats)
                });
            host.set_region(original);

            if result.is_err() {
                break;
            }
        }
        host.unsubscribe();
        result
    }

    /// Classify the run and publish the report on success.
    fn conclude(&self, result: Result<()>, spots: &[FittedSpot]) -> RunOutcome {
        match result {
            Err(Error::Interrupted) => return RunOutcome::Stopped,
            Err(err) => {
                tracing::error!("Run failed: {err}");
                return RunOutcome::Failed(err.to_string());
            }
            Ok(()) if self.stop.is_stop_requested() => return RunOutcome::Stopped,
            Ok(()) => {}
        }

        if spots.is_empty() {
            tracing::warn!("No spots found");
            return RunOutcome::NoSpotsFound;
        }

        let report = self.build_report(spots);
        match self.sink.publish(report) {
            Ok(()) => RunOutcome::Completed,
            Err(err) => {
                tracing::error!("Failed to publish report: {err}");
                RunOutcome::Failed(format!("report: {err}"))
            }
        }
    }

    fn build_report(&self, spots: &[FittedSpot]) -> RunReport {
        let source_title = self.source.title();
        let position_count = self.host.as_ref().map_or(1, |h| h.position_count());
        let title = match self.range {
            Some(range) if position_count > 1 => format!("{source_title}_Pos{range}"),
            _ => source_title.clone(),
        };
        let dims = self.source.dims();
        let calibrated = self.config.z_calibration.is_some();

        RunReport {
            title,
            source_title,
            dims,
            position_count,
            pixel_size_nm: self.config.pixel_size_nm,
            z_step_nm: self.config.z_step_nm,
            shape: self.config.shape,
            half_size: self.config.half_size,
            spots: spots.to_vec(),
            time_points_ms: report::time_axis(dims.frames, self.config.frame_interval_ms),
            z_range: report::z_range(spots, calibrated),
            has_z_calibration: calibrated,
            show_window: self.show_window.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_inside_available_is_kept() {
        let range = PositionRange::resolve("2-4", 5).unwrap();
        assert_eq!(range, PositionRange { start: 2, end: 4 });
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_reversed_range_collapses_to_start() {
        assert_eq!(
            PositionRange::resolve("4-2", 5).unwrap(),
            PositionRange { start: 4, end: 4 }
        );
    }

    #[test]
    fn test_range_end_is_clamped_to_available() {
        assert_eq!(
            PositionRange::resolve("3-9", 5).unwrap(),
            PositionRange { start: 3, end: 5 }
        );
    }

    #[test]
    fn test_single_and_empty_ranges() {
        assert_eq!(
            PositionRange::resolve(" 3 ", 5).unwrap(),
            PositionRange { start: 3, end: 3 }
        );
        assert_eq!(
            PositionRange::resolve("", 5).unwrap(),
            PositionRange { start: 1, end: 5 }
        );
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        for spec in ["0-2", "6-7", "a-3", "2-x", "-"] {
            let err = PositionRange::resolve(spec, 5).unwrap_err();
            assert!(matches!(err, Error::InvalidPositionRange(_)), "{spec}: {err}");
        }
    }

    #[test]
    fn test_range_display() {
        assert_eq!(PositionRange { start: 2, end: 4 }.to_string(), "2-4");
    }

    #[test]
    fn test_params_follow_config() {
        let config = PipelineConfig {
            shape: FitShape::Elliptical,
            prefilter: PrefilterType::Gaussian1_5,
            ..Default::default()
        };
        let params = RunParams::from_config(&config).with_positions("1-2");
        assert_eq!(params.shape, FitShape::Elliptical);
        assert_eq!(params.prefilter, PrefilterType::Gaussian1_5);
        assert_eq!(params.positions, "1-2");
    }
}
