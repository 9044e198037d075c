//! Run outcome, final aggregation, and the report hand-off.

use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FitShape;
use crate::spot::FittedSpot;
use crate::stack::StackDims;

/// Everything the report component needs to render a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Source title, suffixed with `_Pos<range>` for multi-position stacks.
    pub title: String,
    pub source_title: String,
    pub dims: StackDims,
    pub position_count: usize,
    pub pixel_size_nm: f64,
    pub z_step_nm: f64,
    pub shape: FitShape,
    pub half_size: usize,
    pub spots: Vec<FittedSpot>,
    /// Acquisition time of every frame, in milliseconds.
    pub time_points_ms: Vec<f64>,
    /// `(min, max)` of fitted z centers, in nanometers.
    pub z_range: (f64, f64),
    pub has_z_calibration: bool,
    pub show_window: bool,
}

/// Receives the report of every run that found spots.
pub trait ReportSink: Send + Sync {
    fn publish(&self, report: RunReport) -> io::Result<()>;
}

/// Writes each report as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonReportSink {
    fn publish(&self, report: RunReport) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(fs::File::create(&self.path)?);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunOutcome {
    #[default]
    Completed,
    /// The whole scan yielded no fitted spot; no report was published.
    NoSpotsFound,
    Stopped,
    Failed(String),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::NoSpotsFound => f.write_str("no spots found"),
            RunOutcome::Stopped => f.write_str("stopped"),
            RunOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    /// Spots collected after filtering.
    pub spots: usize,
    /// Candidates enqueued for fitting.
    pub candidates: usize,
    /// Candidates dropped by the fitter or the acceptance windows.
    pub rejected: usize,
    pub planes: usize,
    pub elapsed: Duration,
    pub spots_per_second: f64,
    pub outcome: RunOutcome,
}

/// Frame acquisition times: frame 1 at 0, frame `i ≥ 2` at `(i - 1) · interval`.
///
/// The leading entry is the 0-based frame index 0, so the result has
/// `frames + 1` entries; entries 0 and 1 are both `0.0`.
pub fn time_axis(frames: usize, interval_ms: f64) -> Vec<f64> {
    std::iter::once(0.0)
        .chain((1..=frames).map(|i| (i - 1) as f64 * interval_ms))
        .collect()
}

/// `(min, max)` of the spots' z centers.
///
/// Without calibration the range is `(0, 0)`. Both bounds are floored at
/// zero: the minimum only considers positive z, and is `0` when none is.
pub fn z_range(spots: &[FittedSpot], calibrated: bool) -> (f64, f64) {
    if !calibrated {
        return (0.0, 0.0);
    }
    let zs = spots.iter().filter_map(|s| s.z_center);

    let max = zs.clone().fold(0.0, f64::max);
    let min = zs.filter(|&z| z > 0.0).fold(f64::INFINITY, f64::min);
    let min = if min.is_finite() { min } else { 0.0 };
    (min, max)
}

/// `spots / elapsed` in spots per second; zero for an instantaneous run.
pub fn throughput(spots: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { spots as f64 / secs } else { 0.0 }
}
