//! Configuration for a detection/fitting run.
//!
//! [`PipelineConfig`] is loaded (or defaulted) once, validated, and then
//! frozen behind an `Arc` for the lifetime of a run. Workers read it
//! concurrently without locking.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

/// Errors produced while loading or validating a [`PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Enums
// ============================================================================

/// Shape of the point-spread model fitted to each spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum FitShape {
    /// Symmetric Gaussian, one width parameter.
    #[default]
    Circular,
    /// Axis-aligned elliptical Gaussian, independent x/y widths.
    /// Required for astigmatism-based z estimation.
    Elliptical,
}

/// Fitting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Least-squares Gaussian fit via Levenberg-Marquardt.
    #[default]
    LevenbergMarquardt,
    /// Background-subtracted intensity moments. Fast, less precise.
    Centroid,
}

/// Smoothing applied to a plane before local-maxima search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
pub enum PrefilterType {
    #[default]
    None,
    /// Gaussian blur with sigma = 1.5 pixels.
    Gaussian1_5,
}

// ============================================================================
// Acceptance windows and z calibration
// ============================================================================

/// Accepted spot width range, in nanometers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WidthFilter {
    pub min_nm: f64,
    pub max_nm: f64,
}

/// Accepted photon count range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotonFilter {
    pub min: f64,
    pub max: f64,
}

/// Linear astigmatism model: `z = offset_nm + slope_nm * (σx - σy) / pixel_size`.
///
/// Widths enter in nanometers; the difference is normalized by pixel size so
/// the slope is expressed in nanometers of z per pixel of width difference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZCalibration {
    pub slope_nm: f64,
    pub offset_nm: f64,
}

impl ZCalibration {
    pub fn z_nm(&self, sigma_x_nm: f64, sigma_y_nm: f64, pixel_size_nm: f64) -> f64 {
        self.offset_nm + self.slope_nm * (sigma_x_nm - sigma_y_nm) / pixel_size_nm
    }
}

// ============================================================================
// PipelineConfig
// ============================================================================

/// Read-only parameters shared by the dispatcher and every fitting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // -- detection --
    /// Patch radius in pixels; also the edge-exclusion margin.
    pub half_size: usize,
    /// Minimum rise of a maximum above its neighborhood minimum.
    pub noise_tolerance: f32,
    pub prefilter: PrefilterType,
    /// Channels (1-based) that are not scanned.
    pub skip_channels: Vec<usize>,

    // -- fitting --
    pub shape: FitShape,
    pub fit_mode: FitMode,
    pub max_iterations: usize,
    /// Photoelectrons per ADU at unit gain.
    pub photon_conversion_factor: f64,
    /// EM gain applied by the camera.
    pub gain: f64,
    /// Camera offset in ADU, subtracted before photon conversion.
    pub base_level: f64,

    // -- calibration --
    pub pixel_size_nm: f64,
    pub z_step_nm: f64,
    pub frame_interval_ms: f64,
    pub z_calibration: Option<ZCalibration>,

    // -- post-fit acceptance --
    pub width_filter: Option<WidthFilter>,
    pub photon_filter: Option<PhotonFilter>,

    // -- concurrency --
    /// Upper bound on fitting workers; the pool never exceeds the CPU count.
    pub max_workers: usize,
    /// Hard capacity of the spot queue; pushes block when it is full.
    /// `None` leaves the queue unbounded and relies on the backpressure pause.
    pub queue_capacity: Option<usize>,
    /// Queue depth above which the dispatcher pauses before the next plane.
    pub backpressure_threshold: usize,
    pub backpressure_pause_ms: u64,
    /// Give up waiting for the display after this long. `None` waits until stopped.
    pub position_sync_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            half_size: 4,
            noise_tolerance: 100.0,
            prefilter: PrefilterType::default(),
            skip_channels: Vec::new(),
            shape: FitShape::default(),
            fit_mode: FitMode::default(),
            max_iterations: 250,
            photon_conversion_factor: 10.57,
            gain: 50.0,
            base_level: 100.0,
            pixel_size_nm: 107.0,
            z_step_nm: 50.0,
            frame_interval_ms: 0.0,
            z_calibration: None,
            width_filter: None,
            photon_filter: None,
            max_workers: 8,
            queue_capacity: None,
            backpressure_threshold: 100_000,
            backpressure_pause_ms: 1000,
            position_sync_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a (possibly partial) YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.half_size == 0 {
            return invalid("half_size must be positive".into());
        }
        if !(self.noise_tolerance >= 0.0) {
            return invalid(format!(
                "noise_tolerance must be non-negative, got {}",
                self.noise_tolerance
            ));
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be positive".into());
        }
        if !(self.photon_conversion_factor > 0.0) || !(self.gain > 0.0) {
            return invalid(format!(
                "photon_conversion_factor ({}) and gain ({}) must be positive",
                self.photon_conversion_factor, self.gain
            ));
        }
        if !(self.pixel_size_nm > 0.0) {
            return invalid(format!(
                "pixel_size_nm must be positive, got {}",
                self.pixel_size_nm
            ));
        }
        if self.frame_interval_ms < 0.0 {
            return invalid(format!(
                "frame_interval_ms must be non-negative, got {}",
                self.frame_interval_ms
            ));
        }
        if let Some(w) = self.width_filter
            && w.min_nm > w.max_nm
        {
            return invalid(format!(
                "width_filter min ({}) exceeds max ({})",
                w.min_nm, w.max_nm
            ));
        }
        if let Some(p) = self.photon_filter
            && p.min > p.max
        {
            return invalid(format!(
                "photon_filter min ({}) exceeds max ({})",
                p.min, p.max
            ));
        }
        if self.max_workers == 0 {
            return invalid("max_workers must be positive".into());
        }
        if self.queue_capacity == Some(0) {
            return invalid("queue_capacity must be positive".into());
        }
        Ok(())
    }

    /// Pool size: hardware parallelism capped by `max_workers`.
    pub fn worker_count(&self) -> usize {
        let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        cpus.min(self.max_workers).max(1)
    }

    pub fn backpressure_pause(&self) -> Duration {
        Duration::from_millis(self.backpressure_pause_ms)
    }

    pub fn position_sync_timeout(&self) -> Option<Duration> {
        self.position_sync_timeout_ms.map(Duration::from_millis)
    }

    pub fn skips_channel(&self, channel: usize) -> bool {
        self.skip_channels.contains(&channel)
    }
}
