//! Records flowing through the pipeline.

use common::Buffer2;
use glam::DVec2;
use serde::{Deserialize, Serialize};

const SENTINEL_INDEX: i32 = -1;

/// A detected local maximum awaiting fitting.
///
/// Dimension indices are 1-based. The sentinel candidate carries `-1` in
/// every dimension and no patch.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotCandidate {
    /// Pixel coordinates of the maximum in the full plane.
    pub x: u32,
    pub y: u32,
    pub channel: i32,
    pub slice: i32,
    pub frame: i32,
    pub position: i32,
    /// Index within the plane's sorted candidate list.
    pub index: usize,
    /// `(2 * half_size + 1)²` pixels centered on `(x, y)`.
    pub patch: Option<Buffer2<f32>>,
}

impl SpotCandidate {
    pub fn sentinel() -> Self {
        Self {
            x: 0,
            y: 0,
            channel: SENTINEL_INDEX,
            slice: SENTINEL_INDEX,
            frame: SENTINEL_INDEX,
            position: SENTINEL_INDEX,
            index: 0,
            patch: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.patch.is_none()
            && self.channel == SENTINEL_INDEX
            && self.slice == SENTINEL_INDEX
            && self.frame == SENTINEL_INDEX
            && self.position == SENTINEL_INDEX
    }
}

/// Goodness-of-fit diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FitQuality {
    /// RMS of model residuals over the patch, in ADU.
    pub rms_residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// A fitted spot: the candidate's identity plus fit outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedSpot {
    pub channel: i32,
    pub slice: i32,
    pub frame: i32,
    pub position: i32,
    pub index: usize,
    /// Integer candidate coordinates the fit started from.
    pub candidate_x: u32,
    pub candidate_y: u32,

    /// Sub-pixel center in pixels, full-plane coordinates.
    pub pos: DVec2,
    /// Sub-pixel center in nanometers.
    pub pos_nm: DVec2,
    /// Integrated signal converted to photons.
    pub photons: f64,
    /// Background level in photons per pixel.
    pub background: f64,
    /// Gaussian sigma along x and y, in nanometers.
    pub sigma_x_nm: f64,
    pub sigma_y_nm: f64,
    /// `2 * sqrt(σx σy)`, in nanometers.
    pub width_nm: f64,
    /// Axial position from the z calibration, when one is configured.
    pub z_center: Option<f64>,
    pub quality: FitQuality,
}

impl FittedSpot {
    /// Identity fields of `candidate` with all fit outputs zeroed.
    pub fn from_candidate(candidate: &SpotCandidate) -> Self {
        Self {
            channel: candidate.channel,
            slice: candidate.slice,
            frame: candidate.frame,
            position: candidate.position,
            index: candidate.index,
            candidate_x: candidate.x,
            candidate_y: candidate.y,
            pos: DVec2::new(candidate.x as f64, candidate.y as f64),
            pos_nm: DVec2::ZERO,
            photons: 0.0,
            background: 0.0,
            sigma_x_nm: 0.0,
            sigma_y_nm: 0.0,
            width_nm: 0.0,
            z_center: None,
            quality: FitQuality::default(),
        }
    }
}
