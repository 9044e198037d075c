//! Per-candidate model fitting.
//!
//! [`GaussianFitter`] turns a candidate's pixel patch into a [`FittedSpot`]:
//! a moment estimate first, refined by a Levenberg-Marquardt Gaussian fit
//! unless [`FitMode::Centroid`] is selected. Fit coordinates are patch-local
//! and converted back to plane coordinates and physical units here.

#[cfg(test)]
mod tests;

mod gaussian;
mod lm;
mod moments;

use std::f64::consts::TAU;

use common::Buffer2;
use thiserror::Error;

use crate::config::{FitMode, PipelineConfig};
use crate::spot::{FitQuality, FittedSpot, SpotCandidate};

/// Why a single candidate could not be fitted. Never aborts the pool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("Candidate has no pixel patch")]
    MissingPatch,

    #[error("Patch has {0} pixels, too few to fit")]
    TooFewPixels(usize),

    #[error("No signal above background")]
    NoSignal,

    #[error("Normal equations are singular")]
    Singular,

    #[error("Fit diverged to a non-finite or degenerate solution")]
    Diverged,

    #[error("Fitted center ({x:.2}, {y:.2}) lies outside the patch")]
    OutOfPatch { x: f64, y: f64 },
}

/// Fits one candidate. Implementations are shared across worker threads.
pub trait SpotFitter: Send + Sync {
    fn fit(
        &self,
        candidate: &SpotCandidate,
        config: &PipelineConfig,
    ) -> Result<FittedSpot, FitError>;
}

/// Patch-local fit result in pixels and ADU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PatchFit {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub background: f64,
    pub rms_residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Fewest pixels accepted for a fit: one more than the largest parameter count.
const MIN_PIXELS: usize = 7;

#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianFitter;

impl GaussianFitter {
    pub(crate) fn fit_patch(
        &self,
        patch: &Buffer2<f32>,
        config: &PipelineConfig,
    ) -> Result<PatchFit, FitError> {
        let n = patch.width() * patch.height();
        if n < MIN_PIXELS {
            return Err(FitError::TooFewPixels(n));
        }

        let samples: Vec<lm::Sample> = (0..patch.height())
            .flat_map(|y| (0..patch.width()).map(move |x| (x, y)))
            .map(|(x, y)| (x as f64, y as f64, patch[(x, y)] as f64))
            .collect();
        let max_sigma = (patch.width().min(patch.height()) / 2).max(1) as f64;

        let background = moments::border_background(patch);
        let estimate = moments::fit_moments(&samples, background, max_sigma)?;

        let fit = match config.fit_mode {
            FitMode::Centroid => estimate,
            FitMode::LevenbergMarquardt => gaussian::fit_least_squares(
                &samples,
                &estimate,
                config.shape,
                max_sigma,
                config.max_iterations,
            )
            .ok_or(FitError::Singular)?,
        };

        let finite = [fit.x, fit.y, fit.amplitude, fit.sigma_x, fit.sigma_y, fit.background]
            .iter()
            .all(|v| v.is_finite());
        if !finite || fit.sigma_x <= 0.0 || fit.sigma_y <= 0.0 {
            return Err(FitError::Diverged);
        }

        let max_x = (patch.width() - 1) as f64;
        let max_y = (patch.height() - 1) as f64;
        if !(0.0..=max_x).contains(&fit.x) || !(0.0..=max_y).contains(&fit.y) {
            return Err(FitError::OutOfPatch { x: fit.x, y: fit.y });
        }

        Ok(fit)
    }
}

impl SpotFitter for GaussianFitter {
    fn fit(
        &self,
        candidate: &SpotCandidate,
        config: &PipelineConfig,
    ) -> Result<FittedSpot, FitError> {
        let patch = candidate.patch.as_ref().ok_or(FitError::MissingPatch)?;
        let fit = self.fit_patch(patch, config)?;

        let half_x = (patch.width() / 2) as f64;
        let half_y = (patch.height() / 2) as f64;
        let pixel = config.pixel_size_nm;
        let adu_to_photons = config.photon_conversion_factor / config.gain;

        let mut spot = FittedSpot::from_candidate(candidate);
        spot.pos.x = candidate.x as f64 - half_x + fit.x;
        spot.pos.y = candidate.y as f64 - half_y + fit.y;
        spot.pos_nm = spot.pos * pixel;
        spot.photons = TAU * fit.amplitude * fit.sigma_x * fit.sigma_y * adu_to_photons;
        spot.background = (fit.background - config.base_level) * adu_to_photons;
        spot.sigma_x_nm = fit.sigma_x * pixel;
        spot.sigma_y_nm = fit.sigma_y * pixel;
        spot.width_nm = 2.0 * (fit.sigma_x * fit.sigma_y).sqrt() * pixel;
        spot.z_center = config
            .z_calibration
            .map(|cal| cal.z_nm(spot.sigma_x_nm, spot.sigma_y_nm, pixel));
        spot.quality = FitQuality {
            rms_residual: fit.rms_residual,
            iterations: fit.iterations,
            converged: fit.converged,
        };

        Ok(spot)
    }
}
