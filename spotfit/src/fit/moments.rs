//! Intensity-moment estimates over a patch.

use std::f64::consts::TAU;

use common::Buffer2;

use super::lm::Sample;
use super::{FitError, PatchFit};

/// Mean of the patch's outermost ring of pixels.
pub(super) fn border_background(patch: &Buffer2<f32>) -> f64 {
    let w = patch.width();
    let h = patch.height();
    let (sum, count) = (0..h)
        .flat_map(|y| (0..w).map(move |x| (x, y)))
        .filter(|&(x, y)| x == 0 || y == 0 || x == w - 1 || y == h - 1)
        .fold((0.0f64, 0usize), |(s, n), (x, y)| (s + patch[(x, y)] as f64, n + 1));
    sum / count.max(1) as f64
}

/// Background-subtracted centroid and second moments.
///
/// The amplitude is chosen so that `2π·A·σx·σy` equals the summed signal,
/// which keeps photon counts comparable with the Gaussian fit.
pub(super) fn fit_moments(
    samples: &[Sample],
    background: f64,
    max_sigma: f64,
) -> Result<PatchFit, FitError> {
    let mut total = 0.0;
    let mut mx = 0.0;
    let mut my = 0.0;
    for &(x, y, z) in samples {
        let w = (z - background).max(0.0);
        total += w;
        mx += w * x;
        my += w * y;
    }
    if !(total > 0.0) {
        return Err(FitError::NoSignal);
    }
    mx /= total;
    my /= total;

    let mut vx = 0.0;
    let mut vy = 0.0;
    for &(x, y, z) in samples {
        let w = (z - background).max(0.0);
        vx += w * (x - mx).powi(2);
        vy += w * (y - my).powi(2);
    }
    let sigma_x = (vx / total).sqrt().clamp(0.5, max_sigma);
    let sigma_y = (vy / total).sqrt().clamp(0.5, max_sigma);

    let amplitude = total / (TAU * sigma_x * sigma_y);
    let residual: f64 = samples
        .iter()
        .map(|&(x, y, z)| {
            let ex = (x - mx).powi(2) / (sigma_x * sigma_x);
            let ey = (y - my).powi(2) / (sigma_y * sigma_y);
            (z - amplitude * (-0.5 * (ex + ey)).exp() - background).powi(2)
        })
        .sum();

    Ok(PatchFit {
        x: mx,
        y: my,
        amplitude,
        sigma_x,
        sigma_y,
        background,
        rms_residual: (residual / samples.len() as f64).sqrt(),
        iterations: 1,
        converged: true,
    })
}
