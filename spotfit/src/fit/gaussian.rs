//! Gaussian point-spread models for the Levenberg-Marquardt fit.
//!
//! `f(x,y) = A · exp(-((x-x₀)²/2σx² + (y-y₀)²/2σy²)) + B`

use super::PatchFit;
use super::lm::{LmConfig, LmModel, Sample, optimize};
use crate::config::FitShape;

const MIN_SIGMA: f64 = 0.5;
const MIN_AMPLITUDE: f64 = 0.01;

/// Parameters: `[x0, y0, amplitude, sigma, background]`.
struct Circular {
    max_sigma: f64,
}

impl LmModel<5> for Circular {
    fn evaluate(&self, x: f64, y: f64, p: &[f64; 5]) -> f64 {
        let [x0, y0, amp, sigma, bg] = *p;
        let r2 = (x - x0).powi(2) + (y - y0).powi(2);
        amp * (-0.5 * r2 / (sigma * sigma)).exp() + bg
    }

    fn jacobian_row(&self, x: f64, y: f64, p: &[f64; 5]) -> [f64; 5] {
        let [x0, y0, amp, sigma, _bg] = *p;
        let sigma2 = sigma * sigma;
        let dx = x - x0;
        let dy = y - y0;
        let r2 = dx * dx + dy * dy;
        let e = (-0.5 * r2 / sigma2).exp();
        let amp_e = amp * e;

        [
            amp_e * dx / sigma2,
            amp_e * dy / sigma2,
            e,
            amp_e * r2 / (sigma2 * sigma),
            1.0,
        ]
    }

    fn constrain(&self, p: &mut [f64; 5]) {
        p[2] = p[2].max(MIN_AMPLITUDE);
        p[3] = p[3].clamp(MIN_SIGMA, self.max_sigma);
    }
}

/// Parameters: `[x0, y0, amplitude, sigma_x, sigma_y, background]`.
struct Elliptical {
    max_sigma: f64,
}

impl LmModel<6> for Elliptical {
    fn evaluate(&self, x: f64, y: f64, p: &[f64; 6]) -> f64 {
        let [x0, y0, amp, sx, sy, bg] = *p;
        let dx = x - x0;
        let dy = y - y0;
        amp * (-0.5 * (dx * dx / (sx * sx) + dy * dy / (sy * sy))).exp() + bg
    }

    fn jacobian_row(&self, x: f64, y: f64, p: &[f64; 6]) -> [f64; 6] {
        let [x0, y0, amp, sx, sy, _bg] = *p;
        let sx2 = sx * sx;
        let sy2 = sy * sy;
        let dx = x - x0;
        let dy = y - y0;
        let e = (-0.5 * (dx * dx / sx2 + dy * dy / sy2)).exp();
        let amp_e = amp * e;

        [
            amp_e * dx / sx2,
            amp_e * dy / sy2,
            e,
            amp_e * dx * dx / (sx2 * sx),
            amp_e * dy * dy / (sy2 * sy),
            1.0,
        ]
    }

    fn constrain(&self, p: &mut [f64; 6]) {
        p[2] = p[2].max(MIN_AMPLITUDE);
        p[3] = p[3].clamp(MIN_SIGMA, self.max_sigma);
        p[4] = p[4].clamp(MIN_SIGMA, self.max_sigma);
    }
}

/// Least-squares fit starting from `initial` (usually the moment estimate).
///
/// `None` if the normal equations are singular from the start.
pub(super) fn fit_least_squares(
    samples: &[Sample],
    initial: &PatchFit,
    shape: FitShape,
    max_sigma: f64,
    max_iterations: usize,
) -> Option<PatchFit> {
    let config = LmConfig {
        max_iterations,
        ..Default::default()
    };
    let sigma = (initial.sigma_x * initial.sigma_y).sqrt().clamp(MIN_SIGMA, max_sigma);
    let amplitude = initial.amplitude.max(MIN_AMPLITUDE);

    let (params, chi2, converged, iterations) = match shape {
        FitShape::Circular => {
            let model = Circular { max_sigma };
            let start = [initial.x, initial.y, amplitude, sigma, initial.background];
            let r = optimize(&model, samples, start, &config)?;
            let [x, y, a, s, b] = r.params;
            ([x, y, a, s, s, b], r.chi2, r.converged, r.iterations)
        }
        FitShape::Elliptical => {
            let model = Elliptical { max_sigma };
            let start = [
                initial.x,
                initial.y,
                amplitude,
                initial.sigma_x.clamp(MIN_SIGMA, max_sigma),
                initial.sigma_y.clamp(MIN_SIGMA, max_sigma),
                initial.background,
            ];
            let r = optimize(&model, samples, start, &config)?;
            (r.params, r.chi2, r.converged, r.iterations)
        }
    };

    let [x, y, amplitude, sigma_x, sigma_y, background] = params;
    Some(PatchFit {
        x,
        y,
        amplitude,
        sigma_x,
        sigma_y,
        background,
        rms_residual: (chi2 / samples.len() as f64).sqrt(),
        iterations,
        converged,
    })
}
