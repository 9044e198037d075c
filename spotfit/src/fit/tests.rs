use common::Buffer2;

use super::*;
use crate::config::{FitShape, ZCalibration};

const HALF: usize = 4;

/// `(2·HALF+1)²` patch holding one Gaussian centered at `(HALF + dx, HALF + dy)`.
fn gaussian_patch(dx: f64, dy: f64, amplitude: f64, sx: f64, sy: f64, bg: f64) -> Buffer2<f32> {
    let size = 2 * HALF + 1;
    let cx = HALF as f64 + dx;
    let cy = HALF as f64 + dy;
    Buffer2::from_fn(size, size, |x, y| {
        let ex = (x as f64 - cx).powi(2) / (2.0 * sx * sx);
        let ey = (y as f64 - cy).powi(2) / (2.0 * sy * sy);
        (amplitude * (-(ex + ey)).exp() + bg) as f32
    })
}

fn candidate(x: u32, y: u32, patch: Buffer2<f32>) -> SpotCandidate {
    SpotCandidate {
        x,
        y,
        channel: 1,
        slice: 1,
        frame: 2,
        position: 1,
        index: 0,
        patch: Some(patch),
    }
}

#[test]
fn test_lm_recovers_subpixel_center() {
    let config = PipelineConfig::default();
    let patch = gaussian_patch(0.3, -0.2, 1000.0, 1.3, 1.3, 200.0);

    let fit = GaussianFitter.fit_patch(&patch, &config).unwrap();

    assert!((fit.x - 4.3).abs() < 0.01, "x = {}", fit.x);
    assert!((fit.y - 3.8).abs() < 0.01, "y = {}", fit.y);
    assert!((fit.sigma_x - 1.3).abs() < 0.01);
    assert_eq!(fit.sigma_x, fit.sigma_y);
    assert!((fit.amplitude - 1000.0).abs() < 5.0);
    assert!((fit.background - 200.0).abs() < 1.0);
    assert!(fit.rms_residual < 1.0);
}

#[test]
fn test_elliptical_fit_separates_widths() {
    let config = PipelineConfig {
        shape: FitShape::Elliptical,
        ..Default::default()
    };
    let patch = gaussian_patch(0.0, 0.0, 800.0, 1.0, 1.8, 150.0);

    let fit = GaussianFitter.fit_patch(&patch, &config).unwrap();

    assert!((fit.sigma_x - 1.0).abs() < 0.02, "sx = {}", fit.sigma_x);
    assert!((fit.sigma_y - 1.8).abs() < 0.05, "sy = {}", fit.sigma_y);
}

#[test]
fn test_centroid_mode_is_close_to_truth() {
    let config = PipelineConfig {
        fit_mode: FitMode::Centroid,
        ..Default::default()
    };
    let patch = gaussian_patch(0.4, 0.1, 1000.0, 1.2, 1.2, 100.0);

    let fit = GaussianFitter.fit_patch(&patch, &config).unwrap();

    assert!((fit.x - 4.4).abs() < 0.15, "x = {}", fit.x);
    assert!((fit.y - 4.1).abs() < 0.15, "y = {}", fit.y);
    assert_eq!(fit.iterations, 1);
}

#[test]
fn test_flat_patch_has_no_signal() {
    let patch = Buffer2::new_filled(9, 9, 300.0f32);
    let err = GaussianFitter
        .fit_patch(&patch, &PipelineConfig::default())
        .unwrap_err();
    assert_eq!(err, FitError::NoSignal);
}

#[test]
fn test_tiny_patch_is_rejected() {
    let patch = Buffer2::new_filled(2, 2, 1.0f32);
    let err = GaussianFitter
        .fit_patch(&patch, &PipelineConfig::default())
        .unwrap_err();
    assert_eq!(err, FitError::TooFewPixels(4));
}

#[test]
fn test_sentinel_has_no_patch() {
    let err = GaussianFitter
        .fit(&SpotCandidate::sentinel(), &PipelineConfig::default())
        .unwrap_err();
    assert_eq!(err, FitError::MissingPatch);
}

#[test]
fn test_spot_is_converted_to_plane_and_physical_units() {
    let config = PipelineConfig {
        pixel_size_nm: 100.0,
        photon_conversion_factor: 10.0,
        gain: 20.0,
        base_level: 100.0,
        ..Default::default()
    };
    let patch = gaussian_patch(0.5, 0.0, 1000.0, 1.5, 1.5, 300.0);

    let spot = GaussianFitter.fit(&candidate(50, 60, patch), &config).unwrap();

    assert_eq!((spot.candidate_x, spot.candidate_y), (50, 60));
    assert_eq!(spot.frame, 2);
    assert!((spot.pos.x - 50.5).abs() < 0.01);
    assert!((spot.pos.y - 60.0).abs() < 0.01);
    assert!((spot.pos_nm.x - 5050.0).abs() < 1.0);
    assert!((spot.sigma_x_nm - 150.0).abs() < 1.0);
    assert!((spot.width_nm - 300.0).abs() < 2.0);

    // 2π · 1000 · 1.5² · (10 / 20)
    let expected_photons = std::f64::consts::TAU * 1000.0 * 2.25 * 0.5;
    assert!((spot.photons - expected_photons).abs() / expected_photons < 0.01);
    assert!((spot.background - 100.0).abs() < 1.0);
    assert!(spot.z_center.is_none());
    assert!(spot.quality.iterations > 0);
}

#[test]
fn test_z_calibration_uses_width_difference() {
    let config = PipelineConfig {
        shape: FitShape::Elliptical,
        pixel_size_nm: 100.0,
        z_calibration: Some(ZCalibration {
            slope_nm: 400.0,
            offset_nm: 0.0,
        }),
        ..Default::default()
    };
    let patch = gaussian_patch(0.0, 0.0, 900.0, 1.6, 1.1, 120.0);

    let spot = GaussianFitter.fit(&candidate(20, 20, patch), &config).unwrap();

    // 400 · (160 - 110) / 100
    let z = spot.z_center.unwrap();
    assert!((z - 200.0).abs() < 10.0, "z = {z}");
}
