//! Local-maxima search over a single plane.

use common::Buffer2;
use rayon::prelude::*;

use crate::config::PrefilterType;
use crate::stack::Region;

const PREFILTER_SIGMA: f32 = 1.5;

/// Rows per rayon task in the blur passes.
const ROWS_PER_CHUNK: usize = 8;

/// Finds candidate spot centers in a plane.
///
/// Implementations must be pure: the same inputs always yield the same set of
/// coordinates. Order of the returned coordinates is not significant.
pub trait MaximaFinder: Send + Sync {
    fn find(
        &self,
        plane: &Buffer2<f32>,
        half_size: usize,
        noise_tolerance: f32,
        prefilter: PrefilterType,
        region: Option<Region>,
    ) -> Vec<(u32, u32)>;
}

/// Window-maximum detector.
///
/// A pixel is a maximum when no pixel of its `(2 * half_size + 1)²` window is
/// brighter; among equal pixels the first in scan order wins. It is kept when
/// it rises more than `noise_tolerance` above the window minimum.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMaxima;

impl MaximaFinder for LocalMaxima {
    fn find(
        &self,
        plane: &Buffer2<f32>,
        half_size: usize,
        noise_tolerance: f32,
        prefilter: PrefilterType,
        region: Option<Region>,
    ) -> Vec<(u32, u32)> {
        let width = plane.width();
        let height = plane.height();
        let full = Region::new(0, 0, width, height);
        let Some(region) = region.unwrap_or(full).clamp_to(width, height) else {
            return Vec::new();
        };

        let filtered;
        let image = match prefilter {
            PrefilterType::None => plane,
            PrefilterType::Gaussian1_5 => {
                filtered = gaussian_blur(plane, PREFILTER_SIGMA);
                &filtered
            }
        };

        (region.y..region.y + region.height)
            .into_par_iter()
            .flat_map_iter(|y| {
                (region.x..region.x + region.width)
                    .filter(move |&x| is_maximum(image, x, y, half_size, noise_tolerance))
                    .map(move |x| (x as u32, y as u32))
            })
            .collect()
    }
}

fn is_maximum(image: &Buffer2<f32>, x: usize, y: usize, half_size: usize, tolerance: f32) -> bool {
    let value = image[(x, y)];
    let x0 = x.saturating_sub(half_size);
    let y0 = y.saturating_sub(half_size);
    let x1 = (x + half_size).min(image.width() - 1);
    let y1 = (y + half_size).min(image.height() - 1);

    let mut min = value;
    for wy in y0..=y1 {
        let row = image.row(wy);
        for (wx, &v) in row.iter().enumerate().take(x1 + 1).skip(x0) {
            let before = wy < y || (wy == y && wx < x);
            if v > value || (before && v == value) {
                return false;
            }
            min = min.min(v);
        }
    }

    value - min > tolerance
}

/// Normalized 1-D Gaussian kernel of radius `ceil(3σ)`.
pub(crate) fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as usize;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let d = i as f32 - radius as f32;
            (-d * d / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian blur with clamp-to-edge borders.
pub(crate) fn gaussian_blur(plane: &Buffer2<f32>, sigma: f32) -> Buffer2<f32> {
    let width = plane.width();
    let height = plane.height();
    let kernel = gaussian_kernel_1d(sigma);
    let radius = kernel.len() / 2;

    let mut temp = vec![0.0f32; width * height];
    temp.par_chunks_mut(width * ROWS_PER_CHUNK)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            for (local_y, out_row) in chunk.chunks_mut(width).enumerate() {
                let in_row = plane.row(chunk_idx * ROWS_PER_CHUNK + local_y);
                for (x, out) in out_row.iter_mut().enumerate() {
                    *out = kernel
                        .iter()
                        .enumerate()
                        .map(|(k, &w)| {
                            let sx = (x + k).saturating_sub(radius).min(width - 1);
                            w * in_row[sx]
                        })
                        .sum();
                }
            }
        });

    let mut output = vec![0.0f32; width * height];
    output
        .par_chunks_mut(width * ROWS_PER_CHUNK)
        .enumerate()
        .for_each(|(chunk_idx, chunk)| {
            for (local_y, out_row) in chunk.chunks_mut(width).enumerate() {
                let y = chunk_idx * ROWS_PER_CHUNK + local_y;
                for (k, &w) in kernel.iter().enumerate() {
                    let sy = (y + k).saturating_sub(radius).min(height - 1);
                    let in_row = &temp[sy * width..(sy + 1) * width];
                    for (out, &v) in out_row.iter_mut().zip(in_row) {
                        *out += w * v;
                    }
                }
            }
        });

    Buffer2::new(width, height, output)
}
