//! Plane scanning: maxima detection, candidate ordering and enqueueing.
//!
//! The dispatcher walks channel → slice → frame (frame innermost) of the
//! stack currently shown by the host, finds maxima in every plane, and pushes
//! the surviving candidates onto the [`SpotQueue`] in ascending `(x, y)`
//! order. A run ends with exactly one sentinel, pushed by
//! [`Dispatcher::finish`] even when the scan failed.

use std::thread;

use common::Buffer2;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::maxima::MaximaFinder;
use crate::progress::{ProgressCallback, ProgressStage, report_progress};
use crate::queue::SpotQueue;
use crate::run_state::StopSignal;
use crate::spot::SpotCandidate;
use crate::stack::{Region, StackSource};

/// Counters accumulated over every plane a dispatcher scans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Planes fully scanned.
    pub planes: usize,
    /// Candidates pushed onto the queue.
    pub candidates: usize,
    /// Maxima dropped for lying within `half_size` of an edge.
    pub edge_rejected: usize,
    /// Times the dispatcher slept because the queue was too deep.
    pub backpressure_pauses: usize,
}

pub struct Dispatcher<'a> {
    source: &'a dyn StackSource,
    finder: &'a dyn MaximaFinder,
    config: &'a PipelineConfig,
    queue: &'a SpotQueue,
    stop: &'a StopSignal,
    regions: &'a [Region],
    progress: ProgressCallback,
    /// Planes expected over the whole run, for progress reporting.
    planes_total: usize,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        source: &'a dyn StackSource,
        finder: &'a dyn MaximaFinder,
        config: &'a PipelineConfig,
        queue: &'a SpotQueue,
        stop: &'a StopSignal,
    ) -> Self {
        Self {
            source,
            finder,
            config,
            queue,
            stop,
            regions: &[],
            progress: None,
            planes_total: 0,
        }
    }

    /// Search only inside these regions; candidates from all of them are merged.
    pub fn with_regions(mut self, regions: &'a [Region]) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback, planes_total: usize) -> Self {
        self.progress = progress;
        self.planes_total = planes_total;
        self
    }

    /// Planes one position contributes after channel skipping.
    pub fn planes_per_position(&self) -> usize {
        let dims = self.source.dims();
        let channels = (1..=dims.channels)
            .filter(|&c| !self.config.skips_channel(c))
            .count();
        channels * dims.slices * dims.frames
    }

    /// Scan one position and terminate the stream.
    pub fn dispatch(&self, position: i32, stats: &mut DispatchStats) -> Result<()> {
        let scanned = self.scan_position(position, stats);
        let finished = self.finish();
        scanned.and(finished)
    }

    /// Scan every requested plane of the displayed position.
    ///
    /// Stops early, without a sentinel, on a stop request or a failed plane read.
    pub fn scan_position(&self, position: i32, stats: &mut DispatchStats) -> Result<()> {
        let dims = self.source.dims();
        tracing::debug!(
            position,
            channels = dims.channels,
            slices = dims.slices,
            frames = dims.frames,
            "Scanning position"
        );

        for channel in 1..=dims.channels {
            if self.config.skips_channel(channel) {
                continue;
            }
            for slice in 1..=dims.slices {
                for frame in 1..=dims.frames {
                    if self.stop.is_stop_requested() {
                        return Err(Error::Interrupted);
                    }
                    self.dispatch_plane(channel, slice, frame, position, stats)?;
                }
            }
        }
        Ok(())
    }

    /// Push the end-of-stream sentinel. Call exactly once per run.
    pub fn finish(&self) -> Result<()> {
        self.queue.push_sentinel()
    }

    fn dispatch_plane(
        &self,
        channel: usize,
        slice: usize,
        frame: usize,
        position: i32,
        stats: &mut DispatchStats,
    ) -> Result<()> {
        let plane = self
            .source
            .plane(channel, slice, frame)
            .inspect_err(|err| {
                tracing::error!(channel, slice, frame, "Plane read failed: {err}");
            })?;
        let half = self.config.half_size;

        let mut maxima = if self.regions.is_empty() {
            self.find(&plane, None)
        } else {
            self.regions
                .iter()
                .flat_map(|region| self.find(&plane, Some(*region)))
                .collect()
        };
        maxima.sort_unstable();
        maxima.dedup();

        let depth = self.queue.len();
        if depth > self.config.backpressure_threshold {
            tracing::warn!(
                depth,
                threshold = self.config.backpressure_threshold,
                "Spot queue is deep; pausing detection"
            );
            stats.backpressure_pauses += 1;
            thread::sleep(self.config.backpressure_pause());
        }

        let width = plane.width();
        let height = plane.height();
        let mut index = 0;
        for (x, y) in maxima {
            let (px, py) = (x as usize, y as usize);
            let inside = px > half && px + half < width && py > half && py + half < height;
            let patch = if inside { plane.patch(px, py, half) } else { None };
            let Some(patch) = patch else {
                stats.edge_rejected += 1;
                continue;
            };

            self.queue.push(SpotCandidate {
                x,
                y,
                channel: channel as i32,
                slice: slice as i32,
                frame: frame as i32,
                position,
                index,
                patch: Some(patch),
            })?;
            index += 1;
        }

        stats.planes += 1;
        stats.candidates += index;
        tracing::debug!(
            channel,
            slice,
            frame,
            position,
            candidates = index,
            "Plane dispatched"
        );
        report_progress(
            &self.progress,
            stats.planes,
            self.planes_total.max(stats.planes),
            ProgressStage::Detecting,
        );
        Ok(())
    }

    fn find(&self, plane: &Buffer2<f32>, region: Option<Region>) -> Vec<(u32, u32)> {
        self.finder.find(
            plane,
            self.config.half_size,
            self.config.noise_tolerance,
            self.config.prefilter,
            region,
        )
    }
}
