//! Fixed-size pool of fitting threads draining the [`SpotQueue`].

use std::ops::AddAssign;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::collector::ResultCollector;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::fit::SpotFitter;
use crate::progress::{ProgressCallback, ProgressStage, report_progress};
use crate::queue::SpotQueue;
use crate::run_state::StopSignal;
use crate::spot::{FittedSpot, SpotCandidate};

/// Fitting progress is reported every this many accepted spots.
const PROGRESS_EVERY: usize = 256;

/// Per-run counters, summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Spots that passed the acceptance filters and were collected.
    pub fitted: usize,
    /// Spots fitted but outside the width or photon window.
    pub rejected: usize,
    /// Candidates the fitter could not fit.
    pub failed: usize,
    /// Candidates drained without fitting after a stop request.
    pub skipped: usize,
}

impl AddAssign for PoolStats {
    fn add_assign(&mut self, rhs: Self) {
        self.fitted += rhs.fitted;
        self.rejected += rhs.rejected;
        self.failed += rhs.failed;
        self.skipped += rhs.skipped;
    }
}

/// Everything a worker thread needs, shared by the whole pool.
#[derive(Clone)]
struct WorkerContext {
    queue: SpotQueue,
    collector: ResultCollector,
    config: Arc<PipelineConfig>,
    fitter: Arc<dyn SpotFitter>,
    stop: StopSignal,
    progress: ProgressCallback,
}

/// Running fitting workers.
///
/// Workers exit once they dequeue the end-of-stream sentinel, relaying it so
/// the next worker sees it too. [`FitWorkerPool::join`] therefore returns only
/// after the dispatcher has pushed its sentinel.
#[derive(Debug)]
pub struct FitWorkerPool {
    handles: Vec<JoinHandle<PoolStats>>,
}

impl FitWorkerPool {
    pub fn spawn(
        workers: usize,
        queue: &SpotQueue,
        collector: &ResultCollector,
        config: Arc<PipelineConfig>,
        fitter: Arc<dyn SpotFitter>,
        stop: StopSignal,
        progress: ProgressCallback,
    ) -> Result<Self> {
        let ctx = WorkerContext {
            queue: queue.clone(),
            collector: collector.clone(),
            config,
            fitter,
            stop,
            progress,
        };

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let name = format!("spotfit-worker-{id}");
            let ctx = ctx.clone();
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(id, ctx))
            {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    // Release the workers that did start before bailing out.
                    queue.relay_sentinel(SpotCandidate::sentinel());
                    for handle in handles {
                        let _ = handle.join();
                    }
                    queue.clear();
                    return Err(Error::Spawn { name, source });
                }
            }
        }

        tracing::debug!(workers = handles.len(), "Fitting pool started");
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit and sum their counters.
    pub fn join(self) -> Result<PoolStats> {
        let mut total = PoolStats::default();
        let mut panicked = None;
        for (id, handle) in self.handles.into_iter().enumerate() {
            match handle.join() {
                Ok(stats) => total += stats,
                Err(_) => panicked = panicked.or(Some(id)),
            }
        }
        match panicked {
            Some(id) => Err(Error::WorkerPanicked(id)),
            None => Ok(total),
        }
    }
}

fn worker_loop(id: usize, ctx: WorkerContext) -> PoolStats {
    tracing::debug!(worker = id, "Fitting worker started");
    let mut stats = PoolStats::default();

    loop {
        let candidate = ctx.queue.pop();
        if candidate.is_sentinel() {
            ctx.queue.relay_sentinel(candidate);
            break;
        }
        if ctx.stop.is_stop_requested() {
            stats.skipped += 1;
            continue;
        }

        let fitted = catch_unwind(AssertUnwindSafe(|| {
            ctx.fitter.fit(&candidate, &ctx.config)
        }));
        match fitted {
            Ok(Ok(spot)) if accepts(&ctx.config, &spot) => {
                ctx.collector.push(spot);
                stats.fitted += 1;
                if stats.fitted % PROGRESS_EVERY == 0 {
                    report_progress(
                        &ctx.progress,
                        ctx.collector.len(),
                        ctx.queue.pushed(),
                        ProgressStage::Fitting,
                    );
                }
            }
            Ok(Ok(_)) => stats.rejected += 1,
            Ok(Err(err)) => {
                tracing::trace!(
                    worker = id,
                    x = candidate.x,
                    y = candidate.y,
                    "Fit failed: {err}"
                );
                stats.failed += 1;
            }
            Err(_) => {
                tracing::error!(
                    worker = id,
                    x = candidate.x,
                    y = candidate.y,
                    frame = candidate.frame,
                    "Fitter panicked; candidate dropped"
                );
                stats.failed += 1;
            }
        }
    }

    tracing::debug!(
        worker = id,
        fitted = stats.fitted,
        rejected = stats.rejected,
        failed = stats.failed,
        skipped = stats.skipped,
        "Fitting worker exited"
    );
    stats
}

/// Post-fit acceptance windows from the config. Both bounds inclusive.
pub(crate) fn accepts(config: &PipelineConfig, spot: &FittedSpot) -> bool {
    if let Some(w) = config.width_filter
        && !(w.min_nm..=w.max_nm).contains(&spot.width_nm)
    {
        return false;
    }
    if let Some(p) = config.photon_filter
        && !(p.min..=p.max).contains(&spot.photons)
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::Buffer2;

    use super::*;
    use crate::config::{PhotonFilter, WidthFilter};
    use crate::fit::FitError;
    use crate::run_state::StateCell;

    /// Reports the candidate's x as width and y as photons.
    struct EchoFitter;

    impl SpotFitter for EchoFitter {
        fn fit(
            &self,
            c: &SpotCandidate,
            _config: &PipelineConfig,
        ) -> std::result::Result<FittedSpot, FitError> {
            if c.x == 0 {
                return Err(FitError::NoSignal);
            }
            if c.x == 13 {
                panic!("fitter bug");
            }
            let mut spot = FittedSpot::from_candidate(c);
            spot.width_nm = c.x as f64;
            spot.photons = c.y as f64;
            Ok(spot)
        }
    }

    fn candidate(x: u32, y: u32) -> SpotCandidate {
        SpotCandidate {
            x,
            y,
            channel: 1,
            slice: 1,
            frame: 1,
            position: 1,
            index: 0,
            patch: Some(Buffer2::new_default(3, 3)),
        }
    }

    fn spawn(
        workers: usize,
        queue: &SpotQueue,
        collector: &ResultCollector,
        config: PipelineConfig,
        stop: StopSignal,
    ) -> FitWorkerPool {
        FitWorkerPool::spawn(
            workers,
            queue,
            collector,
            Arc::new(config),
            Arc::new(EchoFitter),
            stop,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_single_sentinel_terminates_every_worker() {
        let queue = SpotQueue::new(1024);
        let collector = ResultCollector::new();
        let pool = spawn(8, &queue, &collector, PipelineConfig::default(), StopSignal::never());
        assert_eq!(pool.len(), 8);

        // x = 13 makes the fitter panic; keep this stream clean.
        for x in (1..=101).filter(|&x| x != 13) {
            queue.push(candidate(x, 5)).unwrap();
        }
        queue.push_sentinel().unwrap();

        let stats = pool.join().unwrap();

        assert_eq!(
            stats,
            PoolStats {
                fitted: 100,
                ..Default::default()
            }
        );
        assert_eq!(collector.len(), 100);
        assert_eq!(queue.sentinels(), 1);
        // Only the relayed sentinel is left behind.
        assert_eq!(queue.clear(), 1);
    }

    #[test]
    fn test_workers_block_until_sentinel_arrives() {
        let queue = SpotQueue::new(16);
        let collector = ResultCollector::new();
        let pool = spawn(3, &queue, &collector, PipelineConfig::default(), StopSignal::never());

        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.handles.iter().all(|h| !h.is_finished()));

        queue.push_sentinel().unwrap();
        assert_eq!(pool.join().unwrap(), PoolStats::default());
    }

    #[test]
    fn test_filters_and_failures_are_counted() {
        let config = PipelineConfig {
            width_filter: Some(WidthFilter {
                min_nm: 2.0,
                max_nm: 50.0,
            }),
            photon_filter: Some(PhotonFilter {
                min: 10.0,
                max: 100.0,
            }),
            ..Default::default()
        };
        let queue = SpotQueue::new(64);
        let collector = ResultCollector::new();
        let pool = spawn(2, &queue, &collector, config, StopSignal::never());

        queue.push(candidate(0, 20)).unwrap(); // fit fails
        queue.push(candidate(1, 20)).unwrap(); // too narrow
        queue.push(candidate(60, 20)).unwrap(); // too wide
        queue.push(candidate(10, 5)).unwrap(); // too dim
        queue.push(candidate(13, 20)).unwrap(); // fitter panics
        queue.push(candidate(10, 20)).unwrap();
        queue.push(candidate(50, 100)).unwrap(); // inclusive bounds
        queue.push_sentinel().unwrap();

        let stats = pool.join().unwrap();

        assert_eq!(
            stats,
            PoolStats {
                fitted: 2,
                rejected: 3,
                failed: 2,
                skipped: 0,
            }
        );
        let mut widths: Vec<f64> = collector.snapshot().iter().map(|s| s.width_nm).collect();
        widths.sort_by(f64::total_cmp);
        assert_eq!(widths, vec![10.0, 50.0]);
    }

    #[test]
    fn test_stop_drains_without_fitting() {
        let state = StateCell::default();
        state.try_start();
        state.request_stop();

        let queue = SpotQueue::new(64);
        let collector = ResultCollector::new();
        let pool = spawn(4, &queue, &collector, PipelineConfig::default(), state.signal());

        for x in 1..=20 {
            queue.push(candidate(x, 1)).unwrap();
        }
        queue.push_sentinel().unwrap();

        let stats = pool.join().unwrap();
        assert_eq!(stats.skipped, 20);
        assert!(collector.is_empty());
    }
}
