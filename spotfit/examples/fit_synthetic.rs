//! Detect and fit spots on a generated noisy stack.
//!
//! ```text
//! cargo run -p spotfit --example fit_synthetic -- [config.yaml] [out.json]
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::Buffer2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spotfit::{
    JsonReportSink, Orchestrator, PipelineConfig, Progress, ProgressStage, RunOutcome, RunParams,
    StackDims, StackSource,
};

const WIDTH: usize = 256;
const HEIGHT: usize = 256;
const FRAMES: usize = 20;
const SPOTS_PER_FRAME: usize = 40;

/// Gaussian blobs at random places over a noisy camera background.
struct NoisyStack {
    dims: StackDims,
    spots: Vec<Vec<(f64, f64)>>,
    seed: u64,
}

impl NoisyStack {
    fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let spots = (0..FRAMES)
            .map(|_| {
                (0..SPOTS_PER_FRAME)
                    .map(|_| {
                        (
                            rng.random_range(8.0..(WIDTH - 8) as f64),
                            rng.random_range(8.0..(HEIGHT - 8) as f64),
                        )
                    })
                    .collect()
            })
            .collect();

        Self {
            dims: StackDims {
                width: WIDTH,
                height: HEIGHT,
                channels: 1,
                slices: 1,
                frames: FRAMES,
            },
            spots,
            seed,
        }
    }
}

impl StackSource for NoisyStack {
    fn title(&self) -> String {
        format!("noisy_{}", self.seed)
    }

    fn dims(&self) -> StackDims {
        self.dims
    }

    fn plane(&self, _channel: usize, _slice: usize, frame: usize) -> spotfit::Result<Buffer2<f32>> {
        let spots = &self.spots[frame - 1];
        let mut rng = StdRng::seed_from_u64(self.seed ^ frame as u64);
        Ok(Buffer2::from_fn(WIDTH, HEIGHT, |x, y| {
            let signal: f64 = spots
                .iter()
                .map(|&(sx, sy)| {
                    let r2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
                    800.0 * (-r2 / (2.0 * 1.3 * 1.3)).exp()
                })
                .sum();
            (100.0 + signal + rng.random_range(-15.0..15.0)) as f32
        }))
    }
}

fn main() -> anyhow::Result<()> {
    common::log_setup::setup_logging("info");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => PipelineConfig::default(),
    };
    let output = args.next().unwrap_or_else(|| "spots.json".into());

    let params = RunParams::from_config(&config);
    let orchestrator = Orchestrator::new(
        config,
        params,
        Arc::new(NoisyStack::new(7)),
        Arc::new(JsonReportSink::new(&output)),
    )
    .with_progress(Some(Arc::new(|p: Progress| {
        if p.stage == ProgressStage::Detecting {
            tracing::debug!("Scanned {}/{} planes", p.current, p.total);
        }
    })));

    orchestrator.init()?;
    if !orchestrator.join(Duration::from_secs(300)) {
        orchestrator.stop();
        orchestrator.wait();
    }

    let summary = orchestrator
        .summary()
        .context("run finished without a summary")?;
    println!(
        "{}: {} spots from {} candidates over {} planes in {:.2}s ({:.0} spots/sec.)",
        summary.outcome,
        summary.spots,
        summary.candidates,
        summary.planes,
        summary.elapsed.as_secs_f64(),
        summary.spots_per_second
    );
    if summary.outcome == RunOutcome::Completed {
        println!("Report written to {output}");
    }

    Ok(())
}
