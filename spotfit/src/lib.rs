//! Spotfit - concurrent spot detection and sub-pixel fitting for microscopy stacks.
//!
//! A run walks every channel, slice and frame of the displayed stack (and,
//! with a [`DisplayHost`], every requested stage position), finds local
//! maxima, and hands each candidate's pixel patch to a pool of fitting
//! threads. Fitted spots are collected and passed to a [`ReportSink`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use spotfit::{JsonReportSink, Orchestrator, PipelineConfig, RunParams};
//!
//! let config = PipelineConfig::load("spotfit.yaml")?;
//! let params = RunParams::from_config(&config).with_positions("1-3");
//! let sink = Arc::new(JsonReportSink::new("spots.json"));
//! let orchestrator = Orchestrator::new(config, params, stack, sink).with_host(viewer);
//!
//! orchestrator.init()?;
//! orchestrator.join(Duration::from_secs(600));
//! println!("{:?}", orchestrator.summary());
//! ```

mod collector;
mod config;
mod dispatcher;
mod error;
mod fit;
mod maxima;
mod orchestrator;
mod position_sync;
mod progress;
mod queue;
mod report;
mod run_state;
mod spot;
mod stack;
mod worker_pool;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{
    ConfigError, FitMode, FitShape, PhotonFilter, PipelineConfig, PrefilterType, WidthFilter,
    ZCalibration,
};
pub use error::{Error, Result};

// ============================================================================
// Pipeline stages
// ============================================================================

pub use collector::ResultCollector;
pub use dispatcher::{DispatchStats, Dispatcher};
pub use fit::{FitError, GaussianFitter, SpotFitter};
pub use maxima::{LocalMaxima, MaximaFinder};
pub use position_sync::PositionSync;
pub use queue::SpotQueue;
pub use spot::{FitQuality, FittedSpot, SpotCandidate};
pub use worker_pool::{FitWorkerPool, PoolStats};

// ============================================================================
// Host interfaces
// ============================================================================

pub use stack::{DisplayHost, Region, StackDims, StackSource};

// ============================================================================
// Lifecycle and reporting
// ============================================================================

pub use orchestrator::{Orchestrator, PositionRange, RunParams};
pub use progress::{Progress, ProgressCallback, ProgressStage};
pub use report::{JsonReportSink, ReportSink, RunOutcome, RunReport, RunSummary, time_axis, z_range};
pub use run_state::{RunState, StopSignal};
