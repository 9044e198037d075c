//! Error types for the detection/fitting pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that abort (part of) a run.
///
/// Per-spot fit failures are not represented here; see [`crate::FitError`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid position range '{0}'")]
    InvalidPositionRange(String),

    #[error("Out of memory while reading plane c={channel} z={slice} t={frame}")]
    Allocation {
        channel: usize,
        slice: usize,
        frame: usize,
    },

    #[error("Run interrupted")]
    Interrupted,

    #[error("Display did not confirm stage position {position} within {waited:?}")]
    PositionSyncTimeout { position: usize, waited: Duration },

    #[error("Another position change is already being awaited")]
    PositionSyncBusy,

    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Fitting worker {0} panicked")]
    WorkerPanicked(usize),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
