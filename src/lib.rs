#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Preferential Bayesian optimization: find the point a human (or a noisy
//! oracle) prefers most in `[0, 1]^d` using only comparisons between
//! candidates, never numeric scores.
//!
//! The crate couples two pieces:
//!
//! - a **sparse variational Gaussian process** over a latent utility
//!   function, fitted to comparison outcomes through a softmax
//!   (Bradley–Terry style) choice likelihood, and
//! - an **active-learning loop** that alternates fitting the model,
//!   selecting the next comparison with an acquisition criterion, asking
//!   the oracle, and recording the outcome in a replayable journal.
//!
//! # Getting Started
//!
//! ```no_run
//! use prefopt::prelude::*;
//!
//! let config = ExperimentConfig::builder("quadratic", 2)
//!     .algorithm(Algorithm::Emov)
//!     .noise(NoiseType::Logit, 0.05)
//!     .num_max_iter(30)
//!     .results_dir("results")
//!     .build()
//!     .unwrap();
//!
//! let objective = |x: &[f64]| -x.iter().map(|v| (v - 0.3).powi(2)).sum::<f64>();
//! let oracle = SimulatedOracle::from_config(objective, &config);
//!
//! let trace = Experiment::new(&config, 1, oracle).unwrap().run().unwrap();
//! let last = trace.entries.last().unwrap();
//! println!("best point {:?} (value {:?})", last.best_point, last.best_value);
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`Dataset`] | Append-only sequence of comparisons, the only training data. |
//! | [`PreferentialVariationalGp`](model::PreferentialVariationalGp) | Latent utility model with inducing points and a Gaussian variational posterior. |
//! | [`ModelFitter`](model::ModelFitter) | Maximizes the ELBO over variational parameters and kernel hyperparameters. |
//! | [`AcquisitionSelector`](acquisition::AcquisitionSelector) | Proposes the next query (random, EMOV, EPOV, NEI, TS, BALD, `MaxEnt`). |
//! | [`ComparisonOracle`](oracle::ComparisonOracle) | Answers "which of these items wins?". |
//! | [`Experiment`] | Drives `INIT → FIT → RECORD → (SELECT → COMPARE → FIT → RECORD)* → DONE` for one trial index. |
//!
//! # Feature Flags
//!
//! | Flag | What it enables | Default |
//! |------|----------------|---------|
//! | `async` | [`run_trials_parallel`](experiment::run_trials_parallel) via tokio | off |
//! | `tracing` | Structured log events via [`tracing`](https://docs.rs/tracing) at key loop points | off |

/// Emit a `tracing::info!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_info {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::debug!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::warn!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}

pub mod acquisition;
pub mod config;
mod error;
pub mod experiment;
pub mod kernel;
pub mod likelihood;
mod linalg;
pub mod model;
pub mod objective;
pub mod oracle;
mod qmc;
mod rng_util;
pub mod storage;
mod types;

pub use config::{ExperimentConfig, ExperimentConfigBuilder};
pub use error::{Error, Result};
pub use experiment::{Experiment, OptimizationTrace, Phase, RunState, TrialRecord};
pub use types::{Comparison, Dataset, Query};

/// Convenient wildcard import for the most common types.
///
/// ```
/// use prefopt::prelude::*;
/// ```
pub mod prelude {
    pub use crate::acquisition::{
        AcquisitionFunction, AcquisitionOptions, AcquisitionSelector, Algorithm,
    };
    pub use crate::config::{ExperimentConfig, ExperimentConfigBuilder};
    pub use crate::error::{Error, Result};
    #[cfg(feature = "async")]
    pub use crate::experiment::run_trials_parallel;
    pub use crate::experiment::{
        Experiment, OptimizationTrace, Phase, RunState, TraceEntry, TrialOutcome, TrialRecord,
        run_trials,
    };
    pub use crate::kernel::{GammaPrior, Hyperparameters, KernelFactory, PriorConfig};
    pub use crate::likelihood::PreferenceLikelihood;
    pub use crate::model::{
        FitOptimizer, FitOptions, FitReport, ModelFitter, ModelOptions, MultivariateNormal,
        PosteriorPredictive, PreferentialVariationalGp, VariationalModel,
    };
    pub use crate::objective::{Objective, Rosenbrock};
    pub use crate::oracle::{ComparisonOracle, NoiseType, SimulatedOracle, estimate_noise_level};
    pub use crate::storage::{JournalStorage, MemoryStorage, Storage};
    pub use crate::types::{Comparison, Dataset, Query};
}
