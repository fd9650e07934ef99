//! Run configuration, validated once at load or build time.
//!
//! An [`ExperimentConfig`] names every knob of one experiment: the problem,
//! the comparison noise, the selection strategy, the iteration budget, the
//! range of replicate (trial) indices, and the nested model, fitter and
//! acquisition options. Enumerated fields only accept their listed values,
//! so a typo in a JSON file fails at load time rather than mid-run.
//!
//! ```
//! use prefopt::prelude::*;
//!
//! let config = ExperimentConfig::builder("rosenbrock", 3)
//!     .algorithm(Algorithm::Nei)
//!     .noise(NoiseType::Logit, 7.0534)
//!     .num_max_iter(150)
//!     .trials(1, 30)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.num_init_queries(), 8);
//! assert!(config.journal_path(1).is_none());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionOptions, Algorithm};
use crate::error::{Error, Result};
use crate::model::{FitOptions, ModelOptions};
use crate::oracle::NoiseType;

/// Everything needed to run (or resume) one experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Problem name; also the first path component of journal files.
    pub problem: String,
    /// Input dimension `d`.
    pub input_dim: usize,
    /// Comparison noise model.
    #[serde(default)]
    pub comp_noise_type: NoiseType,
    /// Comparison noise scale `σ`.
    #[serde(default)]
    pub comp_noise: f64,
    /// Query selection strategy.
    #[serde(default)]
    pub algo: Algorithm,
    /// Items per query `q`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Random comparisons made before the first model fit; `None` means
    /// `2 (d + 1)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_init_queries: Option<usize>,
    /// Number of model-guided iterations after the initial comparisons.
    pub num_max_iter: usize,
    /// First replicate index (inclusive).
    #[serde(default = "default_trial")]
    pub first_trial: usize,
    /// Last replicate index (inclusive).
    #[serde(default = "default_trial")]
    pub last_trial: usize,
    /// Resume from an existing journal instead of starting over.
    #[serde(default)]
    pub restart: bool,
    /// Root directory for journals. `None` keeps records in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_dir: Option<PathBuf>,
    /// Model construction options.
    #[serde(default)]
    pub model: ModelOptions,
    /// Fitter options.
    #[serde(default)]
    pub fit: FitOptions,
    /// Acquisition optimizer options.
    #[serde(default)]
    pub acquisition: AcquisitionOptions,
}

fn default_batch_size() -> usize {
    2
}

fn default_trial() -> usize {
    1
}

impl ExperimentConfig {
    /// Start building a configuration for `problem` in `[0, 1]^input_dim`.
    #[must_use]
    pub fn builder(problem: impl Into<String>, input_dim: usize) -> ExperimentConfigBuilder {
        ExperimentConfigBuilder::new(problem.into(), input_dim)
    }

    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be read or parsed, or a
    /// configuration error from [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its valid range.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDimension`] if `input_dim == 0`.
    /// - [`Error::InvalidBatchSize`] if `batch_size < 2`.
    /// - [`Error::InvalidBounds`] if `first_trial > last_trial`.
    /// - [`Error::InvalidConfig`] for an empty problem name, zero initial
    ///   queries, a negative or non-finite noise scale, or invalid nested
    ///   options.
    pub fn validate(&self) -> Result<()> {
        if self.problem.trim().is_empty() {
            return Err(Error::InvalidConfig("problem name must not be empty".into()));
        }
        if self.input_dim == 0 {
            return Err(Error::InvalidDimension(self.input_dim));
        }
        if self.batch_size < 2 {
            return Err(Error::InvalidBatchSize(self.batch_size));
        }
        if self.first_trial > self.last_trial {
            return Err(Error::InvalidBounds {
                low: self.first_trial,
                high: self.last_trial,
            });
        }
        if self.num_init_queries == Some(0) {
            return Err(Error::InvalidConfig(
                "num_init_queries must be at least 1".into(),
            ));
        }
        if !self.comp_noise.is_finite() || self.comp_noise < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "comp_noise must be finite and non-negative, got {}",
                self.comp_noise
            )));
        }
        self.fit.validate()?;
        self.acquisition.validate()?;
        Ok(())
    }

    /// Random comparisons made before the first fit.
    #[must_use]
    pub fn num_init_queries(&self) -> usize {
        self.num_init_queries.unwrap_or(2 * (self.input_dim + 1))
    }

    /// Replicate indices `first_trial..=last_trial`.
    #[must_use]
    pub fn trials(&self) -> core::ops::RangeInclusive<usize> {
        self.first_trial..=self.last_trial
    }

    /// Journal file for replicate `trial`:
    /// `results_dir/problem/algo/trial_<trial>.jsonl`.
    #[must_use]
    pub fn journal_path(&self, trial: usize) -> Option<PathBuf> {
        self.results_dir.as_ref().map(|dir| {
            dir.join(&self.problem)
                .join(self.algo.id())
                .join(format!("trial_{trial}.jsonl"))
        })
    }
}

/// Fluent builder for [`ExperimentConfig`]. Created via
/// [`ExperimentConfig::builder`].
///
/// # Defaults
///
/// - Algorithm: EMOV, noise: logit with `σ = 0`
/// - Batch size 2, `2 (d + 1)` initial queries, 50 iterations
/// - Trial range `1..=1`, fresh start, records kept in memory
#[derive(Clone, Debug)]
pub struct ExperimentConfigBuilder {
    config: ExperimentConfig,
}

impl ExperimentConfigBuilder {
    fn new(problem: String, input_dim: usize) -> Self {
        Self {
            config: ExperimentConfig {
                problem,
                input_dim,
                comp_noise_type: NoiseType::default(),
                comp_noise: 0.0,
                algo: Algorithm::default(),
                batch_size: default_batch_size(),
                num_init_queries: None,
                num_max_iter: 50,
                first_trial: default_trial(),
                last_trial: default_trial(),
                restart: false,
                results_dir: None,
                model: ModelOptions::default(),
                fit: FitOptions::default(),
                acquisition: AcquisitionOptions::default(),
            },
        }
    }

    /// Query selection strategy.
    #[must_use]
    pub fn algorithm(mut self, algo: Algorithm) -> Self {
        self.config.algo = algo;
        self
    }

    /// Comparison noise type and scale `σ`.
    #[must_use]
    pub fn noise(mut self, noise_type: NoiseType, sigma: f64) -> Self {
        self.config.comp_noise_type = noise_type;
        self.config.comp_noise = sigma;
        self
    }

    /// Items per query.
    #[must_use]
    pub fn batch_size(mut self, q: usize) -> Self {
        self.config.batch_size = q;
        self
    }

    /// Random comparisons before the first fit.
    #[must_use]
    pub fn num_init_queries(mut self, n: usize) -> Self {
        self.config.num_init_queries = Some(n);
        self
    }

    /// Model-guided iterations.
    #[must_use]
    pub fn num_max_iter(mut self, n: usize) -> Self {
        self.config.num_max_iter = n;
        self
    }

    /// Replicate index range (inclusive).
    #[must_use]
    pub fn trials(mut self, first: usize, last: usize) -> Self {
        self.config.first_trial = first;
        self.config.last_trial = last;
        self
    }

    /// Resume existing journals instead of replacing them.
    #[must_use]
    pub fn restart(mut self, restart: bool) -> Self {
        self.config.restart = restart;
        self
    }

    /// Persist records as JSONL journals under `dir`.
    #[must_use]
    pub fn results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.results_dir = Some(dir.into());
        self
    }

    /// Model construction options.
    #[must_use]
    pub fn model_options(mut self, options: ModelOptions) -> Self {
        self.config.model = options;
        self
    }

    /// Fitter options.
    #[must_use]
    pub fn fit_options(mut self, options: FitOptions) -> Self {
        self.config.fit = options;
        self
    }

    /// Acquisition optimizer options.
    #[must_use]
    pub fn acquisition_options(mut self, options: AcquisitionOptions) -> Self {
        self.config.acquisition = options;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Any error from [`ExperimentConfig::validate`].
    pub fn build(self) -> Result<ExperimentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
