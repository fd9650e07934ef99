//! The active-learning loop for one replicate, and its persistence.
//!
//! An [`Experiment`] drives
//! `INIT → FIT → RECORD → (SELECT → COMPARE → FIT → RECORD)* → DONE` for a
//! single trial index. The model is refitted after every data update, so
//! record `k` carries the best-point estimate of the model trained on all
//! comparisons up to and including iteration `k`. Every iteration appends
//! one [`TrialRecord`] to its [`Storage`] before the in-memory state moves
//! on.
//!
//! Queries and answers of iteration `k` draw from a generator seeded by
//! `(trial, k)`; the fit that closes iteration `k` draws from a separate
//! stream seeded the same way. A run reloaded from its records refits the
//! last model from that stream and therefore continues exactly as an
//! uninterrupted run would have.
//!
//! [`run_trials`] executes every trial index of a configuration in turn;
//! `run_trials_parallel` (feature `async`) runs them on blocking worker
//! threads.

mod record;
mod replicates;

use core::fmt;
use std::sync::Arc;
use std::time::Instant;

pub use record::{OptimizationTrace, TraceEntry, TrialRecord};
#[cfg(feature = "async")]
pub use replicates::run_trials_parallel;
pub use replicates::{TrialOutcome, run_trials};

use crate::acquisition::AcquisitionSelector;
use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::model::{ModelFitter, PreferentialVariationalGp};
use crate::oracle::{ComparisonOracle, same_noise};
use crate::rng_util;
use crate::storage::{JournalStorage, MemoryStorage, Storage};
use crate::types::{Comparison, Dataset};

/// Separates the fit streams from the query streams of the same trial.
const FIT_STREAM: u64 = 0x6669_745f_7374_7265;

/// Where an [`Experiment`] stands in its loop.
///
/// Between calls to [`Experiment::step`] the phase is `Init`, `Select` or
/// `Done`. After a failed step it names the phase that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Initial random comparisons not yet made.
    Init,
    /// Fitting the model on the dataset including the newest answers.
    Fit,
    /// Choosing the next query.
    Select,
    /// Waiting for the oracle.
    Compare,
    /// Persisting the iteration.
    Record,
    /// Iteration budget exhausted.
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::Fit => "FIT",
            Phase::Select => "SELECT",
            Phase::Compare => "COMPARE",
            Phase::Record => "RECORD",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Mutable state of one replicate.
#[derive(Clone, Debug)]
pub struct RunState {
    /// Every comparison recorded so far.
    pub dataset: Dataset,
    /// Model fitted on `dataset`. `None` before the first fit and right
    /// after a resume.
    pub model: Option<PreferentialVariationalGp>,
    /// Largest noise-free utility among all queried items, when the oracle
    /// knows utilities.
    pub max_value_within_queries: Option<f64>,
    /// Seed every per-iteration generator is derived from.
    pub seed: u64,
    /// Next iteration to execute.
    pub iteration: usize,
    /// Current phase.
    pub phase: Phase,
}

/// One replicate of an experiment configuration.
///
/// ```
/// use prefopt::prelude::*;
///
/// let config = ExperimentConfig::builder("linear", 1)
///     .algorithm(Algorithm::Random)
///     .noise(NoiseType::Noiseless, 0.0)
///     .num_init_queries(2)
///     .num_max_iter(2)
///     .fit_options(FitOptions { max_iter: 10, num_samples: 4, ..FitOptions::default() })
///     .acquisition_options(AcquisitionOptions {
///         raw_samples: 16,
///         num_restarts: 1,
///         max_local_iter: 5,
///         ..AcquisitionOptions::default()
///     })
///     .build()
///     .unwrap();
/// let oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);
///
/// let mut experiment = Experiment::new(&config, 1, oracle).unwrap();
/// assert_eq!(experiment.step().unwrap(), Phase::Select);
/// assert_eq!(experiment.state().dataset.len(), 2);
/// assert!(experiment.records()[0].best_point.is_some());
///
/// let trace = experiment.run().unwrap();
/// assert_eq!(trace.entries.len(), 3);
/// ```
pub struct Experiment<O> {
    config: ExperimentConfig,
    trial: usize,
    oracle: O,
    storage: Arc<dyn Storage>,
    fitter: ModelFitter,
    selector: AcquisitionSelector,
    state: RunState,
}

impl<O: ComparisonOracle> Experiment<O> {
    /// Set up replicate `trial` of `config`.
    ///
    /// With a `results_dir` the records go to the replicate's journal file:
    /// it is replayed when `config.restart` is set and replaced otherwise.
    /// Without one they are kept in memory.
    ///
    /// # Errors
    ///
    /// - A configuration error if `config` is invalid or `trial` lies
    ///   outside `config.trials()`.
    /// - [`Error::Storage`] if the journal cannot be opened or created.
    /// - [`Error::StateConsistency`] if the journal does not belong to this
    ///   run.
    pub fn new(config: &ExperimentConfig, trial: usize, oracle: O) -> Result<Self> {
        config.validate()?;
        check_trial(config, trial)?;
        let storage: Arc<dyn Storage> = match config.journal_path(trial) {
            Some(path) if config.restart => Arc::new(JournalStorage::open(path)?),
            Some(path) => Arc::new(JournalStorage::create(path)?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::with_storage(config, trial, oracle, storage)
    }

    /// Set up replicate `trial` of `config` on an explicit storage backend.
    ///
    /// Records already in `storage` are replayed into the dataset, and the
    /// run continues at the iteration after the last one stored.
    ///
    /// # Errors
    ///
    /// - A configuration error if `config` is invalid, `trial` lies
    ///   outside `config.trials()`, or the oracle reports comparison noise
    ///   other than `config.comp_noise_type` at `config.comp_noise`.
    /// - [`Error::StateConsistency`] if `storage` holds records while
    ///   `config.restart` is unset, or if the records belong to another
    ///   trial, skip an iteration, or do not match the configured shape.
    pub fn with_storage(
        config: &ExperimentConfig,
        trial: usize,
        oracle: O,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        check_trial(config, trial)?;
        check_noise(config, &oracle)?;

        let records = storage.records();
        if !records.is_empty() && !config.restart {
            return Err(Error::StateConsistency(format!(
                "storage for trial {trial} already holds {} records; enable restart to resume",
                records.len()
            )));
        }

        let mut dataset = Dataset::new(config.input_dim, config.batch_size)?;
        replay(config, trial, &records, &mut dataset)?;

        let iteration = records.len();
        let phase = if iteration == 0 {
            Phase::Init
        } else if iteration > config.num_max_iter {
            Phase::Done
        } else {
            Phase::Select
        };
        if iteration > 0 {
            trace_info!(trial, iteration, comparisons = dataset.len(), "resuming trial");
        }

        Ok(Self {
            config: config.clone(),
            trial,
            oracle,
            storage,
            fitter: ModelFitter::new(config.fit),
            selector: AcquisitionSelector::new(config.algo, config.acquisition),
            state: RunState {
                dataset,
                model: None,
                max_value_within_queries: records.last().and_then(|r| r.max_value_within_queries),
                seed: trial as u64,
                iteration,
                phase,
            },
        })
    }

    /// Replace the query selector, e.g. with one built by
    /// [`AcquisitionSelector::scored_by`]. Best-point estimates also use
    /// the new selector's optimizer options.
    #[must_use]
    pub fn with_selector(mut self, selector: AcquisitionSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Replicate index.
    #[must_use]
    pub fn trial(&self) -> usize {
        self.trial
    }

    /// The configuration this replicate runs.
    #[must_use]
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// The oracle answering comparisons.
    #[must_use]
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Every record stored so far.
    #[must_use]
    pub fn records(&self) -> Vec<TrialRecord> {
        self.storage.records()
    }

    /// Best-point estimates recorded so far.
    #[must_use]
    pub fn trace(&self) -> OptimizationTrace {
        OptimizationTrace::from_records(self.trial, &self.storage.records())
    }

    /// Execute one full iteration and return the phase to run next.
    ///
    /// Iteration 0 makes the initial random comparisons and fits the first
    /// model. Every later iteration runs `SELECT → COMPARE → FIT → RECORD`,
    /// refitting the model of the current data first if it was not kept in
    /// memory (after a resume). From `Done` it does nothing.
    ///
    /// # Errors
    ///
    /// Any error from fitting, the oracle or storage. The phase is left at
    /// the one that failed and nothing of the iteration is recorded.
    pub fn step(&mut self) -> Result<Phase> {
        if self.state.phase == Phase::Done {
            return Ok(Phase::Done);
        }
        if self.state.iteration == 0 {
            self.initialize()?;
        } else {
            self.iterate()?;
        }
        Ok(self.state.phase)
    }

    /// Run until the iteration budget is exhausted and return the trace.
    ///
    /// # Errors
    ///
    /// The first error from [`step`](Self::step).
    pub fn run(mut self) -> Result<OptimizationTrace> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "run_trial",
            trial = self.trial,
            problem = %self.config.problem,
            algo = %self.config.algo
        )
        .entered();

        while self.step()? != Phase::Done {}
        trace_info!(trial = self.trial, iterations = self.state.iteration, "trial finished");
        Ok(self.trace())
    }

    fn iteration_rng(&self) -> fastrand::Rng {
        fastrand::Rng::with_seed(rng_util::mix_seed(
            self.state.seed,
            self.state.iteration as u64,
        ))
    }

    /// Generator of the fit that closes `iteration`.
    fn fit_rng(&self, iteration: usize) -> fastrand::Rng {
        fastrand::Rng::with_seed(rng_util::mix_seed(
            self.state.seed ^ FIT_STREAM,
            iteration as u64,
        ))
    }

    fn initialize(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut rng = self.iteration_rng();
        let d = self.config.input_dim;
        let q = self.config.batch_size;

        self.state.phase = Phase::Init;
        let mut comparisons = Vec::with_capacity(self.config.num_init_queries());
        for _ in 0..self.config.num_init_queries() {
            let query = AcquisitionSelector::random_query(d, q, &mut rng)?;
            let winner = self.oracle.compare(&query, &mut rng)?;
            comparisons.push(Comparison::new(query, winner)?);
        }
        let mut dataset = self.state.dataset.clone();
        dataset.extend(comparisons.iter().cloned())?;

        self.state.phase = Phase::Fit;
        let mut fit_rng = self.fit_rng(0);
        let model = self.fit_model(&dataset, None, &mut fit_rng)?;
        let (best_point, best_value) = self.estimate(&model, &mut fit_rng);
        let max_value_within_queries = self.max_value_within(&comparisons);

        self.state.phase = Phase::Record;
        let record = TrialRecord {
            trial: self.trial,
            iteration: 0,
            comparisons,
            best_point,
            best_value,
            max_value_within_queries,
            elapsed_secs: started.elapsed().as_secs_f64(),
            degraded: false,
        };
        self.storage.push(record)?;
        self.state.dataset = dataset;
        self.state.model = Some(model);
        self.state.max_value_within_queries = max_value_within_queries;
        trace_info!(
            trial = self.trial,
            comparisons = self.state.dataset.len(),
            best_value = best_value.unwrap_or(f64::NAN),
            "initial comparisons recorded"
        );
        self.advance();
        Ok(())
    }

    fn iterate(&mut self) -> Result<()> {
        let started = Instant::now();
        let iteration = self.state.iteration;
        let mut rng = self.iteration_rng();

        if self.state.model.is_none() {
            self.state.phase = Phase::Fit;
            let mut fit_rng = self.fit_rng(iteration - 1);
            let model = self.fit_model(&self.state.dataset, None, &mut fit_rng)?;
            trace_debug!(trial = self.trial, iteration, "refitted model of resumed data");
            self.state.model = Some(model);
        }
        let Some(model) = self.state.model.as_ref() else {
            return Err(Error::Internal("no model after fitting"));
        };

        self.state.phase = Phase::Select;
        let (query, degraded) = match self.selector.select(model, &mut rng) {
            Ok(query) => (query, false),
            Err(Error::AcquisitionOptimization) => {
                trace_warn!(
                    trial = self.trial,
                    iteration,
                    "acquisition found no finite candidate, querying at random"
                );
                let query = AcquisitionSelector::random_query(
                    self.config.input_dim,
                    self.config.batch_size,
                    &mut rng,
                )?;
                (query, true)
            }
            Err(e) => return Err(e),
        };

        self.state.phase = Phase::Compare;
        let winner = self.oracle.compare(&query, &mut rng)?;
        let comparison = Comparison::new(query, winner)?;
        let mut dataset = self.state.dataset.clone();
        dataset.push(comparison.clone())?;

        self.state.phase = Phase::Fit;
        let mut fit_rng = self.fit_rng(iteration);
        let next = self.fit_model(&dataset, Some(model), &mut fit_rng)?;
        let (best_point, best_value) = self.estimate(&next, &mut fit_rng);
        let max_value_within_queries = self.max_value_within(core::slice::from_ref(&comparison));

        self.state.phase = Phase::Record;
        let record = TrialRecord {
            trial: self.trial,
            iteration,
            comparisons: vec![comparison],
            best_point,
            best_value,
            max_value_within_queries,
            elapsed_secs: started.elapsed().as_secs_f64(),
            degraded,
        };
        self.storage.push(record)?;
        self.state.dataset = dataset;
        self.state.model = Some(next);
        self.state.max_value_within_queries = max_value_within_queries;
        trace_info!(
            trial = self.trial,
            iteration,
            best_value = best_value.unwrap_or(f64::NAN),
            degraded,
            "iteration recorded"
        );
        self.advance();
        Ok(())
    }

    /// Build and fit a model on `dataset`, extending `previous` when given.
    fn fit_model(
        &self,
        dataset: &Dataset,
        previous: Option<&PreferentialVariationalGp>,
        rng: &mut fastrand::Rng,
    ) -> Result<PreferentialVariationalGp> {
        let model = match previous {
            Some(previous) => {
                let known = previous.dataset().len();
                previous.rebuild(&dataset.comparisons()[known..], rng)?
            }
            None => PreferentialVariationalGp::new(dataset, self.config.model, rng)?,
        };
        let (model, report) = self.fitter.fit(model, rng)?;
        trace_debug!(
            trial = self.trial,
            comparisons = dataset.len(),
            fit_attempts = report.attempts,
            objective = report.final_objective().unwrap_or(f64::NAN),
            "model fitted"
        );
        #[cfg(not(feature = "tracing"))]
        let _ = &report;
        Ok(model)
    }

    /// Maximizer of the posterior mean and its noise-free utility.
    fn estimate(
        &self,
        model: &PreferentialVariationalGp,
        rng: &mut fastrand::Rng,
    ) -> (Option<Vec<f64>>, Option<f64>) {
        let best_point = self.selector.maximize_posterior_mean(model, rng).ok();
        let best_value = best_point
            .as_ref()
            .and_then(|x| self.oracle.ground_truth(x));
        (best_point, best_value)
    }

    /// Running maximum of the noise-free utility over every queried item,
    /// including the items of `comparisons`.
    fn max_value_within(&self, comparisons: &[Comparison]) -> Option<f64> {
        comparisons
            .iter()
            .flat_map(|c| c.query.items())
            .filter_map(|x| self.oracle.ground_truth(x))
            .fold(self.state.max_value_within_queries, |best, v| {
                Some(best.map_or(v, |b| b.max(v)))
            })
    }

    fn advance(&mut self) {
        self.state.iteration += 1;
        self.state.phase = if self.state.iteration > self.config.num_max_iter {
            Phase::Done
        } else {
            Phase::Select
        };
    }
}

fn check_trial(config: &ExperimentConfig, trial: usize) -> Result<()> {
    if config.trials().contains(&trial) {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "trial {trial} lies outside the configured range {}..={}",
            config.first_trial, config.last_trial
        )))
    }
}

fn check_noise<O: ComparisonOracle>(config: &ExperimentConfig, oracle: &O) -> Result<()> {
    let configured = (config.comp_noise_type, config.comp_noise);
    match oracle.noise() {
        Some(actual) if !same_noise(actual, configured) => Err(Error::InvalidConfig(format!(
            "oracle applies {} noise with sigma {} but the configuration asks for {} with sigma {}",
            actual.0, actual.1, configured.0, configured.1
        ))),
        _ => Ok(()),
    }
}

/// Rebuild the dataset from stored records, checking that they form a
/// prefix of a run of `config` for `trial`.
fn replay(
    config: &ExperimentConfig,
    trial: usize,
    records: &[TrialRecord],
    dataset: &mut Dataset,
) -> Result<()> {
    for (expected, record) in records.iter().enumerate() {
        if record.trial != trial {
            return Err(Error::StateConsistency(format!(
                "record {expected} belongs to trial {}, expected trial {trial}",
                record.trial
            )));
        }
        if record.iteration != expected {
            return Err(Error::StateConsistency(format!(
                "expected iteration {expected} but found iteration {}",
                record.iteration
            )));
        }
        let expected_len = if expected == 0 {
            config.num_init_queries()
        } else {
            1
        };
        if record.comparisons.len() != expected_len {
            return Err(Error::StateConsistency(format!(
                "iteration {expected} holds {} comparisons, expected {expected_len}",
                record.comparisons.len()
            )));
        }
        if let Some(c) = record
            .comparisons
            .iter()
            .find(|c| c.winner >= c.query.len())
        {
            return Err(Error::StateConsistency(format!(
                "iteration {expected} names winner {} of a {}-item query",
                c.winner,
                c.query.len()
            )));
        }
        if let Some(x) = &record.best_point
            && x.len() != config.input_dim
        {
            return Err(Error::StateConsistency(format!(
                "iteration {expected} has a {}-dimensional best point, expected {}",
                x.len(),
                config.input_dim
            )));
        }
        dataset
            .extend(record.comparisons.iter().cloned())
            .map_err(|e| Error::StateConsistency(format!("iteration {expected}: {e}")))?;
    }
    if records.len() > config.num_max_iter + 1 {
        return Err(Error::StateConsistency(format!(
            "storage holds {} iterations but the run allows only {}",
            records.len() - 1,
            config.num_max_iter
        )));
    }
    Ok(())
}
