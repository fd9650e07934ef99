use super::{Experiment, OptimizationTrace};
use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::oracle::ComparisonOracle;

/// Result of one replicate. A failed replicate does not stop the others.
#[derive(Debug)]
pub struct TrialOutcome {
    /// Replicate index.
    pub trial: usize,
    /// The trace, or the error that ended the replicate.
    pub result: Result<OptimizationTrace>,
}

impl TrialOutcome {
    /// Whether the replicate ran to completion.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run every replicate in `config.trials()` in order.
///
/// `oracle_factory` builds a fresh oracle per trial index, so replicates
/// share no mutable state.
///
/// ```
/// use prefopt::prelude::*;
///
/// let config = ExperimentConfig::builder("linear", 1)
///     .algorithm(Algorithm::Random)
///     .num_init_queries(2)
///     .num_max_iter(1)
///     .trials(1, 2)
///     .fit_options(FitOptions { max_iter: 5, num_samples: 2, ..FitOptions::default() })
///     .acquisition_options(AcquisitionOptions {
///         raw_samples: 8,
///         num_restarts: 1,
///         max_local_iter: 2,
///         ..AcquisitionOptions::default()
///     })
///     .build()
///     .unwrap();
///
/// let outcomes = run_trials(&config, |_| {
///     SimulatedOracle::from_config(|x: &[f64]| x[0], &config)
/// });
/// assert_eq!(outcomes.len(), 2);
/// assert!(outcomes.iter().all(TrialOutcome::is_ok));
/// ```
pub fn run_trials<O, F>(config: &ExperimentConfig, mut oracle_factory: F) -> Vec<TrialOutcome>
where
    O: ComparisonOracle,
    F: FnMut(usize) -> O,
{
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!(
        "run_trials",
        first = config.first_trial,
        last = config.last_trial
    )
    .entered();

    config
        .trials()
        .map(|trial| {
            let result =
                Experiment::new(config, trial, oracle_factory(trial)).and_then(Experiment::run);
            if result.is_err() {
                trace_warn!(trial, error = ?result.as_ref().err(), "trial failed");
            }
            TrialOutcome { trial, result }
        })
        .collect()
}

/// Run the replicates in `config.trials()` concurrently.
///
/// Each replicate runs inside [`spawn_blocking`](tokio::task::spawn_blocking)
/// with at most `concurrency` running at once. Outcomes are returned in
/// trial order.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if
/// `concurrency` is zero, and `Error::TaskError` if the semaphore is closed
/// or a worker panics. Errors inside a replicate are reported through its
/// [`TrialOutcome`].
#[cfg(feature = "async")]
pub async fn run_trials_parallel<O, F>(
    config: &ExperimentConfig,
    concurrency: usize,
    oracle_factory: F,
) -> Result<Vec<TrialOutcome>>
where
    O: ComparisonOracle + Send + 'static,
    F: Fn(usize) -> O + Send + Sync + 'static,
{
    use std::sync::Arc;

    use tokio::sync::Semaphore;
    use tokio::task::JoinSet;

    use crate::error::Error;

    if concurrency == 0 {
        return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
    }

    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!(
        "run_trials_parallel",
        first = config.first_trial,
        last = config.last_trial,
        concurrency
    )
    .entered();

    let config = Arc::new(config.clone());
    let factory = Arc::new(oracle_factory);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set: JoinSet<TrialOutcome> = JoinSet::new();

    for trial in config.trials() {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| Error::TaskError(e.to_string()))?;
        let config = Arc::clone(&config);
        let factory = Arc::clone(&factory);
        join_set.spawn_blocking(move || {
            let _permit = permit;
            let result = Experiment::new(&config, trial, factory(trial)).and_then(Experiment::run);
            TrialOutcome { trial, result }
        });
    }

    let mut outcomes = Vec::with_capacity(join_set.len());
    while let Some(joined) = join_set.join_next().await {
        let outcome = joined.map_err(|e| Error::TaskError(e.to_string()))?;
        if !outcome.is_ok() {
            trace_warn!(trial = outcome.trial, error = ?outcome.result.as_ref().err(), "trial failed");
        }
        outcomes.push(outcome);
    }
    outcomes.sort_by_key(|o| o.trial);
    Ok(outcomes)
}
