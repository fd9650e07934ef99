//! End-to-end tests of the active-learning loop.

use std::path::PathBuf;
use std::sync::Arc;

use prefopt::prelude::*;

fn temp_dir() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut path = std::env::temp_dir();
    path.push(format!(
        "prefopt_experiment_test_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path
}

fn quick_fit() -> FitOptions {
    FitOptions {
        max_iter: 40,
        num_samples: 4,
        ..FitOptions::default()
    }
}

fn quick_acquisition() -> AcquisitionOptions {
    AcquisitionOptions {
        raw_samples: 32,
        num_restarts: 2,
        max_local_iter: 10,
        mc_samples: 16,
        baseline_size: 8,
    }
}

fn step_until_done<O: ComparisonOracle>(experiment: &mut Experiment<O>) {
    while experiment.step().expect("step should succeed") != Phase::Done {}
}

/// Records compared on everything but wall-clock time.
fn strip_timing(mut records: Vec<TrialRecord>) -> Vec<TrialRecord> {
    for r in &mut records {
        r.elapsed_secs = 0.0;
    }
    records
}

// =============================================================================
// Noiseless one-dimensional problem: the estimate approaches the upper bound
// =============================================================================

#[test]
fn noiseless_increasing_utility_is_maximized_at_the_upper_bound() {
    let config = ExperimentConfig::builder("increasing", 1)
        .algorithm(Algorithm::Random)
        .noise(NoiseType::Noiseless, 0.0)
        .num_max_iter(20)
        .fit_options(FitOptions {
            max_iter: 100,
            learning_rate: 0.1,
            num_samples: 8,
            ..FitOptions::default()
        })
        .acquisition_options(AcquisitionOptions {
            raw_samples: 64,
            num_restarts: 2,
            max_local_iter: 30,
            ..AcquisitionOptions::default()
        })
        .build()
        .unwrap();
    let oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);

    let trace = Experiment::new(&config, 1, oracle).unwrap().run().unwrap();

    assert_eq!(trace.entries.len(), 21);
    assert!(trace.entries.iter().all(|e| e.best_point.is_some()));
    let last = trace.entries.last().unwrap();
    assert_eq!(last.iteration, 20);
    let x = last.best_point.as_ref().expect("a best point is recorded")[0];
    assert!(x > 0.9, "best point {x} should exceed 0.9");
    assert_eq!(last.best_value, Some(x));
    let best_queried = last.max_value_within_queries.unwrap();
    assert!(best_queried > 0.8 && best_queried <= 1.0, "{best_queried}");
}

// =============================================================================
// Reproducibility under comparison noise
// =============================================================================

#[test]
fn noisy_runs_with_equal_trial_index_produce_identical_datasets() {
    let config = ExperimentConfig::builder("rosenbrock", 2)
        .algorithm(Algorithm::Emov)
        .noise(NoiseType::Logit, 7.0534)
        .num_max_iter(3)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();

    let run = || {
        let oracle = SimulatedOracle::new(Rosenbrock::new(2), NoiseType::Logit, 7.0534);
        let mut experiment = Experiment::new(&config, 1, oracle).unwrap();
        step_until_done(&mut experiment);
        (experiment.state().dataset.clone(), strip_timing(experiment.records()))
    };

    let (first, first_records) = run();
    let (second, second_records) = run();
    assert_eq!(first.len(), config.num_init_queries() + 3);
    assert_eq!(first, second);
    assert_eq!(first_records, second_records);
}

#[test]
fn different_trial_indices_are_independent_replicates() {
    let config = ExperimentConfig::builder("rosenbrock", 2)
        .algorithm(Algorithm::Random)
        .noise(NoiseType::Logit, 7.0534)
        .num_max_iter(0)
        .trials(1, 2)
        .build()
        .unwrap();
    let oracle = || SimulatedOracle::new(Rosenbrock::new(2), NoiseType::Logit, 7.0534);

    let mut a = Experiment::new(&config, 1, oracle()).unwrap();
    let mut b = Experiment::new(&config, 2, oracle()).unwrap();
    step_until_done(&mut a);
    step_until_done(&mut b);
    assert_ne!(a.state().dataset, b.state().dataset);
}

// =============================================================================
// Configured comparison noise
// =============================================================================

#[test]
fn configs_differing_only_in_noise_produce_different_data() {
    let config = |noise_type: NoiseType, sigma: f64| {
        ExperimentConfig::builder("linear", 1)
            .algorithm(Algorithm::Random)
            .noise(noise_type, sigma)
            .num_init_queries(20)
            .num_max_iter(0)
            .fit_options(quick_fit())
            .acquisition_options(quick_acquisition())
            .build()
            .unwrap()
    };
    let run = |config: &ExperimentConfig| {
        let oracle = SimulatedOracle::from_config(|x: &[f64]| x[0], config);
        let mut experiment = Experiment::new(config, 1, oracle).unwrap();
        step_until_done(&mut experiment);
        experiment.state().dataset.clone()
    };

    let quiet = run(&config(NoiseType::Noiseless, 0.0));
    let loud = run(&config(NoiseType::Probit, 1000.0));
    assert_ne!(quiet, loud);
    assert!(quiet.comparisons().iter().all(|c| {
        let items = c.query.items();
        items[c.winner][0] >= items[1 - c.winner][0]
    }));

    let noiseless = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);
    assert!(matches!(
        Experiment::new(&config(NoiseType::Probit, 1000.0), 1, noiseless),
        Err(Error::InvalidConfig(_))
    ));
}

// =============================================================================
// Recovery inside the loop
// =============================================================================

#[test]
fn acquisition_without_finite_scores_falls_back_to_random_queries() {
    let config = ExperimentConfig::builder("linear", 2)
        .algorithm(Algorithm::Emov)
        .num_init_queries(2)
        .num_max_iter(3)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();
    let selector = AcquisitionSelector::new(config.algo, config.acquisition)
        .scored_by(|_, _| f64::NAN);
    let oracle = SimulatedOracle::from_config(|x: &[f64]| x[0] + x[1], &config);
    let mut experiment = Experiment::new(&config, 1, oracle)
        .unwrap()
        .with_selector(selector);
    step_until_done(&mut experiment);

    let records = experiment.records();
    assert_eq!(records.len(), 4);
    assert!(!records[0].degraded);
    assert!(records[1..].iter().all(|r| r.degraded));
    assert!(records[1..].iter().all(|r| r.best_point.is_some()));
    assert_eq!(experiment.state().dataset.len(), 5);
    for c in &experiment.state().dataset.comparisons()[2..] {
        assert_eq!(c.query.len(), 2);
        assert!(c.query.items().iter().flatten().all(|v| (0.0..=1.0).contains(v)));
    }
}

#[test]
fn diverging_fit_ends_only_its_own_replicate() {
    let dir = temp_dir();
    let builder = || {
        ExperimentConfig::builder("linear", 1)
            .algorithm(Algorithm::Random)
            .num_init_queries(2)
            .num_max_iter(1)
            .trials(1, 3)
            .results_dir(&dir)
            .acquisition_options(quick_acquisition())
    };

    // Trials 1 and 3 already completed with a healthy fitter.
    let healthy = builder().fit_options(quick_fit()).build().unwrap();
    for trial in [1, 3] {
        let oracle = SimulatedOracle::from_config(|x: &[f64]| x[0], &healthy);
        Experiment::new(&healthy, trial, oracle).unwrap().run().unwrap();
    }

    // Every fit of the batch diverges; only trial 2 still needs one.
    let diverging = builder()
        .restart(true)
        .fit_options(FitOptions {
            max_iter: 20,
            learning_rate: 1e300,
            optimizer: FitOptimizer::GradientAscent,
            max_retries: 1,
            ..FitOptions::default()
        })
        .build()
        .unwrap();
    let outcomes = run_trials(&diverging, |_| {
        SimulatedOracle::from_config(|x: &[f64]| x[0], &diverging)
    });

    assert_eq!(outcomes.iter().map(|o| o.trial).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(matches!(
        outcomes[1].result,
        Err(Error::FitDivergence { attempts: 2 })
    ));
    for outcome in [&outcomes[0], &outcomes[2]] {
        let trace = outcome.result.as_ref().expect("completed trial resumes as done");
        assert_eq!(trace.entries.len(), 2);
    }
    assert!(!diverging.journal_path(2).unwrap().exists());

    std::fs::remove_dir_all(&dir).ok();
}

// =============================================================================
// Resuming from a journal
// =============================================================================

#[test]
fn restart_resumes_after_the_last_recorded_iteration() {
    let dir = temp_dir();
    let builder = || {
        ExperimentConfig::builder("quadratic", 2)
            .algorithm(Algorithm::Nei)
            .noise(NoiseType::Probit, 0.05)
            .trials(3, 3)
            .results_dir(&dir)
            .fit_options(quick_fit())
            .acquisition_options(quick_acquisition())
    };
    let utility = |x: &[f64]| -(x[0] - 0.3).powi(2) - (x[1] - 0.6).powi(2);
    let oracle = move || SimulatedOracle::new(utility, NoiseType::Probit, 0.05);

    // Interrupted run: five model-guided iterations reach the journal.
    let partial = builder().num_max_iter(5).build().unwrap();
    Experiment::new(&partial, 3, oracle()).unwrap().run().unwrap();
    let journal = partial.journal_path(3).unwrap();
    assert!(journal.exists());

    // Resumed run continues at iteration 6.
    let resumed_config = builder().num_max_iter(8).restart(true).build().unwrap();
    let mut resumed = Experiment::new(&resumed_config, 3, oracle()).unwrap();
    assert_eq!(resumed.state().iteration, 6);
    assert_eq!(resumed.state().phase, Phase::Select);
    assert_eq!(resumed.state().dataset.len(), resumed_config.num_init_queries() + 5);
    step_until_done(&mut resumed);

    // Uninterrupted reference run with the same trial index, kept in memory.
    let mut reference_config = resumed_config.clone();
    reference_config.results_dir = None;
    reference_config.restart = false;
    let mut reference = Experiment::new(&reference_config, 3, oracle()).unwrap();
    step_until_done(&mut reference);

    assert_eq!(resumed.state().dataset, reference.state().dataset);
    assert_eq!(
        strip_timing(resumed.records()),
        strip_timing(reference.records())
    );

    // The journal on disk holds the whole history.
    let reopened = JournalStorage::open(&journal).unwrap();
    assert_eq!(reopened.len(), 9);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn fresh_start_replaces_an_existing_journal() {
    let dir = temp_dir();
    let config = ExperimentConfig::builder("linear", 1)
        .algorithm(Algorithm::Random)
        .num_init_queries(2)
        .num_max_iter(1)
        .results_dir(&dir)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();
    let oracle = || SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);

    Experiment::new(&config, 1, oracle()).unwrap().run().unwrap();
    let path = config.journal_path(1).unwrap();
    assert_eq!(JournalStorage::open(&path).unwrap().len(), 2);

    let experiment = Experiment::new(&config, 1, oracle()).unwrap();
    assert_eq!(experiment.state().iteration, 0);
    assert!(JournalStorage::open(&path).unwrap().is_empty());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn restart_without_a_journal_starts_fresh() {
    let dir = temp_dir();
    let config = ExperimentConfig::builder("linear", 1)
        .restart(true)
        .results_dir(&dir)
        .build()
        .unwrap();
    let oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);

    let experiment = Experiment::new(&config, 1, oracle).unwrap();
    assert_eq!(experiment.state().phase, Phase::Init);
    assert!(experiment.records().is_empty());
}

#[test]
fn completed_journal_resumes_as_done() {
    let config = ExperimentConfig::builder("linear", 1)
        .algorithm(Algorithm::Random)
        .num_init_queries(2)
        .num_max_iter(1)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();
    let oracle = || SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);

    let storage = Arc::new(MemoryStorage::new());
    let mut first = Experiment::with_storage(&config, 1, oracle(), storage.clone()).unwrap();
    step_until_done(&mut first);

    let mut restart = config.clone();
    restart.restart = true;
    let mut resumed = Experiment::with_storage(&restart, 1, oracle(), storage.clone()).unwrap();
    assert_eq!(resumed.state().phase, Phase::Done);
    assert_eq!(resumed.step().unwrap(), Phase::Done);
    assert_eq!(storage.len(), 2);

    // A shorter budget than what was already recorded is inconsistent.
    restart.num_max_iter = 0;
    assert!(matches!(
        Experiment::with_storage(&restart, 1, oracle(), storage),
        Err(Error::StateConsistency(_))
    ));
}

#[test]
fn journal_of_a_different_shape_is_rejected() {
    let one_dim = ExperimentConfig::builder("shape", 1)
        .algorithm(Algorithm::Random)
        .num_init_queries(2)
        .num_max_iter(0)
        .build()
        .unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);
    let mut experiment = Experiment::with_storage(&one_dim, 1, oracle, storage.clone()).unwrap();
    step_until_done(&mut experiment);

    let two_dim = ExperimentConfig::builder("shape", 2)
        .num_init_queries(2)
        .restart(true)
        .build()
        .unwrap();
    let oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);
    assert!(matches!(
        Experiment::with_storage(&two_dim, 1, oracle, storage),
        Err(Error::StateConsistency(_))
    ));
}

// =============================================================================
// Replicate batches
// =============================================================================

#[test]
fn run_trials_isolates_failures() {
    let config = ExperimentConfig::builder("linear", 1)
        .algorithm(Algorithm::Emov)
        .num_init_queries(2)
        .num_max_iter(2)
        .trials(4, 6)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();

    let outcomes = run_trials(&config, |trial| {
        let broken = trial == 5;
        SimulatedOracle::new(
            move |x: &[f64]| if broken { f64::NAN } else { x[0] },
            NoiseType::Noiseless,
            0.0,
        )
    });

    assert_eq!(outcomes.iter().map(|o| o.trial).collect::<Vec<_>>(), vec![4, 5, 6]);
    assert!(outcomes[0].is_ok());
    assert!(matches!(outcomes[1].result, Err(Error::Oracle(_))));
    assert!(outcomes[2].is_ok());
    let trace = outcomes[2].result.as_ref().unwrap();
    assert_eq!(trace.trial, 6);
    assert_eq!(trace.entries.len(), 3);
}

#[test]
fn trace_exports_as_csv() {
    let config = ExperimentConfig::builder("linear", 2)
        .algorithm(Algorithm::Ts)
        .num_init_queries(2)
        .num_max_iter(2)
        .fit_options(quick_fit())
        .acquisition_options(quick_acquisition())
        .build()
        .unwrap();
    let oracle = SimulatedOracle::new(|x: &[f64]| x[0] + x[1], NoiseType::Noiseless, 0.0);
    let trace = Experiment::new(&config, 1, oracle).unwrap().run().unwrap();

    let mut buf = Vec::new();
    trace.to_csv(&mut buf).unwrap();
    let csv = String::from_utf8(buf).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "iteration,best_value,max_value_within_queries,x0,x1");
    assert_eq!(lines.len(), 4);
    for (i, line) in lines[1..].iter().enumerate() {
        let cells: Vec<&str> = line.split(',').collect();
        assert_eq!(cells.len(), 5, "{line}");
        assert_eq!(cells[0], i.to_string());
        assert!(cells[1..].iter().all(|c| !c.is_empty()), "{line}");
    }
}
