//! Integration tests for the latent-utility model, its fitter and the
//! acquisition strategies.

use nalgebra::SymmetricEigen;
use prefopt::prelude::*;

fn dataset(d: usize, n: usize, seed: u64) -> Dataset {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut data = Dataset::new(d, 2).unwrap();
    for _ in 0..n {
        let items: Vec<Vec<f64>> = (0..2).map(|_| (0..d).map(|_| rng.f64()).collect()).collect();
        let winner = usize::from(items[1].iter().sum::<f64>() > items[0].iter().sum::<f64>());
        data.push(Comparison::new(Query::new(items).unwrap(), winner).unwrap())
            .unwrap();
    }
    data
}

fn assert_psd(cov: &nalgebra::DMatrix<f64>) {
    let n = cov.nrows();
    for i in 0..n {
        for j in 0..n {
            assert!(
                (cov[(i, j)] - cov[(j, i)]).abs() < 1e-10,
                "covariance not symmetric at ({i}, {j})"
            );
        }
    }
    let eigen = SymmetricEigen::new(cov.clone());
    let scale = cov.diagonal().max().max(1.0);
    for &lambda in eigen.eigenvalues.iter() {
        assert!(lambda > -1e-8 * scale, "negative eigenvalue {lambda}");
    }
}

#[test]
fn forward_and_posterior_covariances_are_psd_for_any_batch_size() {
    let data = dataset(2, 6, 1);
    let mut rng = fastrand::Rng::with_seed(2);
    let model = PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap();
    let (model, _) = ModelFitter::new(FitOptions {
        max_iter: 20,
        num_samples: 4,
        ..FitOptions::default()
    })
    .fit(model, &mut rng)
    .unwrap();

    for n in [1, 2, 5, 17] {
        let xs: Vec<Vec<f64>> = (0..n).map(|_| vec![rng.f64(), rng.f64()]).collect();
        let prior = model.forward(&xs).unwrap();
        assert_eq!(prior.dim(), n);
        assert_psd(&prior.covariance);
        let post = model.posterior(&xs).unwrap();
        assert_psd(&post.covariance);
    }

    // Duplicated points give a singular but still PSD covariance.
    let dup = vec![vec![0.5, 0.5]; 4];
    assert_psd(&model.forward(&dup).unwrap().covariance);
}

#[test]
fn equal_data_and_seed_give_identical_models() {
    for whiten in [true, false] {
        let data = dataset(3, 5, 9);
        let options = ModelOptions {
            whiten,
            ..ModelOptions::default()
        };
        let a = PreferentialVariationalGp::new(&data, options, &mut fastrand::Rng::with_seed(4))
            .unwrap();
        let b = PreferentialVariationalGp::new(&data, options, &mut fastrand::Rng::with_seed(4))
            .unwrap();
        assert_eq!(a.inducing_points(), b.inducing_points());
        assert_eq!(a.variational_distribution(), b.variational_distribution());
        assert_eq!(a.raw_hyperparameters(), b.raw_hyperparameters());
    }
}

#[test]
fn rebuild_leaves_the_original_untouched() {
    let data = dataset(1, 4, 3);
    let mut rng = fastrand::Rng::with_seed(5);
    let model = PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap();
    let extra = dataset(1, 2, 8);

    let bigger = model.rebuild(extra.comparisons(), &mut rng).unwrap();
    assert_eq!(model.dataset().len(), 4);
    assert_eq!(bigger.dataset().len(), 6);
    assert_eq!(bigger.train_inputs().len(), 12);
    assert_eq!(bigger.inducing_points().len(), 2 + 12);
}

#[test]
fn fitted_model_ranks_points_like_the_oracle() {
    let data = dataset(2, 20, 11);
    let mut rng = fastrand::Rng::with_seed(12);
    let model = PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap();
    let (model, report) = ModelFitter::new(FitOptions::default())
        .fit(model, &mut rng)
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert!(report.final_objective().unwrap().is_finite());
    let low = model.posterior_mean(&[0.1, 0.1]).unwrap();
    let high = model.posterior_mean(&[0.9, 0.9]).unwrap();
    assert!(high > low, "posterior mean {high} at the top should beat {low}");
}

#[test]
fn every_strategy_selects_inside_the_unit_box() {
    let data = dataset(2, 6, 21);
    let mut rng = fastrand::Rng::with_seed(22);
    let model = PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap();
    let (model, _) = ModelFitter::new(FitOptions {
        max_iter: 20,
        num_samples: 4,
        ..FitOptions::default()
    })
    .fit(model, &mut rng)
    .unwrap();

    let options = AcquisitionOptions {
        raw_samples: 16,
        num_restarts: 2,
        max_local_iter: 10,
        mc_samples: 8,
        baseline_size: 4,
    };
    for algorithm in Algorithm::ALL {
        let selector = AcquisitionSelector::new(algorithm, options);
        let query = selector.select(&model, &mut rng).unwrap();
        assert_eq!(query.len(), 2, "{algorithm}");
        for item in query.items() {
            assert_eq!(item.len(), 2);
            assert!(item.iter().all(|v| (0.0..=1.0).contains(v)), "{algorithm}: {item:?}");
        }
    }
}

#[test]
fn custom_acquisition_is_clamped_to_the_box() {
    use prefopt::acquisition::optimize_acquisition;

    // Unbounded growth pulls every coordinate against the upper bound.
    let score = |items: &[Vec<f64>]| items.iter().flatten().map(|v| 10.0 * v).sum::<f64>();
    let mut rng = fastrand::Rng::with_seed(0);
    let best = optimize_acquisition(&score, 2, 3, &AcquisitionOptions::default(), &mut rng).unwrap();
    assert_eq!(best.len(), 2);
    for item in &best {
        for &v in item {
            assert!((0.0..=1.0).contains(&v));
            assert!(v > 0.99);
        }
    }
}

#[test]
fn identical_items_still_get_a_deterministic_winner() {
    let query = Query::new(vec![vec![0.4, 0.4], vec![0.4, 0.4]]).unwrap();

    let mut noiseless = SimulatedOracle::new(Rosenbrock::new(2), NoiseType::Noiseless, 0.0);
    let mut rng = fastrand::Rng::with_seed(0);
    assert_eq!(noiseless.compare(&query, &mut rng).unwrap(), 0);

    let mut noisy = SimulatedOracle::new(Rosenbrock::new(2), NoiseType::Logit, 7.0534);
    let a = noisy.compare(&query, &mut fastrand::Rng::with_seed(3)).unwrap();
    let b = noisy.compare(&query, &mut fastrand::Rng::with_seed(3)).unwrap();
    assert!(a < 2);
    assert_eq!(a, b);
}

#[test]
fn noise_calibration_hits_the_target_error_rate() {
    let mut rng = fastrand::Rng::with_seed(7);
    let sigma = estimate_noise_level(
        &Rosenbrock::new(2),
        2,
        0.2,
        0.1,
        2000,
        NoiseType::Logit,
        &mut rng,
    )
    .unwrap();
    assert!(sigma.is_finite() && sigma > 0.0);

    let larger = estimate_noise_level(
        &Rosenbrock::new(2),
        2,
        0.4,
        0.1,
        2000,
        NoiseType::Logit,
        &mut fastrand::Rng::with_seed(7),
    )
    .unwrap();
    assert!(larger > sigma);
}
