//! Preferential optimization of the 3-d Rosenbrock function.
//!
//! Calibrates the comparison noise so that 20% of comparisons between
//! near-optimal points are answered wrongly, runs a few replicates of the
//! loop with journals under the system temp directory, and prints the
//! final estimate of each replicate.
//!
//! Run with: `cargo run --release --example rosenbrock`

use prefopt::prelude::*;

fn main() -> prefopt::Result<()> {
    let dim = 3;
    let problem = Rosenbrock::new(dim);

    let mut rng = fastrand::Rng::with_seed(0);
    let sigma = estimate_noise_level(&problem, dim, 0.2, 0.01, 10_000, NoiseType::Logit, &mut rng)?;
    println!("calibrated logit noise: sigma = {sigma:.4}");

    let results_dir = std::env::temp_dir().join("prefopt_rosenbrock_demo");
    let config = ExperimentConfig::builder("rosenbrock", dim)
        .algorithm(Algorithm::Nei)
        .noise(NoiseType::Logit, sigma)
        .num_max_iter(25)
        .trials(1, 3)
        .results_dir(&results_dir)
        .build()?;

    for outcome in run_trials(&config, |_| {
        SimulatedOracle::from_config(problem, &config)
    }) {
        match outcome.result {
            Ok(trace) => {
                if let Some(best) = trace.final_estimate() {
                    println!(
                        "trial {}: best {:?} with utility {:?}",
                        outcome.trial, best.best_point, best.best_value
                    );
                }
                let csv = results_dir.join(format!("trial_{}.csv", outcome.trial));
                trace.export_csv(&csv)?;
            }
            Err(e) => println!("trial {} failed: {e}", outcome.trial),
        }
    }

    println!("maximum is at {:?}", problem.optimizer());
    println!("journals written to {}", results_dir.display());
    Ok(())
}
