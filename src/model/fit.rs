//! ELBO maximization over variational parameters and hyperparameters.
//!
//! Each attempt draws a fresh set of base samples and then runs
//! `max_iter` first-order steps on the stacked parameter vector
//! `[m, vech(L), raw hyperparameters]`:
//!
//! - `m`, `L`: analytic reparameterization gradients from the ELBO
//!   estimator.
//! - raw hyperparameters: central finite differences of
//!   `ELBO + log prior` (via [`finitediff`]), evaluated with the same base
//!   samples so the objective is a deterministic function.
//!
//! A non-finite objective, gradient, or parameter ends the attempt. The
//! model is then re-initialized (random variational mean, identity `L`,
//! initial hyperparameters) and the fit restarts, up to `max_retries`
//! times, after which [`Error::FitDivergence`] is returned.

use finitediff::FiniteDiff;
use serde::{Deserialize, Serialize};

use super::elbo::BaseSamples;
use super::variational::PreferentialVariationalGp;
use crate::error::{Error, Result};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// First-order update rule used by [`ModelFitter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitOptimizer {
    /// Adam with the usual `β₁ = 0.9`, `β₂ = 0.999`.
    #[default]
    Adam,
    /// Plain gradient ascent with a fixed step size.
    GradientAscent,
}

/// Options for [`ModelFitter`].
///
/// | Field | Default |
/// |-------|---------|
/// | `max_iter` | 150 |
/// | `learning_rate` | 0.05 |
/// | `num_samples` | 16 |
/// | `max_retries` | 3 |
/// | `tolerance` | 1e-6 |
/// | `optimizer` | Adam |
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Optimization steps per attempt.
    pub max_iter: usize,
    /// Step size.
    pub learning_rate: f64,
    /// Monte-Carlo samples in the expected log-likelihood.
    pub num_samples: usize,
    /// Re-initializations allowed after a divergence.
    pub max_retries: usize,
    /// Stop once the relative objective change falls below this value.
    /// Zero disables early stopping.
    pub tolerance: f64,
    /// Update rule.
    pub optimizer: FitOptimizer,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iter: 150,
            learning_rate: 0.05,
            num_samples: 16,
            max_retries: 3,
            tolerance: 1e-6,
            optimizer: FitOptimizer::Adam,
        }
    }
}

impl FitOptions {
    /// Check that the options describe a runnable fit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero sample count, or a
    /// non-positive or non-finite learning rate, or a negative tolerance.
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(Error::InvalidConfig("fit num_samples must be positive".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "fit learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if self.tolerance.is_nan() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "fit tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful fit.
#[derive(Clone, Debug, PartialEq)]
pub struct FitReport {
    /// `ELBO + log prior` before each step of the successful attempt,
    /// followed by the value at the returned parameters.
    pub objective_trace: Vec<f64>,
    /// Steps taken in the successful attempt.
    pub iterations: usize,
    /// Attempts used, including the successful one.
    pub attempts: usize,
}

impl FitReport {
    /// Objective at the returned parameters.
    #[must_use]
    pub fn final_objective(&self) -> Option<f64> {
        self.objective_trace.last().copied()
    }
}

/// Fits a [`PreferentialVariationalGp`] by maximizing its evidence lower bound.
#[derive(Clone, Debug, Default)]
pub struct ModelFitter {
    options: FitOptions,
}

impl ModelFitter {
    /// Creates a fitter with the given options.
    #[must_use]
    pub fn new(options: FitOptions) -> Self {
        Self { options }
    }

    /// The options in use.
    #[must_use]
    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    /// Fit `model` and return it together with a report.
    ///
    /// All randomness (base samples, re-initialization) comes from `rng`.
    ///
    /// # Errors
    ///
    /// - [`Error::FitDivergence`] after `max_retries + 1` attempts that all
    ///   produced non-finite values.
    /// - [`Error::InvalidConfig`] if the options are invalid.
    pub fn fit(
        &self,
        mut model: PreferentialVariationalGp,
        rng: &mut fastrand::Rng,
    ) -> Result<(PreferentialVariationalGp, FitReport)> {
        self.options.validate()?;
        let attempts_allowed = self.options.max_retries + 1;

        #[cfg(feature = "tracing")]
        let _span = tracing::debug_span!(
            "fit",
            comparisons = model.dataset.len(),
            inducing = model.variational.num_inducing()
        )
        .entered();

        for attempt in 1..=attempts_allowed {
            if attempt > 1 {
                model.reinitialize(rng)?;
            }
            let base = BaseSamples::draw(
                self.options.num_samples,
                model.variational.num_inducing(),
                model.train_x.len(),
                rng,
            );
            if let Some((objective_trace, iterations)) = self.run_attempt(&mut model, &base) {
                trace_debug!(
                    attempt,
                    iterations,
                    objective = objective_trace.last().copied().unwrap_or(f64::NAN),
                    "fit finished"
                );
                return Ok((
                    model,
                    FitReport {
                        objective_trace,
                        iterations,
                        attempts: attempt,
                    },
                ));
            }
            trace_warn!(attempt, "fit produced non-finite values, re-initializing");
        }

        Err(Error::FitDivergence {
            attempts: attempts_allowed,
        })
    }

    /// One optimization run with fixed base samples. `None` on divergence.
    fn run_attempt(
        &self,
        model: &mut PreferentialVariationalGp,
        base: &BaseSamples,
    ) -> Option<(Vec<f64>, usize)> {
        let m = model.variational.num_inducing();
        let n_tri = m * (m + 1) / 2;
        let n_hyp = model.raw_hypers.len();
        let mut state = UpdateState::new(m + n_tri + n_hyp);
        let mut trace = Vec::with_capacity(self.options.max_iter + 1);

        for iter in 0..self.options.max_iter {
            let raw = model.raw_hypers.clone();
            let eval = model.elbo_at(&raw, base, true)?;
            let objective = eval.value + model.kernel.log_prior(&raw);
            if !objective.is_finite() {
                return None;
            }
            if let Some(&prev) = trace.last()
                && self.converged(prev, objective)
            {
                trace.push(objective);
                return Some((trace, iter));
            }
            trace.push(objective);

            let hyper_grad = raw.central_diff(&|r| model.objective_at(r, base));

            let mut grad = Vec::with_capacity(m + n_tri + n_hyp);
            grad.extend(eval.grad_mean.iter());
            for j in 0..m {
                for i in j..m {
                    grad.push(eval.grad_chol[(i, j)]);
                }
            }
            grad.extend(hyper_grad);
            if grad.iter().any(|g| !g.is_finite()) {
                return None;
            }

            let step = state.step(self.options.optimizer, self.options.learning_rate, &grad);

            for (i, s) in step[..m].iter().enumerate() {
                model.variational.mean[i] += s;
            }
            let mut k = m;
            for j in 0..m {
                for i in j..m {
                    model.variational.chol[(i, j)] += step[k];
                    k += 1;
                }
            }
            let new_raw: Vec<f64> = raw.iter().zip(&step[k..]).map(|(r, s)| r + s).collect();

            if model.variational.mean.iter().any(|v| !v.is_finite())
                || model.variational.chol.iter().any(|v| !v.is_finite())
                || new_raw.iter().any(|v| !v.is_finite())
            {
                return None;
            }
            model.set_raw_hyperparameters(new_raw).ok()?;
        }

        let raw = model.raw_hypers.clone();
        let last = model.objective_at(&raw, base);
        if !last.is_finite() {
            return None;
        }
        trace.push(last);
        Some((trace, self.options.max_iter))
    }

    fn converged(&self, prev: f64, current: f64) -> bool {
        self.options.tolerance > 0.0
            && (current - prev).abs() <= self.options.tolerance * prev.abs().max(1.0)
    }
}

/// Moment estimates for Adam (unused by plain gradient ascent).
struct UpdateState {
    first: Vec<f64>,
    second: Vec<f64>,
    t: i32,
}

impl UpdateState {
    fn new(n: usize) -> Self {
        Self {
            first: vec![0.0; n],
            second: vec![0.0; n],
            t: 0,
        }
    }

    /// Ascent step for gradient `grad`.
    fn step(&mut self, optimizer: FitOptimizer, lr: f64, grad: &[f64]) -> Vec<f64> {
        match optimizer {
            FitOptimizer::GradientAscent => grad.iter().map(|g| lr * g).collect(),
            FitOptimizer::Adam => {
                self.t += 1;
                let bias1 = 1.0 - ADAM_BETA1.powi(self.t);
                let bias2 = 1.0 - ADAM_BETA2.powi(self.t);
                grad.iter()
                    .zip(self.first.iter_mut().zip(self.second.iter_mut()))
                    .map(|(&g, (m, v))| {
                        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                        lr * (*m / bias1) / ((*v / bias2).sqrt() + ADAM_EPS)
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelOptions, PosteriorPredictive};
    use crate::types::{Comparison, Dataset, Query};

    /// Pairs on a line where the larger coordinate always wins.
    fn increasing_data() -> Dataset {
        let mut data = Dataset::new(1, 2).unwrap();
        for (a, b) in [(0.1, 0.6), (0.8, 0.3), (0.2, 0.9), (0.5, 0.05), (0.4, 0.7)] {
            let winner = usize::from(b > a);
            let q = Query::new(vec![vec![a], vec![b]]).unwrap();
            data.push(Comparison::new(q, winner).unwrap()).unwrap();
        }
        data
    }

    fn fresh_model(seed: u64) -> PreferentialVariationalGp {
        let mut rng = fastrand::Rng::with_seed(seed);
        PreferentialVariationalGp::new(&increasing_data(), ModelOptions::default(), &mut rng).unwrap()
    }

    #[test]
    fn small_step_gradient_ascent_is_monotone() {
        let fitter = ModelFitter::new(FitOptions {
            max_iter: 15,
            learning_rate: 1e-3,
            num_samples: 8,
            tolerance: 0.0,
            optimizer: FitOptimizer::GradientAscent,
            ..FitOptions::default()
        });
        let mut rng = fastrand::Rng::with_seed(3);
        let (_, report) = fitter.fit(fresh_model(1), &mut rng).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.objective_trace.len(), 16);
        for w in report.objective_trace.windows(2) {
            assert!(w[1] >= w[0] - 1e-9, "objective decreased: {} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn fitting_learns_the_preferred_direction() {
        let fitter = ModelFitter::new(FitOptions {
            max_iter: 80,
            ..FitOptions::default()
        });
        let mut rng = fastrand::Rng::with_seed(5);
        let (model, report) = fitter.fit(fresh_model(2), &mut rng).unwrap();
        let first = report.objective_trace[0];
        let last = report.final_objective().unwrap();
        assert!(last > first, "objective {first} -> {last}");
        let low = model.posterior_mean(&[0.1]).unwrap();
        let high = model.posterior_mean(&[0.9]).unwrap();
        assert!(high > low, "mean at 0.9 ({high}) should exceed mean at 0.1 ({low})");
    }

    #[test]
    fn huge_step_size_diverges_after_all_retries() {
        let fitter = ModelFitter::new(FitOptions {
            max_iter: 20,
            learning_rate: 1e300,
            optimizer: FitOptimizer::GradientAscent,
            max_retries: 2,
            ..FitOptions::default()
        });
        let mut rng = fastrand::Rng::with_seed(7);
        let err = fitter.fit(fresh_model(3), &mut rng).unwrap_err();
        assert!(matches!(err, Error::FitDivergence { attempts: 3 }), "{err:?}");
    }

    #[test]
    fn fit_is_reproducible_for_equal_seeds() {
        let fitter = ModelFitter::new(FitOptions {
            max_iter: 10,
            ..FitOptions::default()
        });
        let (a, ra) = fitter
            .fit(fresh_model(4), &mut fastrand::Rng::with_seed(11))
            .unwrap();
        let (b, rb) = fitter
            .fit(fresh_model(4), &mut fastrand::Rng::with_seed(11))
            .unwrap();
        assert_eq!(ra, rb);
        assert_eq!(a.variational, b.variational);
        assert_eq!(a.raw_hypers, b.raw_hypers);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let fitter = ModelFitter::new(FitOptions {
            num_samples: 0,
            ..FitOptions::default()
        });
        let mut rng = fastrand::Rng::with_seed(0);
        assert!(matches!(
            fitter.fit(fresh_model(0), &mut rng),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn adam_first_step_has_learning_rate_magnitude() {
        let mut state = UpdateState::new(2);
        let step = state.step(FitOptimizer::Adam, 0.1, &[5.0, -0.01]);
        assert!((step[0] - 0.1).abs() < 1e-6);
        assert!((step[1] + 0.1).abs() < 1e-4);
    }
}
