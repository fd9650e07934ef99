//! Softmax choice likelihood over the items of one comparison.
//!
//! Given latent utilities `f_1 … f_q` for the items of a query, the
//! probability that item `i` wins is
//!
//! ```text
//! p(i | f) = exp(f_i) / Σ_j exp(f_j)
//! ```
//!
//! a multinomial-logit (Bradley–Terry / Plackett–Luce first choice) model.
//! For `q = 2` this is the Bernoulli model `σ(f_winner − f_loser)`.
//!
//! The expected log-likelihood under a Gaussian belief over `f` has no
//! closed form, so [`PreferenceLikelihood::expected_log_prob`] estimates it
//! from reparameterized base samples.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::linalg;

/// Choice likelihood for queries of a fixed size `q`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreferenceLikelihood {
    num_points: usize,
}

impl PreferenceLikelihood {
    /// Create a likelihood for queries of `num_points` items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBatchSize`] if `num_points < 2`.
    pub fn new(num_points: usize) -> Result<Self> {
        if num_points < 2 {
            return Err(Error::InvalidBatchSize(num_points));
        }
        Ok(Self { num_points })
    }

    /// Items per query.
    #[must_use]
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Categorical distribution over the winner.
    #[must_use]
    pub fn choice_probabilities(&self, f: &[f64]) -> Vec<f64> {
        let max = f.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = f.iter().map(|v| (v - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }

    /// `log p(winner | f)`.
    #[must_use]
    pub fn log_prob(&self, f: &[f64], winner: usize) -> f64 {
        f[winner] - log_sum_exp(f)
    }

    /// Gradient of [`log_prob`](Self::log_prob) with respect to `f`:
    /// `onehot(winner) − softmax(f)`.
    #[must_use]
    pub fn log_prob_grad(&self, f: &[f64], winner: usize) -> Vec<f64> {
        let mut g = self.choice_probabilities(f);
        for v in &mut g {
            *v = -*v;
        }
        g[winner] += 1.0;
        g
    }

    /// Monte-Carlo estimate of `E_{f ~ N(mean, L Lᵀ)}[log p(winner | f)]`
    /// using the supplied standard-normal base samples.
    #[must_use]
    pub fn expected_log_prob(
        &self,
        mean: &DVector<f64>,
        chol: &DMatrix<f64>,
        winner: usize,
        base_samples: &[Vec<f64>],
    ) -> f64 {
        if base_samples.is_empty() {
            return self.log_prob(mean.as_slice(), winner);
        }
        let total: f64 = base_samples
            .iter()
            .map(|z| self.log_prob(&linalg::correlated_sample(mean, chol, z), winner))
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let n = base_samples.len() as f64;
        total / n
    }
}

/// Numerically stable `ln Σ exp(f_i)`.
pub(crate) fn log_sum_exp(f: &[f64]) -> f64 {
    let max = f.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + f.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Shannon entropy (nats) of a categorical distribution.
pub(crate) fn entropy(p: &[f64]) -> f64 {
    -p.iter()
        .filter(|&&v| v > 0.0)
        .map(|&v| v * v.ln())
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    #[test]
    fn rejects_single_item_queries() {
        assert!(matches!(
            PreferenceLikelihood::new(1),
            Err(Error::InvalidBatchSize(1))
        ));
    }

    #[test]
    fn pairwise_reduces_to_bernoulli() {
        let lik = PreferenceLikelihood::new(2).unwrap();
        let f = [0.7, -0.4];
        let p = lik.choice_probabilities(&f);
        assert!((p[0] - sigmoid(1.1)).abs() < 1e-12);
        assert!((lik.log_prob(&f, 1) - sigmoid(-1.1).ln()).abs() < 1e-12);
    }

    #[test]
    fn probabilities_sum_to_one_for_large_utilities() {
        let lik = PreferenceLikelihood::new(3).unwrap();
        let p = lik.choice_probabilities(&[1000.0, 999.0, -1000.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn identical_utilities_are_uniform() {
        let lik = PreferenceLikelihood::new(4).unwrap();
        for p in lik.choice_probabilities(&[0.3; 4]) {
            assert!((p - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let lik = PreferenceLikelihood::new(3).unwrap();
        let f = [0.2, -0.5, 1.1];
        let g = lik.log_prob_grad(&f, 1);
        let h = 1e-6;
        for i in 0..3 {
            let mut up = f;
            let mut down = f;
            up[i] += h;
            down[i] -= h;
            let fd = (lik.log_prob(&up, 1) - lik.log_prob(&down, 1)) / (2.0 * h);
            assert!((fd - g[i]).abs() < 1e-6, "component {i}: {fd} vs {}", g[i]);
        }
        assert!(g.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn expected_log_prob_with_zero_covariance_is_plug_in() {
        let lik = PreferenceLikelihood::new(2).unwrap();
        let mean = DVector::from_vec(vec![0.3, 0.1]);
        let chol = DMatrix::zeros(2, 2);
        let base = vec![vec![1.0, -1.0], vec![0.5, 0.2]];
        let e = lik.expected_log_prob(&mean, &chol, 0, &base);
        assert!((e - lik.log_prob(&[0.3, 0.1], 0)).abs() < 1e-12);
    }

    #[test]
    fn expected_log_prob_is_below_plug_in_with_uncertainty() {
        // log-softmax is concave, so Jensen gives E[log p] <= log p(E f).
        let lik = PreferenceLikelihood::new(2).unwrap();
        let mean = DVector::from_vec(vec![0.3, 0.1]);
        let chol = DMatrix::identity(2, 2);
        let mut rng = fastrand::Rng::with_seed(5);
        let base = crate::qmc::pseudo_random_normals(4000, 2, &mut rng);
        let e = lik.expected_log_prob(&mean, &chol, 0, &base);
        assert!(e < lik.log_prob(&[0.3, 0.1], 0));
    }

    #[test]
    fn entropy_of_uniform_pair_is_ln_two() {
        assert!((entropy(&[0.5, 0.5]) - core::f64::consts::LN_2).abs() < 1e-12);
        assert_eq!(entropy(&[1.0, 0.0]), 0.0);
    }
}
