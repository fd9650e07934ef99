//! Monte-Carlo evidence lower bound and its variational gradients.
//!
//! With inducing values `v = m + L ε` and, per query, the conditional prior
//! residual `C_n η` (`C_n C_nᵀ = K_nn − W_nᵀ W_n`), the latent utilities of
//! query `n` are
//!
//! ```text
//! f_n = c + P_nᵀ v + C_n η
//! ```
//!
//! and the ELBO is `(1/S) Σ_s Σ_n log p(y_n | f_n^(s)) − KL(q(u) ‖ p(u))`.
//! Base samples `ε, η` are drawn once per fit, which makes the estimate a
//! deterministic, smooth function of the parameters. Gradients with respect
//! to `m` and `L` follow from the reparameterization: `∂/∂m = Σ_n P_n g_n`,
//! `∂/∂L = (Σ_n P_n g_n) εᵀ` restricted to the lower triangle.

use nalgebra::{DMatrix, DVector};

use super::variational::{InducingCache, PreferentialVariationalGp, VariationalDistribution};
use crate::{linalg, qmc};

/// Standard-normal draws shared by every ELBO evaluation within one fit.
pub(super) struct BaseSamples {
    /// `S` draws of length `M` for the inducing values.
    pub(super) inducing: Vec<Vec<f64>>,
    /// `S` draws of length `N · q` for the per-query conditional residuals.
    pub(super) conditional: Vec<Vec<f64>>,
}

impl BaseSamples {
    pub(super) fn draw(
        num_samples: usize,
        num_inducing: usize,
        num_points: usize,
        rng: &mut fastrand::Rng,
    ) -> Self {
        Self {
            inducing: qmc::pseudo_random_normals(num_samples, num_inducing, rng),
            conditional: qmc::pseudo_random_normals(num_samples, num_points, rng),
        }
    }
}

/// One ELBO evaluation.
pub(super) struct ElboEval {
    pub(super) value: f64,
    pub(super) grad_mean: DVector<f64>,
    pub(super) grad_chol: DMatrix<f64>,
}

/// `KL(N(m, LLᵀ) ‖ N(0, I))` when whitened, `KL(N(m, LLᵀ) ‖ N(0, K_ZZ))` otherwise.
pub(super) fn kl_divergence(
    variational: &VariationalDistribution,
    chol_zz: &DMatrix<f64>,
    whiten: bool,
) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    let m = variational.num_inducing() as f64;
    let log_det_s = 2.0 * linalg::log_abs_diag_sum(&variational.chol);
    let kl = if whiten {
        0.5 * (variational.chol.norm_squared() + variational.mean.norm_squared() - m - log_det_s)
    } else {
        let a = chol_zz.solve_lower_triangular(&variational.chol)?;
        let b = chol_zz.solve_lower_triangular(&variational.mean)?;
        let log_det_k = 2.0 * linalg::log_abs_diag_sum(chol_zz);
        0.5 * (a.norm_squared() + b.norm_squared() - m + log_det_k - log_det_s)
    };
    Some(kl)
}

/// Gradients of the KL term with respect to `m` and (lower) `L`.
fn kl_gradients(
    variational: &VariationalDistribution,
    chol_zz: &DMatrix<f64>,
    whiten: bool,
) -> Option<(DVector<f64>, DMatrix<f64>)> {
    let (grad_m, mut grad_l) = if whiten {
        (variational.mean.clone(), variational.chol.clone())
    } else {
        let b = chol_zz.solve_lower_triangular(&variational.mean)?;
        let a = chol_zz.solve_lower_triangular(&variational.chol)?;
        (
            chol_zz.tr_solve_lower_triangular(&b)?,
            chol_zz.tr_solve_lower_triangular(&a)?,
        )
    };
    for i in 0..variational.num_inducing() {
        grad_l[(i, i)] -= 1.0 / variational.chol[(i, i)];
    }
    grad_l.fill_upper_triangle(0.0, 1);
    Some((grad_m, grad_l))
}

impl PreferentialVariationalGp {
    /// ELBO at the current variational parameters and the given raw
    /// hyperparameters. Returns `None` when a factorization fails.
    pub(super) fn elbo_at(&self, raw: &[f64], base: &BaseSamples, with_grad: bool) -> Option<ElboEval> {
        let built;
        let cache = if raw == self.raw_hypers.as_slice() {
            &self.cache
        } else {
            built = InducingCache::build(&self.kernel, raw, &self.inducing)?;
            &built
        };

        let whiten = self.options.whiten;
        let variational = &self.variational;
        let num_inducing = variational.num_inducing();
        let q = self.likelihood.num_points();
        let comparisons = self.dataset.comparisons();

        let mut ell = 0.0;
        let mut grad_mean = DVector::zeros(num_inducing);
        let mut grad_chol = DMatrix::zeros(num_inducing, num_inducing);

        if !comparisons.is_empty() && !base.inducing.is_empty() {
            let (w, p) = cache.projection(&self.inducing, &self.train_x, whiten)?;
            let base_mean = p.tr_mul(&variational.mean).add_scalar(cache.hypers.constant);

            let residual_factors: Vec<DMatrix<f64>> = comparisons
                .iter()
                .enumerate()
                .map(|(k, c)| {
                    let wk = w.columns(k * q, q);
                    let cov = cache.hypers.gram(c.query.items()) - wk.tr_mul(&wk);
                    linalg::sampling_factor(&cov)
                })
                .collect();

            let mut f = vec![0.0; q];
            for (eps, eta) in base.inducing.iter().zip(&base.conditional) {
                let eps = DVector::from_column_slice(eps);
                let f_all = &base_mean + p.tr_mul(&(&variational.chol * &eps));
                let mut g_all = DVector::zeros(f_all.len());

                for (k, c) in comparisons.iter().enumerate() {
                    let factor = &residual_factors[k];
                    let eta_k = &eta[k * q..(k + 1) * q];
                    for (i, fi) in f.iter_mut().enumerate() {
                        let mut v = f_all[k * q + i];
                        for (j, e) in eta_k.iter().enumerate().take(i + 1) {
                            v += factor[(i, j)] * e;
                        }
                        *fi = v;
                    }
                    ell += self.likelihood.log_prob(&f, c.winner);
                    if with_grad {
                        for (i, g) in self.likelihood.log_prob_grad(&f, c.winner).into_iter().enumerate() {
                            g_all[k * q + i] = g;
                        }
                    }
                }

                if with_grad {
                    let gv = &p * &g_all;
                    grad_mean += &gv;
                    grad_chol.ger(1.0, &gv, &eps, 1.0);
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let s = base.inducing.len() as f64;
            ell /= s;
            grad_mean /= s;
            grad_chol /= s;
        }

        let kl = kl_divergence(variational, &cache.chol_zz, whiten)?;
        if with_grad {
            let (km, kl_l) = kl_gradients(variational, &cache.chol_zz, whiten)?;
            grad_mean -= km;
            grad_chol -= kl_l;
            grad_chol.fill_upper_triangle(0.0, 1);
        }

        Some(ElboEval {
            value: ell - kl,
            grad_mean,
            grad_chol,
        })
    }

    /// ELBO plus hyperparameter log prior; `NaN` when it cannot be evaluated.
    pub(super) fn objective_at(&self, raw: &[f64], base: &BaseSamples) -> f64 {
        self.elbo_at(raw, base, false)
            .map_or(f64::NAN, |e| e.value + self.kernel.log_prior(raw))
    }
}
