use nalgebra::{DMatrix, DVector};

use super::{ModelOptions, MultivariateNormal, PosteriorPredictive, VariationalModel, elbo};
use crate::error::{Error, Result};
use crate::kernel::{Hyperparameters, KernelFactory};
use crate::likelihood::PreferenceLikelihood;
use crate::types::{Comparison, Dataset};
use crate::{linalg, qmc, rng_util};

/// Standard deviation of the random variational mean used on re-initialization.
const REINIT_MEAN_STD: f64 = 1e-3;
/// Random Fourier features in the prior part of a posterior sample path.
const PRIOR_FEATURES: u32 = 512;

/// Gaussian variational distribution `q(u) = N(m, L Lᵀ)` over the
/// (possibly whitened) inducing utilities.
#[derive(Clone, Debug, PartialEq)]
pub struct VariationalDistribution {
    pub(super) mean: DVector<f64>,
    pub(super) chol: DMatrix<f64>,
}

impl VariationalDistribution {
    /// Zero mean and identity Cholesky factor over `num_inducing` points.
    #[must_use]
    pub fn new(num_inducing: usize) -> Self {
        Self {
            mean: DVector::zeros(num_inducing),
            chol: DMatrix::identity(num_inducing, num_inducing),
        }
    }

    /// Variational mean `m`.
    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Lower Cholesky factor `L` of the variational covariance.
    #[must_use]
    pub fn chol(&self) -> &DMatrix<f64> {
        &self.chol
    }

    /// Variational covariance `S = L Lᵀ`.
    #[must_use]
    pub fn covariance(&self) -> DMatrix<f64> {
        &self.chol * self.chol.transpose()
    }

    /// Number of inducing points.
    #[must_use]
    pub fn num_inducing(&self) -> usize {
        self.mean.len()
    }
}

/// Hyperparameters together with the factorized inducing covariance.
#[derive(Clone, Debug)]
pub(super) struct InducingCache {
    pub(super) hypers: Hyperparameters,
    /// Lower Cholesky factor `L_K` of `K_ZZ + jitter·I`.
    pub(super) chol_zz: DMatrix<f64>,
}

impl InducingCache {
    pub(super) fn build(kernel: &KernelFactory, raw: &[f64], inducing: &[Vec<f64>]) -> Option<Self> {
        let hypers = kernel.decode(raw);
        if !hypers.outputscale.is_finite() || hypers.lengthscales.iter().any(|l| !l.is_finite()) {
            return None;
        }
        let chol_zz = linalg::jittered_cholesky(&hypers.gram(inducing))?;
        Some(Self { hypers, chol_zz })
    }

    /// `W = L_K⁻¹ K_ZX` and the mean projection `P` (`W` when whitened,
    /// `K_ZZ⁻¹ K_ZX` otherwise), both `M × |xs|`.
    pub(super) fn projection(
        &self,
        inducing: &[Vec<f64>],
        xs: &[Vec<f64>],
        whiten: bool,
    ) -> Option<(DMatrix<f64>, DMatrix<f64>)> {
        let kzx = self.hypers.cross(inducing, xs);
        let w = self.chol_zz.solve_lower_triangular(&kzx)?;
        let p = if whiten {
            w.clone()
        } else {
            self.chol_zz.tr_solve_lower_triangular(&w)?
        };
        Some((w, p))
    }

    /// Variational predictive `N(c + Pᵀm, K_XX − WᵀW + (LᵀP)ᵀ(LᵀP))`.
    pub(super) fn predictive(
        &self,
        inducing: &[Vec<f64>],
        variational: &VariationalDistribution,
        xs: &[Vec<f64>],
        whiten: bool,
    ) -> Option<MultivariateNormal> {
        let (w, p) = self.projection(inducing, xs, whiten)?;
        let mean = p.tr_mul(&variational.mean).add_scalar(self.hypers.constant);
        let ltp = variational.chol.tr_mul(&p);
        let mut covariance = self.hypers.gram(xs) - w.tr_mul(&w) + ltp.tr_mul(&ltp);
        linalg::symmetrize(&mut covariance);
        Some(MultivariateNormal { mean, covariance })
    }
}

/// Sparse variational GP over the latent utility behind preference data.
///
/// Built from a [`Dataset`] of comparisons; the raw training inputs are
/// every queried item (`len · q` points). Inducing points are either
/// `2d` scrambled Sobol points followed by all training points (whitened
/// mode) or exactly the training points (unwhitened mode). Mean is a
/// learnable constant; covariance is a scaled ARD RBF kernel with priors
/// from [`KernelFactory`].
///
/// # Examples
///
/// ```
/// use prefopt::model::{ModelOptions, PosteriorPredictive, PreferentialVariationalGp};
/// use prefopt::{Comparison, Dataset, Query};
///
/// let mut data = Dataset::new(1, 2).unwrap();
/// let q = Query::new(vec![vec![0.2], vec![0.8]]).unwrap();
/// data.push(Comparison::new(q, 1).unwrap()).unwrap();
///
/// let mut rng = fastrand::Rng::with_seed(0);
/// let model = PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap();
/// let post = model.posterior(&[vec![0.5]]).unwrap();
/// assert_eq!(post.dim(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct PreferentialVariationalGp {
    pub(super) dataset: Dataset,
    pub(super) options: ModelOptions,
    pub(super) kernel: KernelFactory,
    pub(super) likelihood: PreferenceLikelihood,
    pub(super) train_x: Vec<Vec<f64>>,
    pub(super) inducing: Vec<Vec<f64>>,
    pub(super) variational: VariationalDistribution,
    pub(super) raw_hypers: Vec<f64>,
    pub(super) cache: InducingCache,
}

impl PreferentialVariationalGp {
    /// Build a model for `dataset`.
    ///
    /// The Sobol scramble seed is drawn from `rng`, so identical datasets
    /// and identical RNG states yield identical inducing points and initial
    /// variational parameters.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] in unwhitened mode with an empty dataset
    ///   (there would be no inducing points).
    /// - [`Error::Internal`] if the initial inducing covariance cannot be
    ///   factorized.
    pub fn new(dataset: &Dataset, options: ModelOptions, rng: &mut fastrand::Rng) -> Result<Self> {
        let d = dataset.input_dim();
        let likelihood = PreferenceLikelihood::new(dataset.batch_size())?;
        let train_x = dataset.flattened_points();

        let inducing = if options.whiten {
            let seed = rng.u32(..);
            let mut points = qmc::sobol_points(2 * d, d, seed, rng);
            points.extend(train_x.iter().cloned());
            points
        } else {
            train_x.clone()
        };
        if inducing.is_empty() {
            return Err(Error::InvalidConfig(
                "unwhitened model needs at least one comparison to place inducing points".into(),
            ));
        }

        let kernel = KernelFactory::new(options.prior, d);
        let raw_hypers = kernel.initial_raw();
        let cache = InducingCache::build(&kernel, &raw_hypers, &inducing)
            .ok_or(Error::Internal("inducing covariance is not positive definite"))?;
        let variational = VariationalDistribution::new(inducing.len());

        Ok(Self {
            dataset: dataset.clone(),
            options,
            kernel,
            likelihood,
            train_x,
            inducing,
            variational,
            raw_hypers,
            cache,
        })
    }

    /// A new model on this model's data plus `new_comparisons`, with
    /// inducing points recomputed from the enlarged training set.
    ///
    /// `self` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a shape error if a comparison does not match the dataset,
    /// or any error from [`new`](Self::new).
    pub fn rebuild(&self, new_comparisons: &[Comparison], rng: &mut fastrand::Rng) -> Result<Self> {
        let mut dataset = self.dataset.clone();
        dataset.extend(new_comparisons.iter().cloned())?;
        Self::new(&dataset, self.options, rng)
    }

    /// The comparisons the model was built from.
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Construction options.
    #[must_use]
    pub fn options(&self) -> ModelOptions {
        self.options
    }

    /// Items per query `q`.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.likelihood.num_points()
    }

    /// The choice likelihood.
    #[must_use]
    pub fn likelihood(&self) -> &PreferenceLikelihood {
        &self.likelihood
    }

    /// Flattened training inputs (every queried item).
    #[must_use]
    pub fn train_inputs(&self) -> &[Vec<f64>] {
        &self.train_x
    }

    /// Current decoded hyperparameters.
    #[must_use]
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.cache.hypers
    }

    /// Current raw (unconstrained) hyperparameter vector.
    #[must_use]
    pub fn raw_hyperparameters(&self) -> &[f64] {
        &self.raw_hypers
    }

    /// Draw a posterior sample path by pathwise conditioning:
    ///
    /// `f(x) = c + P(x)ᵀv + g(x) − W(x)ᵀ L_K⁻¹ g(Z)`
    ///
    /// with inducing values `v ~ q(u)` and `g` a prior draw approximated by
    /// random Fourier features of the RBF kernel. The `g` terms carry the
    /// conditional variance `K_xx − WᵀW` away from the inducing points.
    #[must_use]
    pub fn posterior_sample(&self, rng: &mut fastrand::Rng) -> PosteriorSamplePath<'_> {
        let m = self.variational.num_inducing();
        let eps: Vec<f64> = (0..m).map(|_| rng_util::standard_normal(rng)).collect();
        let values = DVector::from_vec(linalg::correlated_sample(
            &self.variational.mean,
            &self.variational.chol,
            &eps,
        ));

        let mut prior = RandomFeatures::draw(&self.cache.hypers, PRIOR_FEATURES, rng);
        let at_inducing = DVector::from_iterator(m, self.inducing.iter().map(|z| prior.evaluate(z)));
        let correction = match self.cache.chol_zz.solve_lower_triangular(&at_inducing) {
            Some(c) => c,
            None => {
                prior.weights.fill(0.0);
                DVector::zeros(m)
            }
        };
        PosteriorSamplePath {
            model: self,
            values,
            prior,
            correction,
        }
    }

    /// Replace the hyperparameters and refresh the inducing factorization.
    pub(super) fn set_raw_hyperparameters(&mut self, raw: Vec<f64>) -> Result<()> {
        self.cache = InducingCache::build(&self.kernel, &raw, &self.inducing)
            .ok_or(Error::Internal("inducing covariance is not positive definite"))?;
        self.raw_hypers = raw;
        Ok(())
    }

    /// Fresh random variational mean, identity Cholesky factor, initial
    /// hyperparameters.
    pub(super) fn reinitialize(&mut self, rng: &mut fastrand::Rng) -> Result<()> {
        let m = self.variational.num_inducing();
        self.variational = VariationalDistribution {
            mean: DVector::from_fn(m, |_, _| REINIT_MEAN_STD * rng_util::standard_normal(rng)),
            chol: DMatrix::identity(m, m),
        };
        self.set_raw_hyperparameters(self.kernel.initial_raw())
    }

    fn check_points(&self, xs: &[Vec<f64>]) -> Result<()> {
        let d = self.kernel.input_dim();
        for x in xs {
            if x.len() != d {
                return Err(Error::DimensionMismatch {
                    expected: d,
                    got: x.len(),
                });
            }
        }
        Ok(())
    }
}

impl PosteriorPredictive for PreferentialVariationalGp {
    fn input_dim(&self) -> usize {
        self.kernel.input_dim()
    }

    fn forward(&self, xs: &[Vec<f64>]) -> Result<MultivariateNormal> {
        self.check_points(xs)?;
        let hypers = &self.cache.hypers;
        Ok(MultivariateNormal {
            mean: DVector::from_element(xs.len(), hypers.mean()),
            covariance: hypers.gram(xs),
        })
    }

    fn posterior(&self, xs: &[Vec<f64>]) -> Result<MultivariateNormal> {
        self.check_points(xs)?;
        self.cache
            .predictive(&self.inducing, &self.variational, xs, self.options.whiten)
            .ok_or(Error::Internal("predictive projection failed"))
    }

    fn posterior_mean(&self, x: &[f64]) -> Result<f64> {
        let xs = [x.to_vec()];
        self.check_points(&xs)?;
        let (_, p) = self
            .cache
            .projection(&self.inducing, &xs, self.options.whiten)
            .ok_or(Error::Internal("predictive projection failed"))?;
        Ok(self.cache.hypers.constant + p.column(0).dot(&self.variational.mean))
    }
}

impl VariationalModel for PreferentialVariationalGp {
    fn inducing_points(&self) -> &[Vec<f64>] {
        &self.inducing
    }

    fn variational_distribution(&self) -> &VariationalDistribution {
        &self.variational
    }

    fn is_whitened(&self) -> bool {
        self.options.whiten
    }

    fn kl_divergence(&self) -> Result<f64> {
        elbo::kl_divergence(&self.variational, &self.cache.chol_zz, self.options.whiten)
            .ok_or(Error::Internal("KL divergence could not be evaluated"))
    }
}

/// One posterior draw of the latent utility function, usable as a
/// deterministic function of `x`.
pub struct PosteriorSamplePath<'a> {
    model: &'a PreferentialVariationalGp,
    values: DVector<f64>,
    prior: RandomFeatures,
    correction: DVector<f64>,
}

impl PosteriorSamplePath<'_> {
    /// Sampled utility at `x` (`NaN` if the projection fails).
    #[must_use]
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        let xs = [x.to_vec()];
        let model = self.model;
        match model
            .cache
            .projection(&model.inducing, &xs, model.options.whiten)
        {
            Some((w, p)) => {
                model.cache.hypers.constant + p.column(0).dot(&self.values) + self.prior.evaluate(x)
                    - w.column(0).dot(&self.correction)
            }
            None => f64::NAN,
        }
    }
}

/// A draw `g(x) = √(2s/J) Σ_j w_j cos(ω_jᵀx + b_j)` from the scaled RBF
/// prior, with `ω_j ~ N(0, diag(ℓ⁻²))`, `b_j ~ U(0, 2π)`, `w_j ~ N(0, 1)`.
struct RandomFeatures {
    frequencies: Vec<Vec<f64>>,
    phases: Vec<f64>,
    weights: Vec<f64>,
    scale: f64,
}

impl RandomFeatures {
    fn draw(hypers: &Hyperparameters, count: u32, rng: &mut fastrand::Rng) -> Self {
        let mut frequencies = Vec::new();
        let mut phases = Vec::new();
        let mut weights = Vec::new();
        for _ in 0..count {
            frequencies.push(
                hypers
                    .lengthscales
                    .iter()
                    .map(|l| rng_util::standard_normal(rng) / l)
                    .collect(),
            );
            phases.push(core::f64::consts::TAU * rng.f64());
            weights.push(rng_util::standard_normal(rng));
        }
        Self {
            frequencies,
            phases,
            weights,
            scale: (2.0 * hypers.outputscale / f64::from(count)).sqrt(),
        }
    }

    fn evaluate(&self, x: &[f64]) -> f64 {
        let sum: f64 = self
            .frequencies
            .iter()
            .zip(&self.phases)
            .zip(&self.weights)
            .map(|((omega, b), w)| {
                let arg: f64 = omega.iter().zip(x).map(|(o, xi)| o * xi).sum::<f64>() + b;
                w * arg.cos()
            })
            .sum();
        self.scale * sum
    }
}
