//! Sparse variational GP over latent utility, and its fitter.
//!
//! The concrete model, [`PreferentialVariationalGp`], implements two
//! independent capabilities:
//!
//! - [`PosteriorPredictive`] — evaluate the GP prior (`forward`) and the
//!   variational predictive distribution (`posterior`) at query points.
//! - [`VariationalModel`] — own the inducing points and the Gaussian
//!   variational distribution over their utilities, and report the KL term
//!   of the evidence lower bound.
//!
//! Models are values: adding data goes through
//! [`PreferentialVariationalGp::rebuild`], which returns a fresh model with
//! recomputed inducing points and leaves the old one untouched. Only
//! [`ModelFitter`] changes the variational parameters and hyperparameters,
//! and it does so on a model it owns.

mod elbo;
mod fit;
mod variational;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

pub use fit::{FitOptimizer, FitOptions, FitReport, ModelFitter};
pub use variational::{PosteriorSamplePath, PreferentialVariationalGp, VariationalDistribution};

use crate::error::Result;
use crate::kernel::PriorConfig;

/// A multivariate Gaussian with dense mean and covariance.
#[derive(Clone, Debug, PartialEq)]
pub struct MultivariateNormal {
    /// Mean vector.
    pub mean: DVector<f64>,
    /// Covariance matrix (symmetric).
    pub covariance: DMatrix<f64>,
}

impl MultivariateNormal {
    /// Number of jointly distributed points.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Marginal variances (diagonal of the covariance).
    #[must_use]
    pub fn variance(&self) -> Vec<f64> {
        (0..self.dim()).map(|i| self.covariance[(i, i)]).collect()
    }
}

/// Forward evaluation of a latent-utility model at arbitrary points.
pub trait PosteriorPredictive {
    /// Input dimension `d`.
    fn input_dim(&self) -> usize;

    /// GP prior over the latent utility at `xs`: constant mean and scaled
    /// RBF covariance, with no data conditioning.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a point has the wrong dimension.
    fn forward(&self, xs: &[Vec<f64>]) -> Result<MultivariateNormal>;

    /// Variational predictive distribution over the latent utility at `xs`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a point has the wrong dimension, or
    /// [`Error::Internal`](crate::Error::Internal) if the inducing
    /// covariance cannot be factorized.
    fn posterior(&self, xs: &[Vec<f64>]) -> Result<MultivariateNormal>;

    /// Predictive mean at a single point.
    ///
    /// # Errors
    ///
    /// Same as [`posterior`](Self::posterior).
    fn posterior_mean(&self, x: &[f64]) -> Result<f64>;
}

/// Ownership of inducing points and the variational distribution.
pub trait VariationalModel {
    /// Inducing locations (fixed for the lifetime of the model).
    fn inducing_points(&self) -> &[Vec<f64>];

    /// Gaussian variational distribution over the inducing utilities.
    fn variational_distribution(&self) -> &VariationalDistribution;

    /// Whether the variational parameters are whitened relative to the prior.
    fn is_whitened(&self) -> bool;

    /// `KL(q(u) ‖ p(u))` at the current parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`](crate::Error::Internal) if the inducing
    /// covariance cannot be factorized.
    fn kl_divergence(&self) -> Result<f64>;
}

/// Construction options for [`PreferentialVariationalGp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Whitened variational parameterization with Sobol-augmented inducing
    /// points (`true`, the default) or unwhitened with inducing points equal
    /// to the training points.
    pub whiten: bool,
    /// Hyperparameter prior family.
    pub prior: PriorConfig,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            whiten: true,
            prior: PriorConfig::Default,
        }
    }
}
