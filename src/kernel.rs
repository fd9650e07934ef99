//! GP mean/covariance construction with hyperparameter priors.
//!
//! The latent utility uses a constant mean and a scaled RBF kernel with one
//! length scale per input dimension (ARD):
//!
//! ```text
//! k(x, y) = s · exp(-½ Σ_i ((x_i − y_i) / ℓ_i)²)
//! ```
//!
//! Hyperparameters live in an unconstrained "raw" vector of length `d + 2`
//! (`d` length scales, the output scale `s`, the constant mean `c`) that a
//! [`KernelFactory`] decodes according to its [`PriorConfig`].
//!
//! | Configuration | Length-scale prior | Output-scale prior | Transform |
//! |---------------|--------------------|--------------------|-----------|
//! | [`PriorConfig::Default`] | `Gamma(3, 6 / width)` | `Gamma(2, 0.15)` | `exp` |
//! | [`PriorConfig::PairwiseBox`] | `Gamma(1.2, 0.5)`, `ℓ ≥ 1e-4` | smoothed box on `[0.01, 100]` | `exp` / sigmoid onto `[0.005, 200]` |
//!
//! The default keeps typical length scales near a sixth to a third of the
//! box width, away from degenerate values while the variational posterior
//! is still uninformative.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Gamma distribution prior (shape/rate parameterization).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GammaPrior {
    /// Shape parameter `α`.
    pub concentration: f64,
    /// Rate parameter `β`.
    pub rate: f64,
}

impl GammaPrior {
    /// Creates a new Gamma prior.
    #[must_use]
    pub const fn new(concentration: f64, rate: f64) -> Self {
        Self {
            concentration,
            rate,
        }
    }

    /// Log density at `x` (`-∞` for `x ≤ 0`).
    #[must_use]
    pub fn log_prob(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let a = self.concentration;
        let b = self.rate;
        a * b.ln() - ln_gamma(a) + (a - 1.0) * x.ln() - b * x
    }

    /// Mode of the distribution, `max(0, (α − 1) / β)`.
    #[must_use]
    pub fn mode(&self) -> f64 {
        ((self.concentration - 1.0) / self.rate).max(0.0)
    }
}

/// Approximately uniform prior on `[a, b]` with Gaussian tails of width `sigma`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothedBoxPrior {
    /// Lower edge of the box.
    pub a: f64,
    /// Upper edge of the box.
    pub b: f64,
    /// Width of the Gaussian tails outside the box.
    pub sigma: f64,
}

impl SmoothedBoxPrior {
    /// Creates a smoothed box prior with the default tail width `0.01`.
    #[must_use]
    pub const fn new(a: f64, b: f64) -> Self {
        Self { a, b, sigma: 0.01 }
    }

    /// Log density at `x`.
    #[must_use]
    pub fn log_prob(&self, x: f64) -> f64 {
        let tail = (self.a - x).max(0.0) + (x - self.b).max(0.0);
        let norm = (self.b - self.a) + (core::f64::consts::TAU).sqrt() * self.sigma;
        -norm.ln() - 0.5 * (tail / self.sigma).powi(2)
    }
}

/// Which hyperparameter prior family the kernel uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorConfig {
    /// Gamma priors on length scales and output scale, log-transformed.
    #[default]
    Default,
    /// Bounded output scale with a smoothed box prior; more stable in
    /// exploratory settings.
    PairwiseBox,
}

const PAIRWISE_LS_LOWER: f64 = 1e-4;
const PAIRWISE_OS_LOWER: f64 = 0.005;
const PAIRWISE_OS_UPPER: f64 = 200.0;

/// Decoded kernel and mean hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// ARD length scales, one per input dimension.
    pub lengthscales: Vec<f64>,
    /// Output scale `s`.
    pub outputscale: f64,
    /// Constant mean `c`.
    pub constant: f64,
}

impl Hyperparameters {
    /// Scaled RBF covariance between two points.
    #[must_use]
    pub fn kernel(&self, x: &[f64], y: &[f64]) -> f64 {
        let mut r_sq = 0.0;
        for ((a, b), l) in x.iter().zip(y).zip(&self.lengthscales) {
            let diff = (a - b) / l;
            r_sq += diff * diff;
        }
        self.outputscale * (-0.5 * r_sq).exp()
    }

    /// Prior mean at any point.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.constant
    }

    /// Gram matrix `K(xs, xs)`.
    #[must_use]
    pub fn gram(&self, xs: &[Vec<f64>]) -> DMatrix<f64> {
        let n = xs.len();
        let mut k = DMatrix::zeros(n, n);
        for i in 0..n {
            k[(i, i)] = self.outputscale;
            for j in 0..i {
                let v = self.kernel(&xs[i], &xs[j]);
                k[(i, j)] = v;
                k[(j, i)] = v;
            }
        }
        k
    }

    /// Cross-covariance matrix `K(xs, ys)` (`|xs| × |ys|`).
    #[must_use]
    pub fn cross(&self, xs: &[Vec<f64>], ys: &[Vec<f64>]) -> DMatrix<f64> {
        DMatrix::from_fn(xs.len(), ys.len(), |i, j| self.kernel(&xs[i], &ys[j]))
    }
}

/// Builds hyperparameters and their log prior from raw, unconstrained vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelFactory {
    prior: PriorConfig,
    input_dim: usize,
    lengthscale_prior: GammaPrior,
}

impl KernelFactory {
    /// Create a factory for `[0, 1]^input_dim`.
    #[must_use]
    pub fn new(prior: PriorConfig, input_dim: usize) -> Self {
        // The search box is the unit cube, so every dimension has width 1.
        let box_width = 1.0;
        let lengthscale_prior = match prior {
            PriorConfig::Default => GammaPrior::new(3.0, 6.0 / box_width),
            PriorConfig::PairwiseBox => GammaPrior::new(1.2, 0.5),
        };
        Self {
            prior,
            input_dim,
            lengthscale_prior,
        }
    }

    /// The prior family in use.
    #[must_use]
    pub fn prior(&self) -> PriorConfig {
        self.prior
    }

    /// Input dimension `d`.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Length of the raw hyperparameter vector (`d + 2`).
    #[must_use]
    pub fn n_raw(&self) -> usize {
        self.input_dim + 2
    }

    /// Raw vector holding the initial hyperparameters.
    #[must_use]
    pub fn initial_raw(&self) -> Vec<f64> {
        let (ls_raw, os_raw) = match self.prior {
            PriorConfig::Default => (core::f64::consts::LN_2.ln(), core::f64::consts::LN_2.ln()),
            PriorConfig::PairwiseBox => {
                let mode = self.lengthscale_prior.mode();
                let frac = (1.0 - PAIRWISE_OS_LOWER) / (PAIRWISE_OS_UPPER - PAIRWISE_OS_LOWER);
                ((mode - PAIRWISE_LS_LOWER).ln(), (frac / (1.0 - frac)).ln())
            }
        };
        let mut raw = vec![ls_raw; self.input_dim];
        raw.push(os_raw);
        raw.push(0.0);
        raw
    }

    /// Decode a raw vector into constrained hyperparameters.
    #[must_use]
    pub fn decode(&self, raw: &[f64]) -> Hyperparameters {
        let d = self.input_dim;
        let (lengthscales, outputscale) = match self.prior {
            PriorConfig::Default => (raw[..d].iter().map(|r| r.exp()).collect(), raw[d].exp()),
            PriorConfig::PairwiseBox => (
                raw[..d]
                    .iter()
                    .map(|r| PAIRWISE_LS_LOWER + r.exp())
                    .collect(),
                PAIRWISE_OS_LOWER + (PAIRWISE_OS_UPPER - PAIRWISE_OS_LOWER) * sigmoid(raw[d]),
            ),
        };
        Hyperparameters {
            lengthscales,
            outputscale,
            constant: raw[d + 1],
        }
    }

    /// Log prior density of the decoded hyperparameters.
    ///
    /// The constant mean carries no prior.
    #[must_use]
    pub fn log_prior(&self, raw: &[f64]) -> f64 {
        let hp = self.decode(raw);
        let ls: f64 = hp
            .lengthscales
            .iter()
            .map(|&l| self.lengthscale_prior.log_prob(l))
            .sum();
        let os = match self.prior {
            PriorConfig::Default => GammaPrior::new(2.0, 0.15).log_prob(hp.outputscale),
            PriorConfig::PairwiseBox => SmoothedBoxPrior::new(0.01, 100.0).log_prob(hp.outputscale),
        };
        ls + os
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
