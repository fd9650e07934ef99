//! Comparison oracles: who answers "which of these items wins?".
//!
//! The loop only ever talks to a [`ComparisonOracle`]. A human-in-the-loop
//! front end implements it directly; simulations use [`SimulatedOracle`],
//! which perturbs the values of an [`Objective`] with comparison noise of a
//! configured [`NoiseType`] and returns the arg-max.
//!
//! | Noise type | Perturbation of each item's utility | `P(wrong winner)` for a gap `Δ` (q = 2) |
//! |------------|-------------------------------------|-----------------------------------------|
//! | `noiseless` | none | 0 |
//! | `probit` | `σ · N(0, 1)` | `Φ(−Δ / (σ√2))` |
//! | `logit` | `σ · Gumbel(0, 1)` | `1 / (1 + exp(Δ / σ))` |
//!
//! Gumbel perturbations make the logit oracle's choice probabilities exactly
//! the softmax of `f / σ`, matching the model's likelihood.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::config::ExperimentConfig;
use crate::error::{Error, Result};
use crate::objective::Objective;
use crate::rng_util;
use crate::types::Query;

/// Number of random top-point pairs used by [`estimate_noise_level`].
const CALIBRATION_PAIRS: usize = 4096;
const BISECTION_STEPS: usize = 100;

/// Link between a utility gap and the probability of a wrong answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseType {
    /// The item with the largest utility always wins.
    Noiseless,
    /// Gaussian perturbations.
    Probit,
    /// Gumbel perturbations (softmax choice).
    #[default]
    Logit,
}

impl NoiseType {
    /// Identifier used in configuration files.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Noiseless => "noiseless",
            Self::Probit => "probit",
            Self::Logit => "logit",
        }
    }

    /// Probability that the worse of two items wins when their utilities
    /// differ by `gap` and the noise scale is `sigma`.
    #[must_use]
    pub fn error_probability(self, gap: f64, sigma: f64) -> f64 {
        let gap = gap.abs();
        if gap <= 0.0 {
            return 0.5;
        }
        match self {
            Self::Noiseless => 0.0,
            _ if sigma <= 0.0 => 0.0,
            // Φ(−Δ / (σ√2)) = ½ erfc(Δ / 2σ)
            Self::Probit => 0.5 * erfc(gap / (2.0 * sigma)),
            Self::Logit => 1.0 / (1.0 + (gap / sigma).exp()),
        }
    }
}

/// Whether two `(type, σ)` settings perturb comparisons the same way.
///
/// A zero scale is noiseless whatever the type.
pub(crate) fn same_noise(a: (NoiseType, f64), b: (NoiseType, f64)) -> bool {
    let silent = |(t, s): (NoiseType, f64)| t == NoiseType::Noiseless || s == 0.0;
    match (silent(a), silent(b)) {
        (true, true) => true,
        (false, false) => a == b,
        _ => false,
    }
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for NoiseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "noiseless" => Ok(Self::Noiseless),
            "probit" => Ok(Self::Probit),
            "logit" => Ok(Self::Logit),
            other => Err(Error::InvalidConfig(format!(
                "unknown noise type {other:?}; expected noiseless, probit or logit"
            ))),
        }
    }
}

/// Answers comparisons.
pub trait ComparisonOracle {
    /// Index of the winning item of `query`.
    ///
    /// Stochastic oracles draw their noise from `rng` only, so equal RNG
    /// states give equal answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oracle`] if no valid winner can be produced.
    fn compare(&mut self, query: &Query, rng: &mut fastrand::Rng) -> Result<usize>;

    /// Noise-free utility at `x`, for reporting. `None` when unknown
    /// (e.g. a human oracle).
    fn ground_truth(&self, _x: &[f64]) -> Option<f64> {
        None
    }

    /// The comparison noise this oracle applies, if it is known. An
    /// [`Experiment`](crate::Experiment) refuses an oracle whose noise
    /// differs from its configuration.
    fn noise(&self) -> Option<(NoiseType, f64)> {
        None
    }
}

/// An oracle backed by a known objective and a comparison-noise model.
///
/// ```
/// use prefopt::oracle::{ComparisonOracle, NoiseType, SimulatedOracle};
/// use prefopt::Query;
///
/// let mut oracle = SimulatedOracle::new(|x: &[f64]| x[0], NoiseType::Noiseless, 0.0);
/// let query = Query::new(vec![vec![0.2], vec![0.7]]).unwrap();
/// let mut rng = fastrand::Rng::with_seed(0);
/// assert_eq!(oracle.compare(&query, &mut rng).unwrap(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct SimulatedOracle<O> {
    objective: O,
    noise_type: NoiseType,
    noise_level: f64,
}

impl<O: Objective> SimulatedOracle<O> {
    /// Wraps `objective` with noise of the given type and scale `σ`.
    #[must_use]
    pub fn new(objective: O, noise_type: NoiseType, noise_level: f64) -> Self {
        Self {
            objective,
            noise_type,
            noise_level,
        }
    }

    /// Wraps `objective` with the comparison noise named in `config`.
    ///
    /// ```
    /// use prefopt::prelude::*;
    ///
    /// let config = ExperimentConfig::builder("linear", 1)
    ///     .noise(NoiseType::Probit, 0.3)
    ///     .build()
    ///     .unwrap();
    /// let oracle = SimulatedOracle::from_config(|x: &[f64]| x[0], &config);
    /// assert_eq!(oracle.noise_type(), NoiseType::Probit);
    /// assert_eq!(oracle.noise_level(), 0.3);
    /// ```
    #[must_use]
    pub fn from_config(objective: O, config: &ExperimentConfig) -> Self {
        Self::new(objective, config.comp_noise_type, config.comp_noise)
    }

    /// The wrapped objective.
    #[must_use]
    pub fn objective(&self) -> &O {
        &self.objective
    }

    /// Noise type.
    #[must_use]
    pub fn noise_type(&self) -> NoiseType {
        self.noise_type
    }

    /// Noise scale `σ`.
    #[must_use]
    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }

    fn perturbation(&self, rng: &mut fastrand::Rng) -> f64 {
        match self.noise_type {
            NoiseType::Noiseless => 0.0,
            NoiseType::Probit => self.noise_level * rng_util::standard_normal(rng),
            NoiseType::Logit => self.noise_level * rng_util::standard_gumbel(rng),
        }
    }
}

impl<O: Objective> ComparisonOracle for SimulatedOracle<O> {
    fn compare(&mut self, query: &Query, rng: &mut fastrand::Rng) -> Result<usize> {
        let mut winner = 0;
        let mut best = f64::NEG_INFINITY;
        for (i, item) in query.items().iter().enumerate() {
            let value = self.objective.evaluate(item);
            if !value.is_finite() {
                return Err(Error::Oracle(format!(
                    "objective returned {value} for item {i} ({item:?})"
                )));
            }
            let noisy = value + self.perturbation(rng);
            if noisy > best {
                best = noisy;
                winner = i;
            }
        }
        Ok(winner)
    }

    fn ground_truth(&self, x: &[f64]) -> Option<f64> {
        Some(self.objective.evaluate(x))
    }

    fn noise(&self) -> Option<(NoiseType, f64)> {
        Some((self.noise_type, self.noise_level))
    }
}

/// Calibrate the comparison-noise scale `σ` for an objective.
///
/// Samples `num_samples` uniform points in `[0, 1]^input_dim`, keeps the top
/// `top_proportion` of them by objective value, and bisects (in log space)
/// for the `σ` at which a comparison between two random top points has the
/// wrong winner with probability `target_error` on average.
///
/// # Errors
///
/// - [`Error::InvalidDimension`] if `input_dim == 0`.
/// - [`Error::InvalidConfig`] for `noise_type == Noiseless`, a target
///   outside `(0, 0.5)`, a proportion outside `(0, 1]`, fewer than two top
///   points, or an objective that is constant on the top points.
/// - [`Error::Oracle`] if the objective returns a non-finite value.
pub fn estimate_noise_level<O: Objective + ?Sized>(
    objective: &O,
    input_dim: usize,
    target_error: f64,
    top_proportion: f64,
    num_samples: usize,
    noise_type: NoiseType,
    rng: &mut fastrand::Rng,
) -> Result<f64> {
    if input_dim == 0 {
        return Err(Error::InvalidDimension(input_dim));
    }
    if noise_type == NoiseType::Noiseless {
        return Err(Error::InvalidConfig(
            "noise level calibration needs a probit or logit noise type".into(),
        ));
    }
    if !(target_error > 0.0 && target_error < 0.5) {
        return Err(Error::InvalidConfig(format!(
            "target_error must lie in (0, 0.5), got {target_error}"
        )));
    }
    if !(top_proportion > 0.0 && top_proportion <= 1.0) {
        return Err(Error::InvalidConfig(format!(
            "top_proportion must lie in (0, 1], got {top_proportion}"
        )));
    }

    let mut values = Vec::with_capacity(num_samples);
    for _ in 0..num_samples {
        let x = rng_util::unit_point(rng, input_dim);
        let v = objective.evaluate(&x);
        if !v.is_finite() {
            return Err(Error::Oracle(format!("objective returned {v} at {x:?}")));
        }
        values.push(v);
    }
    values.sort_by(|a, b| b.total_cmp(a));
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let top = ((top_proportion * num_samples as f64).ceil() as usize).min(num_samples);
    if top < 2 {
        return Err(Error::InvalidConfig(format!(
            "need at least two top points, got {top} from {num_samples} samples"
        )));
    }
    values.truncate(top);

    let gaps: Vec<f64> = (0..CALIBRATION_PAIRS)
        .map(|_| {
            let i = rng.usize(..top);
            let j = (i + 1 + rng.usize(..top - 1)) % top;
            (values[i] - values[j]).abs()
        })
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let n = gaps.len() as f64;
    let mean_error = |sigma: f64| -> f64 {
        gaps.iter()
            .map(|&g| noise_type.error_probability(g, sigma))
            .sum::<f64>()
            / n
    };

    let mut lo = 1e-12_f64;
    let mut hi = 1.0_f64;
    if mean_error(lo) >= target_error {
        return Err(Error::InvalidConfig(
            "objective is (nearly) constant on the top points; target error is unreachable".into(),
        ));
    }
    while mean_error(hi) < target_error {
        hi *= 2.0;
        if !hi.is_finite() {
            return Err(Error::Internal("noise level bisection did not bracket the target"));
        }
    }
    for _ in 0..BISECTION_STEPS {
        let mid = (lo * hi).sqrt();
        if mean_error(mid) < target_error {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let sigma = (lo * hi).sqrt();
    trace_debug!(%noise_type, sigma, target_error, "calibrated comparison noise");
    Ok(sigma)
}
