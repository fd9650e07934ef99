//! Choosing the next comparison.
//!
//! An [`AcquisitionSelector`] turns a fitted model into the next [`Query`]
//! using one of the strategies in [`Algorithm`]:
//!
//! | Algorithm | Score of a query `x₁ … x_q` |
//! |-----------|------------------------------|
//! | `Random` | none, `q` uniform points |
//! | `EMOV` | `E[max_i f(x_i)]` (expected maximum utility) |
//! | `EPOV` | `E[Σ_i p_i(f) f(x_i)]`, the utility of the item the oracle is expected to choose |
//! | `NEI` | `E[max(max_i f(x_i) − max_b f(b), 0)]` over a baseline of the best training points |
//! | `TS` | one posterior sample path per item, each maximized separately |
//! | `BALD` | mutual information between the outcome and the latent utility |
//! | `MaxEnt` | entropy of the predicted outcome |
//!
//! Monte-Carlo scores use a fixed set of normal base samples per call to
//! [`AcquisitionSelector::select`], so they are deterministic functions of
//! the query and can be maximized with local search. The maximizer
//! ([`optimize_acquisition`]) scores `raw_samples` uniform candidates, runs
//! projected gradient ascent from the best `num_restarts`, and clamps every
//! iterate into `[0, 1]^d`.

mod functions;
mod optimize;

use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use functions::{
    BayesianActiveLearning, ExpectedMaxValue, ExpectedPreferredValue, MaxEntropy,
    NoisyExpectedImprovement, PosteriorMean, SamplePathValue,
};
pub use optimize::optimize_acquisition;

use crate::error::{Error, Result};
use crate::model::{PosteriorPredictive, PreferentialVariationalGp};
use crate::types::Query;
use crate::{qmc, rng_util};

/// Scores a candidate query (a list of `q` points in `[0, 1]^d`).
///
/// Larger is better. Implementations return `NaN` or `-∞` for candidates
/// they cannot score; the optimizer skips those.
pub trait AcquisitionFunction {
    /// Score of the candidate query `items`.
    fn evaluate(&self, items: &[Vec<f64>]) -> f64;
}

impl<F> AcquisitionFunction for F
where
    F: Fn(&[Vec<f64>]) -> f64,
{
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        self(items)
    }
}

/// Query selection strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Uniform random queries.
    Random,
    /// Expected maximum utility over the query.
    #[default]
    #[serde(rename = "EMOV")]
    Emov,
    /// Expected utility of the preferred item.
    #[serde(rename = "EPOV")]
    Epov,
    /// Noisy expected improvement over the best training points.
    #[serde(rename = "NEI")]
    Nei,
    /// Thompson sampling.
    #[serde(rename = "TS")]
    Ts,
    /// Bayesian active learning by disagreement.
    #[serde(rename = "BALD")]
    Bald,
    /// Maximum outcome entropy.
    MaxEnt,
}

impl Algorithm {
    /// Every strategy, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Random,
        Self::Emov,
        Self::Epov,
        Self::Nei,
        Self::Ts,
        Self::Bald,
        Self::MaxEnt,
    ];

    /// Identifier used in configuration files and result paths.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Random => "Random",
            Self::Emov => "EMOV",
            Self::Epov => "EPOV",
            Self::Nei => "NEI",
            Self::Ts => "TS",
            Self::Bald => "BALD",
            Self::MaxEnt => "MaxEnt",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.id() == s)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "unknown algorithm {s:?}; expected one of Random, EMOV, EPOV, NEI, TS, BALD, MaxEnt"
                ))
            })
    }
}

/// Tuning knobs for acquisition maximization.
///
/// | Field | Default |
/// |-------|---------|
/// | `raw_samples` | 256 |
/// | `num_restarts` | 4 |
/// | `max_local_iter` | 40 |
/// | `mc_samples` | 64 |
/// | `baseline_size` | 32 |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionOptions {
    /// Uniform candidates scored before local search.
    pub raw_samples: usize,
    /// Best raw candidates used as local-search starting points.
    pub num_restarts: usize,
    /// Gradient steps per restart.
    pub max_local_iter: usize,
    /// Monte-Carlo base samples per score.
    pub mc_samples: usize,
    /// Training points kept in the NEI baseline.
    pub baseline_size: usize,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            raw_samples: 256,
            num_restarts: 4,
            max_local_iter: 40,
            mc_samples: 64,
            baseline_size: 32,
        }
    }
}

impl AcquisitionOptions {
    /// Check that the options describe a runnable search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `raw_samples`, `num_restarts` or
    /// `mc_samples` is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("raw_samples", self.raw_samples),
            ("num_restarts", self.num_restarts),
            ("mc_samples", self.mc_samples),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!(
                    "acquisition {name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// A user-supplied score for a candidate query under a fitted model.
pub type QueryScorer = Arc<dyn Fn(&PreferentialVariationalGp, &[Vec<f64>]) -> f64 + Send + Sync>;

/// Proposes the next query from a fitted model.
#[derive(Clone, Default)]
pub struct AcquisitionSelector {
    algorithm: Algorithm,
    options: AcquisitionOptions,
    scorer: Option<QueryScorer>,
}

impl fmt::Debug for AcquisitionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionSelector")
            .field("algorithm", &self.algorithm)
            .field("options", &self.options)
            .field("custom_scorer", &self.scorer.is_some())
            .finish()
    }
}

impl AcquisitionSelector {
    /// Creates a selector for `algorithm`.
    #[must_use]
    pub fn new(algorithm: Algorithm, options: AcquisitionOptions) -> Self {
        Self {
            algorithm,
            options,
            scorer: None,
        }
    }

    /// Score queries with `scorer` instead of the built-in strategy.
    ///
    /// The query is maximized over `[0, 1]^{q·d}` with the same optimizer
    /// and options as the built-in scores.
    ///
    /// ```
    /// use prefopt::prelude::*;
    ///
    /// // Prefer queries whose items are far apart.
    /// let selector = AcquisitionSelector::new(Algorithm::Emov, AcquisitionOptions::default())
    ///     .scored_by(|_, items| (items[0][0] - items[1][0]).abs());
    /// assert!(selector.has_custom_scorer());
    /// ```
    #[must_use]
    pub fn scored_by<F>(mut self, scorer: F) -> Self
    where
        F: Fn(&PreferentialVariationalGp, &[Vec<f64>]) -> f64 + Send + Sync + 'static,
    {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    /// Whether queries are scored by a function set with
    /// [`scored_by`](Self::scored_by).
    #[must_use]
    pub fn has_custom_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    /// The strategy in use.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The optimizer options in use.
    #[must_use]
    pub fn options(&self) -> &AcquisitionOptions {
        &self.options
    }

    /// Select the next query of `model.batch_size()` items.
    ///
    /// Every returned item lies in `[0, 1]^d`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquisitionOptimization`] if no candidate received
    /// a finite score; callers are expected to fall back to
    /// [`random_query`](Self::random_query).
    pub fn select(&self, model: &PreferentialVariationalGp, rng: &mut fastrand::Rng) -> Result<Query> {
        let d = model.input_dim();
        let q = model.batch_size();
        let mc = self.options.mc_samples;

        if let Some(scorer) = &self.scorer {
            let acq = |items: &[Vec<f64>]| scorer(model, items);
            return Query::new(optimize_acquisition(&acq, q, d, &self.options, rng)?);
        }

        let items = match self.algorithm {
            Algorithm::Random => return Self::random_query(d, q, rng),
            Algorithm::Ts => {
                let mut items = Vec::with_capacity(q);
                for _ in 0..q {
                    let path = model.posterior_sample(rng);
                    let acq = SamplePathValue::new(&path);
                    let mut best = optimize_acquisition(&acq, 1, d, &self.options, rng)?;
                    items.append(&mut best);
                }
                items
            }
            Algorithm::Emov => {
                let acq = ExpectedMaxValue::new(model, qmc::normal_base_samples(mc, q, rng));
                optimize_acquisition(&acq, q, d, &self.options, rng)?
            }
            Algorithm::Epov => {
                let acq = ExpectedPreferredValue::new(model, qmc::normal_base_samples(mc, q, rng));
                optimize_acquisition(&acq, q, d, &self.options, rng)?
            }
            Algorithm::Nei => {
                let baseline = best_training_points(model, self.options.baseline_size);
                let base = qmc::normal_base_samples(mc, q + baseline.len(), rng);
                let acq = NoisyExpectedImprovement::new(model, baseline, base);
                optimize_acquisition(&acq, q, d, &self.options, rng)?
            }
            Algorithm::Bald => {
                let acq = BayesianActiveLearning::new(model, qmc::normal_base_samples(mc, q, rng));
                optimize_acquisition(&acq, q, d, &self.options, rng)?
            }
            Algorithm::MaxEnt => {
                let acq = MaxEntropy::new(model, qmc::normal_base_samples(mc, q, rng));
                optimize_acquisition(&acq, q, d, &self.options, rng)?
            }
        };
        Query::new(items)
    }

    /// `q` independent uniform points in `[0, 1]^d`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `d == 0` or `q < 2`.
    pub fn random_query(d: usize, q: usize, rng: &mut fastrand::Rng) -> Result<Query> {
        Query::new((0..q).map(|_| rng_util::unit_point(rng, d)).collect())
    }

    /// The maximizer of the posterior mean over `[0, 1]^d`, used as the
    /// running best-point estimate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquisitionOptimization`] if the posterior mean is
    /// nowhere finite.
    pub fn maximize_posterior_mean(
        &self,
        model: &PreferentialVariationalGp,
        rng: &mut fastrand::Rng,
    ) -> Result<Vec<f64>> {
        let acq = PosteriorMean::new(model);
        let mut items = optimize_acquisition(&acq, 1, model.input_dim(), &self.options, rng)?;
        items.pop().ok_or(Error::AcquisitionOptimization)
    }
}

/// Up to `k` distinct training inputs with the highest posterior mean
/// (stable order among ties).
fn best_training_points(model: &PreferentialVariationalGp, k: usize) -> Vec<Vec<f64>> {
    let mut scored: Vec<(f64, &Vec<f64>)> = Vec::new();
    for x in model.train_inputs() {
        if scored.iter().any(|(_, y)| *y == x) {
            continue;
        }
        if let Ok(m) = model.posterior_mean(x)
            && m.is_finite()
        {
            scored.push((m, x));
        }
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().take(k).map(|(_, x)| x.clone()).collect()
}
