use crate::likelihood::{self, PreferenceLikelihood};
use crate::linalg;
use crate::model::{PosteriorPredictive, PosteriorSamplePath, PreferentialVariationalGp};

use super::AcquisitionFunction;

/// Joint posterior draws of the latent utility at `points`, one per base sample.
fn joint_draws(
    model: &PreferentialVariationalGp,
    points: &[Vec<f64>],
    base: &[Vec<f64>],
) -> Option<Vec<Vec<f64>>> {
    let post = model.posterior(points).ok()?;
    if post.mean.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let factor = linalg::sampling_factor(&post.covariance);
    Some(
        base.iter()
            .map(|z| linalg::correlated_sample(&post.mean, &factor, z))
            .collect(),
    )
}

fn mean_over<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, n) = values.fold((0.0, 0_u32), |(s, n), v| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / f64::from(n) }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

// ---------------------------------------------------------------------------
// Utility-based
// ---------------------------------------------------------------------------

/// `E[max_i f(x_i)]`: expected maximum utility over the query (EMOV).
pub struct ExpectedMaxValue<'a> {
    model: &'a PreferentialVariationalGp,
    base: Vec<Vec<f64>>,
}

impl<'a> ExpectedMaxValue<'a> {
    /// `base` holds standard-normal draws of length `q`.
    #[must_use]
    pub fn new(model: &'a PreferentialVariationalGp, base: Vec<Vec<f64>>) -> Self {
        Self { model, base }
    }
}

impl AcquisitionFunction for ExpectedMaxValue<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        expected_max(self.model, items, &self.base)
    }
}

fn expected_max(model: &PreferentialVariationalGp, items: &[Vec<f64>], base: &[Vec<f64>]) -> f64 {
    joint_draws(model, items, base).map_or(f64::NAN, |draws| mean_over(draws.iter().map(|f| max_of(f))))
}

/// `E[Σ_i p_i(f) f(x_i)]` with `p(f)` the softmax choice probabilities:
/// the expected utility of the item the oracle would pick (EPOV).
pub struct ExpectedPreferredValue<'a> {
    model: &'a PreferentialVariationalGp,
    base: Vec<Vec<f64>>,
}

impl<'a> ExpectedPreferredValue<'a> {
    /// `base` holds standard-normal draws of length `q`.
    #[must_use]
    pub fn new(model: &'a PreferentialVariationalGp, base: Vec<Vec<f64>>) -> Self {
        Self { model, base }
    }
}

impl AcquisitionFunction for ExpectedPreferredValue<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        let lik = self.model.likelihood();
        joint_draws(self.model, items, &self.base).map_or(f64::NAN, |draws| {
            mean_over(draws.iter().map(|f| {
                lik.choice_probabilities(f)
                    .iter()
                    .zip(f)
                    .map(|(p, v)| p * v)
                    .sum::<f64>()
            }))
        })
    }
}

/// Noisy expected improvement over a baseline of training points:
/// `E[max(max_i f(x_i) − max_b f(b), 0)]`, with the query and baseline
/// sampled jointly. An empty baseline reduces to [`ExpectedMaxValue`].
pub struct NoisyExpectedImprovement<'a> {
    model: &'a PreferentialVariationalGp,
    baseline: Vec<Vec<f64>>,
    base: Vec<Vec<f64>>,
}

impl<'a> NoisyExpectedImprovement<'a> {
    /// `base` holds standard-normal draws of length `q + baseline.len()`.
    #[must_use]
    pub fn new(
        model: &'a PreferentialVariationalGp,
        baseline: Vec<Vec<f64>>,
        base: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            model,
            baseline,
            base,
        }
    }
}

impl AcquisitionFunction for NoisyExpectedImprovement<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        if self.baseline.is_empty() {
            return expected_max(self.model, items, &self.base);
        }
        let q = items.len();
        let mut points = items.to_vec();
        points.extend(self.baseline.iter().cloned());
        joint_draws(self.model, &points, &self.base).map_or(f64::NAN, |draws| {
            mean_over(
                draws
                    .iter()
                    .map(|f| (max_of(&f[..q]) - max_of(&f[q..])).max(0.0)),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Information-based
// ---------------------------------------------------------------------------

fn outcome_probabilities(lik: &PreferenceLikelihood, draws: &[Vec<f64>]) -> Vec<Vec<f64>> {
    draws.iter().map(|f| lik.choice_probabilities(f)).collect()
}

fn marginal(probs: &[Vec<f64>]) -> Vec<f64> {
    let q = probs.first().map_or(0, Vec::len);
    let mut avg = vec![0.0; q];
    for p in probs {
        for (a, v) in avg.iter_mut().zip(p) {
            *a += v;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let n = probs.len() as f64;
    for a in &mut avg {
        *a /= n;
    }
    avg
}

/// BALD: `H[E_f p(y | f)] − E_f H[p(y | f)]`, the mutual information
/// between the comparison outcome and the latent utility.
pub struct BayesianActiveLearning<'a> {
    model: &'a PreferentialVariationalGp,
    base: Vec<Vec<f64>>,
}

impl<'a> BayesianActiveLearning<'a> {
    /// `base` holds standard-normal draws of length `q`.
    #[must_use]
    pub fn new(model: &'a PreferentialVariationalGp, base: Vec<Vec<f64>>) -> Self {
        Self { model, base }
    }
}

impl AcquisitionFunction for BayesianActiveLearning<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        let Some(draws) = joint_draws(self.model, items, &self.base) else {
            return f64::NAN;
        };
        let probs = outcome_probabilities(self.model.likelihood(), &draws);
        let conditional = mean_over(probs.iter().map(|p| likelihood::entropy(p)));
        likelihood::entropy(&marginal(&probs)) - conditional
    }
}

/// Entropy of the predicted outcome, `H[E_f p(y | f)]`.
pub struct MaxEntropy<'a> {
    model: &'a PreferentialVariationalGp,
    base: Vec<Vec<f64>>,
}

impl<'a> MaxEntropy<'a> {
    /// `base` holds standard-normal draws of length `q`.
    #[must_use]
    pub fn new(model: &'a PreferentialVariationalGp, base: Vec<Vec<f64>>) -> Self {
        Self { model, base }
    }
}

impl AcquisitionFunction for MaxEntropy<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        joint_draws(self.model, items, &self.base).map_or(f64::NAN, |draws| {
            likelihood::entropy(&marginal(&outcome_probabilities(
                self.model.likelihood(),
                &draws,
            )))
        })
    }
}

// ---------------------------------------------------------------------------
// Single-point
// ---------------------------------------------------------------------------

/// Posterior mean at the first item.
pub struct PosteriorMean<'a> {
    model: &'a PreferentialVariationalGp,
}

impl<'a> PosteriorMean<'a> {
    /// Wraps `model`.
    #[must_use]
    pub fn new(model: &'a PreferentialVariationalGp) -> Self {
        Self { model }
    }
}

impl AcquisitionFunction for PosteriorMean<'_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        items
            .first()
            .and_then(|x| self.model.posterior_mean(x).ok())
            .unwrap_or(f64::NAN)
    }
}

/// Value of one posterior sample path at the first item (Thompson sampling).
pub struct SamplePathValue<'p, 'a> {
    path: &'p PosteriorSamplePath<'a>,
}

impl<'p, 'a> SamplePathValue<'p, 'a> {
    /// Wraps `path`.
    #[must_use]
    pub fn new(path: &'p PosteriorSamplePath<'a>) -> Self {
        Self { path }
    }
}

impl AcquisitionFunction for SamplePathValue<'_, '_> {
    fn evaluate(&self, items: &[Vec<f64>]) -> f64 {
        items.first().map_or(f64::NAN, |x| self.path.evaluate(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelOptions;
    use crate::qmc;
    use crate::types::{Comparison, Dataset, Query};

    fn model() -> PreferentialVariationalGp {
        let mut data = Dataset::new(1, 2).unwrap();
        let q = Query::new(vec![vec![0.2], vec![0.7]]).unwrap();
        data.push(Comparison::new(q, 1).unwrap()).unwrap();
        let mut rng = fastrand::Rng::with_seed(1);
        PreferentialVariationalGp::new(&data, ModelOptions::default(), &mut rng).unwrap()
    }

    fn base(q: usize) -> Vec<Vec<f64>> {
        qmc::normal_base_samples(256, q, &mut fastrand::Rng::with_seed(2))
    }

    #[test]
    fn expected_max_exceeds_either_mean() {
        let model = model();
        let acq = ExpectedMaxValue::new(&model, base(2));
        let items = vec![vec![0.3], vec![0.9]];
        let score = acq.evaluate(&items);
        let m0 = model.posterior_mean(&items[0]).unwrap();
        let m1 = model.posterior_mean(&items[1]).unwrap();
        assert!(score > m0.max(m1), "{score} vs {m0}, {m1}");
    }

    #[test]
    fn information_scores_vanish_for_identical_items() {
        // Identical items are perfectly correlated: the outcome is always a
        // coin flip and carries no information about f.
        let model = model();
        let items = vec![vec![0.4], vec![0.4]];
        let bald = BayesianActiveLearning::new(&model, base(2)).evaluate(&items);
        let ent = MaxEntropy::new(&model, base(2)).evaluate(&items);
        assert!(bald.abs() < 1e-3, "bald {bald}");
        assert!((ent - core::f64::consts::LN_2).abs() < 1e-3, "entropy {ent}");
    }

    #[test]
    fn bald_is_non_negative_and_below_entropy() {
        let model = model();
        let items = vec![vec![0.05], vec![0.95]];
        let bald = BayesianActiveLearning::new(&model, base(2)).evaluate(&items);
        let ent = MaxEntropy::new(&model, base(2)).evaluate(&items);
        assert!(bald >= -1e-12);
        assert!(bald <= ent + 1e-12);
    }

    #[test]
    fn nei_is_non_negative() {
        let model = model();
        let baseline = vec![vec![0.7]];
        let acq = NoisyExpectedImprovement::new(&model, baseline, base(3));
        assert!(acq.evaluate(&[vec![0.1], vec![0.5]]) >= 0.0);
    }

    #[test]
    fn wrong_dimension_scores_nan() {
        let model = model();
        let acq = ExpectedPreferredValue::new(&model, base(2));
        assert!(acq.evaluate(&[vec![0.1, 0.2], vec![0.3, 0.4]]).is_nan());
        assert!(PosteriorMean::new(&model).evaluate(&[]).is_nan());
    }
}
