use finitediff::FiniteDiff;

use super::{AcquisitionFunction, AcquisitionOptions};
use crate::error::{Error, Result};
use crate::rng_util;

const INITIAL_STEP: f64 = 0.1;
const MIN_STEP: f64 = 1e-6;
const MIN_GRAD_NORM: f64 = 1e-12;

/// Maximize `acq` over queries of `q` points in `[0, 1]^d`.
///
/// 1. Score `raw_samples` uniform candidates.
/// 2. Keep the `num_restarts` best finite scores as starting points, in
///    descending score order (stable, so earlier candidates win ties).
/// 3. From each start, run projected gradient ascent on the flattened
///    `q·d` vector: finite-difference gradient, normalized direction,
///    step halving until the score improves, at most `max_local_iter`
///    steps. Every iterate is clamped into the box.
/// 4. Return the best result; a later restart replaces the incumbent only
///    with a strictly larger score.
///
/// # Errors
///
/// Returns [`Error::AcquisitionOptimization`] if no candidate has a finite
/// score.
pub fn optimize_acquisition<A: AcquisitionFunction + ?Sized>(
    acq: &A,
    q: usize,
    d: usize,
    options: &AcquisitionOptions,
    rng: &mut fastrand::Rng,
) -> Result<Vec<Vec<f64>>> {
    let score = |flat: &[f64]| -> f64 {
        let items = unflatten(&clamp_to_box(flat.to_vec()), d);
        acq.evaluate(&items)
    };

    let mut raw: Vec<(Vec<f64>, f64)> = Vec::with_capacity(options.raw_samples);
    for _ in 0..options.raw_samples {
        let flat = rng_util::unit_point(rng, q * d);
        let s = score(&flat);
        if s.is_finite() {
            raw.push((flat, s));
        }
    }
    if raw.is_empty() {
        trace_debug!(q, d, "no finite acquisition value among raw candidates");
        return Err(Error::AcquisitionOptimization);
    }
    raw.sort_by(|a, b| b.1.total_cmp(&a.1));
    raw.truncate(options.num_restarts.max(1));

    let mut best: Option<(Vec<f64>, f64)> = None;
    for (start, start_score) in raw {
        let (x, s) = local_ascent(&score, start, start_score, options.max_local_iter);
        if best.as_ref().is_none_or(|(_, b)| s > *b) {
            best = Some((x, s));
        }
    }

    let (x, _) = best.ok_or(Error::AcquisitionOptimization)?;
    Ok(unflatten(&clamp_to_box(x), d))
}

/// Projected gradient ascent with backtracking. Never returns a point
/// scoring below `fx`.
fn local_ascent<F: Fn(&[f64]) -> f64>(
    score: &F,
    mut x: Vec<f64>,
    mut fx: f64,
    max_iter: usize,
) -> (Vec<f64>, f64) {
    let mut step = INITIAL_STEP;
    for _ in 0..max_iter {
        let grad = x.central_diff(&|v: &Vec<f64>| score(v));
        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !norm.is_finite() || norm < MIN_GRAD_NORM {
            break;
        }

        let mut improved = false;
        while step >= MIN_STEP {
            let candidate = clamp_to_box(
                x.iter()
                    .zip(&grad)
                    .map(|(xi, gi)| xi + step * gi / norm)
                    .collect(),
            );
            let fc = score(&candidate);
            if fc.is_finite() && fc > fx {
                x = candidate;
                fx = fc;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            break;
        }
        step = (step * 2.0).min(INITIAL_STEP);
    }
    (x, fx)
}

fn clamp_to_box(mut x: Vec<f64>) -> Vec<f64> {
    for v in &mut x {
        *v = if v.is_nan() { 0.5 } else { v.clamp(0.0, 1.0) };
    }
    x
}

fn unflatten(flat: &[f64], d: usize) -> Vec<Vec<f64>> {
    flat.chunks(d.max(1)).map(<[f64]>::to_vec).collect()
}
