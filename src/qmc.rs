//! Quasi-Monte-Carlo point sets: scrambled Sobol points in the unit box and
//! Sobol-based standard-normal base samples.

use sobol_burley::{NUM_DIMENSIONS, sample};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::rng_util;

/// Keeps inverse-CDF arguments away from 0 and 1.
const PROBABILITY_CLAMP: f64 = 1e-10;

/// `n` scrambled Sobol points in `[0, 1)^dim`.
///
/// Dimensions beyond what the Sobol tables cover are filled with uniform
/// random coordinates from `rng`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn sobol_points(
    n: usize,
    dim: usize,
    seed: u32,
    rng: &mut fastrand::Rng,
) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| {
            (0..dim)
                .map(|j| {
                    if j < NUM_DIMENSIONS as usize {
                        f64::from(sample(i as u32, j as u32, seed))
                    } else {
                        rng.f64()
                    }
                })
                .collect()
        })
        .collect()
}

/// `n` base samples of `dim` independent standard normals.
///
/// Uses the inverse normal CDF of scrambled Sobol points when the Sobol
/// tables cover `dim`, and pseudo-random normals otherwise. The scramble
/// seed is drawn from `rng` so the result is a pure function of its state.
pub(crate) fn normal_base_samples(n: usize, dim: usize, rng: &mut fastrand::Rng) -> Vec<Vec<f64>> {
    let seed = rng.u32(..);
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return pseudo_random_normals(n, dim, rng);
    };
    if dim > NUM_DIMENSIONS as usize {
        return pseudo_random_normals(n, dim, rng);
    }
    sobol_points(n, dim, seed, rng)
        .into_iter()
        .map(|p| {
            p.into_iter()
                .map(|u| normal.inverse_cdf(u.clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP)))
                .collect()
        })
        .collect()
}

/// `n` vectors of `dim` pseudo-random standard normals.
pub(crate) fn pseudo_random_normals(n: usize, dim: usize, rng: &mut fastrand::Rng) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng_util::standard_normal(rng)).collect())
        .collect()
}
