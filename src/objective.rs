//! The [`Objective`] trait: the hidden utility a simulated oracle consults.
//!
//! The optimizer never sees objective values; they only decide (before
//! noise) which item of a query wins, and they score the best-point
//! estimate in the optimization trace.
//!
//! Closures over `&[f64]` implement [`Objective`] directly:
//!
//! ```
//! use prefopt::objective::Objective;
//!
//! let f = |x: &[f64]| -(x[0] - 0.25).powi(2);
//! assert!(f.evaluate(&[0.25]) > f.evaluate(&[0.9]));
//! ```

/// A utility over the normalized box `[0, 1]^d` (larger is better).
pub trait Objective {
    /// Utility at `x`.
    fn evaluate(&self, x: &[f64]) -> f64;
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> f64,
{
    fn evaluate(&self, x: &[f64]) -> f64 {
        self(x)
    }
}

/// Negated Rosenbrock function with inputs rescaled from `[0, 1]` to `[-2, 2]`.
///
/// ```text
/// f(x) = −Σ_{i<d−1} [100 (X_{i+1} − X_i²)² + (1 − X_i)²],   X = 4x − 2
/// ```
///
/// The maximum `0` is attained at `X = (1, …, 1)`, i.e. `x = (0.75, …, 0.75)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rosenbrock {
    dim: usize,
}

impl Rosenbrock {
    /// Rosenbrock in `dim` dimensions.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Input dimension.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Location of the maximum in the normalized box.
    #[must_use]
    pub fn optimizer(&self) -> Vec<f64> {
        vec![0.75; self.dim]
    }
}

impl Objective for Rosenbrock {
    fn evaluate(&self, x: &[f64]) -> f64 {
        let xs: Vec<f64> = x.iter().map(|v| 4.0 * v - 2.0).collect();
        -xs.windows(2)
            .map(|w| 100.0 * (w[1] - w[0] * w[0]).powi(2) + (1.0 - w[0]).powi(2))
            .sum::<f64>()
    }
}
