//! Core data types: queries, comparisons, and the append-only dataset.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An ordered group of `q ≥ 2` items from `[0, 1]^d` shown to the oracle
/// as one comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct Query {
    items: Vec<Vec<f64>>,
}

impl Query {
    /// Create a query, validating item count, shape, and box membership.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBatchSize`] if fewer than two items are given.
    /// - [`Error::InvalidDimension`] if items have zero coordinates.
    /// - [`Error::DimensionMismatch`] if items disagree on their dimension.
    /// - [`Error::PointOutOfBounds`] if a coordinate is outside `[0, 1]`.
    pub fn new(items: Vec<Vec<f64>>) -> Result<Self> {
        if items.len() < 2 {
            return Err(Error::InvalidBatchSize(items.len()));
        }
        let dim = items[0].len();
        if dim == 0 {
            return Err(Error::InvalidDimension(0));
        }
        for item in &items {
            if item.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    got: item.len(),
                });
            }
            check_unit_box(item)?;
        }
        Ok(Self { items })
    }

    /// The items of the query, in presentation order.
    #[must_use]
    pub fn items(&self) -> &[Vec<f64>] {
        &self.items
    }

    /// Number of items `q`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always `false`: a valid query holds at least two items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dimension `d` of each item.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.items[0].len()
    }
}

impl TryFrom<Vec<Vec<f64>>> for Query {
    type Error = Error;

    fn try_from(items: Vec<Vec<f64>>) -> Result<Self> {
        Self::new(items)
    }
}

impl From<Query> for Vec<Vec<f64>> {
    fn from(query: Query) -> Self {
        query.items
    }
}

/// Check that every coordinate is finite and inside `[0, 1]`.
pub(crate) fn check_unit_box(point: &[f64]) -> Result<()> {
    for (index, &value) in point.iter().enumerate() {
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::PointOutOfBounds { index, value });
        }
    }
    Ok(())
}

/// A query together with the oracle's answer (index of the winning item).
///
/// Immutable once recorded. Deserialization goes through
/// [`Comparison::new`], so a stored winner index is always in range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawComparison")]
pub struct Comparison {
    /// The items that were compared.
    pub query: Query,
    /// Index of the preferred item within `query`.
    pub winner: usize,
}

impl Comparison {
    /// Create a comparison, checking the winner index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oracle`] if `winner` is not an index into `query`.
    pub fn new(query: Query, winner: usize) -> Result<Self> {
        if winner >= query.len() {
            return Err(Error::Oracle(format!(
                "winner index {winner} out of range for a query of {} items",
                query.len()
            )));
        }
        Ok(Self { query, winner })
    }
}

#[derive(Deserialize)]
struct RawComparison {
    query: Query,
    winner: usize,
}

impl TryFrom<RawComparison> for Comparison {
    type Error = Error;

    fn try_from(raw: RawComparison) -> Result<Self> {
        Self::new(raw.query, raw.winner)
    }
}

/// The ordered, append-only sequence of comparisons a model is trained on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataset")]
pub struct Dataset {
    input_dim: usize,
    batch_size: usize,
    comparisons: Vec<Comparison>,
}

impl Dataset {
    /// Create an empty dataset for queries of `batch_size` items in
    /// `[0, 1]^input_dim`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDimension`] or [`Error::InvalidBatchSize`]
    /// for a zero dimension or fewer than two items per query.
    pub fn new(input_dim: usize, batch_size: usize) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidDimension(input_dim));
        }
        if batch_size < 2 {
            return Err(Error::InvalidBatchSize(batch_size));
        }
        Ok(Self {
            input_dim,
            batch_size,
            comparisons: Vec::new(),
        })
    }

    /// Append a comparison.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the query shape differs from
    /// the dataset's `(batch_size, input_dim)`.
    pub fn push(&mut self, comparison: Comparison) -> Result<()> {
        if comparison.query.len() != self.batch_size {
            return Err(Error::DimensionMismatch {
                expected: self.batch_size,
                got: comparison.query.len(),
            });
        }
        if comparison.query.dim() != self.input_dim {
            return Err(Error::DimensionMismatch {
                expected: self.input_dim,
                got: comparison.query.dim(),
            });
        }
        self.comparisons.push(comparison);
        Ok(())
    }

    /// Append several comparisons in order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first shape error; earlier comparisons stay
    /// appended.
    pub fn extend(&mut self, comparisons: impl IntoIterator<Item = Comparison>) -> Result<()> {
        for c in comparisons {
            self.push(c)?;
        }
        Ok(())
    }

    /// Input dimension `d`.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Items per query `q`.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of comparisons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.comparisons.len()
    }

    /// Whether no comparison has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comparisons.is_empty()
    }

    /// All comparisons in recording order.
    #[must_use]
    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    /// Every queried item, flattened query by query (`len() · q` points).
    #[must_use]
    pub fn flattened_points(&self) -> Vec<Vec<f64>> {
        self.comparisons
            .iter()
            .flat_map(|c| c.query.items().iter().cloned())
            .collect()
    }
}

#[derive(Deserialize)]
struct RawDataset {
    input_dim: usize,
    batch_size: usize,
    comparisons: Vec<Comparison>,
}

impl TryFrom<RawDataset> for Dataset {
    type Error = Error;

    fn try_from(raw: RawDataset) -> Result<Self> {
        let mut dataset = Self::new(raw.input_dim, raw.batch_size)?;
        dataset.extend(raw.comparisons)?;
        Ok(dataset)
    }
}
