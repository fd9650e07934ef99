use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Comparison;

/// One persisted iteration of a replicate.
///
/// Iteration 0 holds every initial random comparison; each later iteration
/// holds exactly one model-guided comparison. Every record carries the
/// best-point estimate of the model fitted after its comparisons were
/// added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Replicate index.
    pub trial: usize,
    /// Iteration number, contiguous from 0 within a replicate.
    pub iteration: usize,
    /// Comparisons added to the dataset in this iteration.
    pub comparisons: Vec<Comparison>,
    /// Maximizer of the posterior mean, if one was found.
    #[serde(default)]
    pub best_point: Option<Vec<f64>>,
    /// Noise-free utility at `best_point`, when the oracle knows it.
    #[serde(default)]
    pub best_value: Option<f64>,
    /// Largest noise-free utility among all items queried up to and
    /// including this iteration, when the oracle knows utilities.
    #[serde(default)]
    pub max_value_within_queries: Option<f64>,
    /// Wall-clock time spent on the iteration.
    #[serde(default)]
    pub elapsed_secs: f64,
    /// Set when acquisition optimization failed and the query was drawn at
    /// random instead.
    #[serde(default)]
    pub degraded: bool,
}

/// The best-point estimate after one iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Iteration number.
    pub iteration: usize,
    /// Estimated best point.
    pub best_point: Option<Vec<f64>>,
    /// Its noise-free utility, if known.
    pub best_value: Option<f64>,
    /// Best noise-free utility among the items queried so far, if known.
    pub max_value_within_queries: Option<f64>,
}

/// The sequence of best-point estimates of one replicate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationTrace {
    /// Replicate index.
    pub trial: usize,
    /// One entry per recorded iteration, in order.
    pub entries: Vec<TraceEntry>,
}

impl OptimizationTrace {
    /// Collect the estimates of `records` belonging to `trial`.
    #[must_use]
    pub fn from_records(trial: usize, records: &[TrialRecord]) -> Self {
        let entries = records
            .iter()
            .filter(|r| r.trial == trial)
            .map(|r| TraceEntry {
                iteration: r.iteration,
                best_point: r.best_point.clone(),
                best_value: r.best_value,
                max_value_within_queries: r.max_value_within_queries,
            })
            .collect();
        Self { trial, entries }
    }

    /// The last entry that carries a best-point estimate.
    #[must_use]
    pub fn final_estimate(&self) -> Option<&TraceEntry> {
        self.entries.iter().rev().find(|e| e.best_point.is_some())
    }

    /// Write the trace as CSV.
    ///
    /// Columns: `iteration`, `best_value`, `max_value_within_queries`, then
    /// `x0 .. x{d-1}`. Missing values are written as empty cells.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if writing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use prefopt::{OptimizationTrace, experiment::TraceEntry};
    ///
    /// let trace = OptimizationTrace {
    ///     trial: 1,
    ///     entries: vec![TraceEntry {
    ///         iteration: 1,
    ///         best_point: Some(vec![0.25, 0.5]),
    ///         best_value: Some(-1.5),
    ///         max_value_within_queries: Some(-0.5),
    ///     }],
    /// };
    /// let mut buf = Vec::new();
    /// trace.to_csv(&mut buf).unwrap();
    /// let csv = String::from_utf8(buf).unwrap();
    /// assert_eq!(
    ///     csv,
    ///     "iteration,best_value,max_value_within_queries,x0,x1\n1,-1.5,-0.5,0.25,0.5\n"
    /// );
    /// ```
    pub fn to_csv(&self, mut writer: impl Write) -> std::io::Result<()> {
        let dim = self
            .entries
            .iter()
            .find_map(|e| e.best_point.as_ref().map(Vec::len))
            .unwrap_or(0);

        write!(writer, "iteration,best_value,max_value_within_queries")?;
        for i in 0..dim {
            write!(writer, ",x{i}")?;
        }
        writeln!(writer)?;

        for entry in &self.entries {
            write!(writer, "{}", entry.iteration)?;
            for value in [entry.best_value, entry.max_value_within_queries] {
                match value {
                    Some(v) => write!(writer, ",{v}")?,
                    None => write!(writer, ",")?,
                }
            }
            match &entry.best_point {
                Some(x) => {
                    for v in x {
                        write!(writer, ",{v}")?;
                    }
                }
                None => {
                    for _ in 0..dim {
                        write!(writer, ",")?;
                    }
                }
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Write the trace to a CSV file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or written.
    pub fn export_csv(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.to_csv(std::io::BufWriter::new(file))
    }
}
