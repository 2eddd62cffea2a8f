//! Pluggable processing and distance strategies.
//!
//! A strategy converts raw simulator output into a summary table and
//! scores a summary against the target dataset. Both halves are fixed at
//! experiment construction. The policy for failed or misaligned
//! particles is to penalize, not exclude: an empty summary, or one whose
//! index does not overlap the target's, must score to a finite
//! worst-case distance so the particle stays in the bundle and is
//! rejected naturally once the tolerance shrinks.

use std::collections::BTreeMap;
use std::path::Path;

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Discrete, Poisson};

/// One row of a long-format summary: a time index and a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// Time (or generic join) index.
    pub t: i64,
    /// Summary value at `t`.
    pub value: f64,
}

/// Long-format summary table, sorted by `t`, comparable to the target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryTable {
    /// Rows in ascending `t` order.
    pub rows: Vec<SummaryRow>,
}

impl SummaryTable {
    /// The sentinel summary of a failed simulation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Builds a sorted table from `(t, value)` pairs, summing duplicates.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (i64, f64)>) -> Self {
        let mut grouped: BTreeMap<i64, f64> = BTreeMap::new();
        for (t, value) in pairs {
            *grouped.entry(t).or_insert(0.0) += value;
        }
        Self {
            rows: grouped
                .into_iter()
                .map(|(t, value)| SummaryRow { t, value })
                .collect(),
        }
    }

    /// Looks up the value at `t`.
    pub fn value_at(&self, t: i64) -> Option<f64> {
        self.rows
            .binary_search_by_key(&t, |row| row.t)
            .ok()
            .map(|idx| self.rows[idx].value)
    }

    /// Per-`t` mean over the non-empty tables of one particle's
    /// replicates; empty when every replicate failed.
    pub fn mean_of(tables: &[SummaryTable]) -> SummaryTable {
        let populated: Vec<_> = tables.iter().filter(|table| !table.is_empty()).collect();
        if populated.is_empty() {
            return SummaryTable::empty();
        }
        let mut sums: BTreeMap<i64, f64> = BTreeMap::new();
        for table in &populated {
            for row in &table.rows {
                *sums.entry(row.t).or_insert(0.0) += row.value;
            }
        }
        let count = populated.len() as f64;
        SummaryTable {
            rows: sums
                .into_iter()
                .map(|(t, total)| SummaryRow {
                    t,
                    value: total / count,
                })
                .collect(),
        }
    }

    /// Reads a table from a headered CSV file with `t,value` columns.
    pub fn read_csv(path: &Path) -> Result<Self, AbcError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|err| {
                AbcError::Serde(
                    ErrorInfo::new("summary-read", err.to_string())
                        .with_context("path", path.display().to_string()),
                )
            })?;
        let mut pairs = Vec::new();
        for record in reader.deserialize::<SummaryRow>() {
            let row = record.map_err(|err| {
                AbcError::Serde(
                    ErrorInfo::new("summary-parse", err.to_string())
                        .with_context("path", path.display().to_string()),
                )
            })?;
            pairs.push((row.t, row.value));
        }
        Ok(Self::from_pairs(pairs))
    }
}

/// Processing plus distance strategy injected into the experiment.
pub trait SimulationStrategy: Send + Sync {
    /// Normalizes raw simulator output into a summary table. Errors are
    /// treated as per-particle simulation failures and recovered with an
    /// empty summary, never aborting the step.
    fn process(&self, output_dir: &Path) -> Result<SummaryTable, AbcError>;

    /// Scores a summary against the target; must be non-negative and
    /// finite, including for empty or non-overlapping summaries. An
    /// error here is a contract violation and aborts the step.
    fn score(&self, summary: &SummaryTable, target: &SummaryTable) -> Result<f64, AbcError>;
}

/// Poisson negative-log-likelihood strategy over per-`t` counts.
///
/// Reads a headered `t,count` CSV from the output directory, sums counts
/// per `t`, and scores each target row with `-ln(pmf + 1e-12)` of a
/// Poisson whose mean is the target count, zero-filling time points the
/// summary is missing. Empty summaries score the fixed penalty.
#[derive(Debug, Clone)]
pub struct PoissonNllStrategy {
    output_file: String,
    penalty: f64,
}

impl PoissonNllStrategy {
    /// Creates the strategy for the given raw output filename.
    pub fn new(output_file: impl Into<String>, penalty: f64) -> Self {
        Self {
            output_file: output_file.into(),
            penalty,
        }
    }

    fn nll(&self, model: f64, target: f64) -> f64 {
        let lambda = target.max(1e-9);
        let pmf = match Poisson::new(lambda) {
            Ok(dist) => dist.pmf(model.round().max(0.0) as u64),
            Err(_) => 0.0,
        };
        -(pmf + 1e-12).ln()
    }
}

impl SimulationStrategy for PoissonNllStrategy {
    fn process(&self, output_dir: &Path) -> Result<SummaryTable, AbcError> {
        let path = output_dir.join(&self.output_file);
        if !path.exists() {
            return Err(AbcError::Simulation(
                ErrorInfo::new("output-missing", "simulator produced no output file")
                    .with_context("path", path.display().to_string()),
            ));
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(|err| {
                AbcError::Simulation(
                    ErrorInfo::new("output-unreadable", err.to_string())
                        .with_context("path", path.display().to_string()),
                )
            })?;

        #[derive(Deserialize)]
        struct CountRow {
            t: i64,
            count: f64,
        }

        let mut pairs = Vec::new();
        for record in reader.deserialize::<CountRow>() {
            let row = record.map_err(|err| {
                AbcError::Simulation(
                    ErrorInfo::new("output-malformed", err.to_string())
                        .with_context("path", path.display().to_string()),
                )
            })?;
            pairs.push((row.t, row.count));
        }
        Ok(SummaryTable::from_pairs(pairs))
    }

    fn score(&self, summary: &SummaryTable, target: &SummaryTable) -> Result<f64, AbcError> {
        if summary.is_empty() {
            return Ok(self.penalty);
        }
        let mut total = 0.0;
        for row in &target.rows {
            let model = summary.value_at(row.t).unwrap_or(0.0);
            total += self.nll(model, row.value);
        }
        Ok(total)
    }
}
