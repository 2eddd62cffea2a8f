//! Product tables on disk: per-step distances and summaries, plus the
//! merged long-format results table.
//!
//! Products are partitioned by step and joinable on `simulation_index`,
//! so partial runs leave inspectable artefacts behind and `resume` can
//! reuse them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::bundle::SimulationBundle;
use crate::strategy::SummaryTable;

/// One row of the per-step distances table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceRow {
    /// Simulation index of the particle.
    pub simulation_index: u64,
    /// Step the particle belongs to.
    pub step: usize,
    /// Particle slot within the step.
    pub slot: usize,
    /// Distance to the target.
    pub distance: f64,
    /// Normalized importance weight.
    pub weight: f64,
    /// Whether the particle passed the step tolerance.
    pub accepted: bool,
    /// Whether the simulation failed.
    pub failed: bool,
}

/// One row of the per-step summaries table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryProductRow {
    /// Simulation index the summary row belongs to.
    pub simulation_index: u64,
    /// Time (join) index.
    pub t: i64,
    /// Summary value at `t`.
    pub value: f64,
}

/// One row of the merged long-format results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Simulation index of the particle.
    pub simulation_index: u64,
    /// Step the particle belongs to.
    pub step: usize,
    /// Distance to the target.
    pub distance: f64,
    /// Normalized importance weight.
    pub weight: f64,
    /// Whether the particle passed the step tolerance.
    pub accepted: bool,
    /// Time (join) index of the summary row.
    pub t: i64,
    /// Summary value at `t`.
    pub value: f64,
}

/// Path of one step's distances table.
pub fn distances_path(products_dir: &Path, step: usize) -> PathBuf {
    products_dir.join(format!("distances_step_{step:03}.csv"))
}

/// Path of one step's summaries table.
pub fn summaries_path(products_dir: &Path, step: usize) -> PathBuf {
    products_dir.join(format!("summaries_step_{step:03}.csv"))
}

fn csv_error(code: &str, path: &Path, err: impl ToString) -> AbcError {
    AbcError::Serde(
        ErrorInfo::new(code, err.to_string()).with_context("path", path.display().to_string()),
    )
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), AbcError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| csv_error("products-mkdir", parent, err))?;
    }
    let mut writer = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|err| csv_error("products-open", path, err))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| csv_error("products-write", path, err))?;
    }
    writer
        .flush()
        .map_err(|err| csv_error("products-flush", path, err))
}

/// Writes the distances table of one scored bundle.
pub fn write_distances(products_dir: &Path, bundle: &SimulationBundle) -> Result<(), AbcError> {
    let rows: Vec<DistanceRow> = bundle
        .particles
        .iter()
        .map(|p| DistanceRow {
            simulation_index: p.simulation_index,
            step: bundle.step,
            slot: p.slot,
            distance: p.distance,
            weight: p.weight,
            accepted: p.accepted,
            failed: p.failed,
        })
        .collect();
    write_rows(&distances_path(products_dir, bundle.step), &rows)
}

/// Writes the summaries table of one scored step.
pub fn write_summaries(
    products_dir: &Path,
    step: usize,
    summaries: &[(u64, SummaryTable)],
) -> Result<(), AbcError> {
    let mut rows = Vec::new();
    for (simulation_index, summary) in summaries {
        for row in &summary.rows {
            rows.push(SummaryProductRow {
                simulation_index: *simulation_index,
                t: row.t,
                value: row.value,
            });
        }
    }
    write_rows(&summaries_path(products_dir, step), &rows)
}

fn read_step_summaries(
    products_dir: &Path,
    step: usize,
) -> Result<BTreeMap<u64, Vec<(i64, f64)>>, AbcError> {
    let path = summaries_path(products_dir, step);
    let mut grouped: BTreeMap<u64, Vec<(i64, f64)>> = BTreeMap::new();
    if !path.exists() {
        return Ok(grouped);
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(&path)
        .map_err(|err| csv_error("products-read", &path, err))?;
    for record in reader.deserialize::<SummaryProductRow>() {
        let row = record.map_err(|err| csv_error("products-parse", &path, err))?;
        grouped
            .entry(row.simulation_index)
            .or_default()
            .push((row.t, row.value));
    }
    Ok(grouped)
}

/// Merges all bundles' distances with the on-disk summary products into
/// one long-format table joined on `simulation_index`.
pub fn read_results(
    products_dir: &Path,
    bundles: &[SimulationBundle],
) -> Result<Vec<ResultRow>, AbcError> {
    let mut merged = Vec::new();
    for bundle in bundles {
        let summaries = read_step_summaries(products_dir, bundle.step)?;
        for particle in &bundle.particles {
            for (t, value) in summaries
                .get(&particle.simulation_index)
                .map(Vec::as_slice)
                .unwrap_or(&[])
            {
                merged.push(ResultRow {
                    simulation_index: particle.simulation_index,
                    step: bundle.step,
                    distance: particle.distance,
                    weight: particle.weight,
                    accepted: particle.accepted,
                    t: *t,
                    value: *value,
                });
            }
        }
    }
    Ok(merged)
}

/// Writes the merged results table to `results.csv` under the products
/// directory, returning its path.
pub fn write_results(
    products_dir: &Path,
    bundles: &[SimulationBundle],
) -> Result<PathBuf, AbcError> {
    let rows = read_results(products_dir, bundles)?;
    let path = products_dir.join("results.csv");
    write_rows(&path, &rows)?;
    Ok(path)
}
