//! Checkpoint serialization: one JSON snapshot per experiment,
//! overwritten after every scored step.
//!
//! The snapshot holds the run configuration, every frozen bundle
//! (parameter sets, distances, weights), the current step, and the
//! target dataset. Bulk per-row summaries are not checkpointed; they
//! live in the partitioned product tables keyed by simulation index.

use std::fs;
use std::path::Path;

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};

use crate::bundle::SimulationBundle;
use crate::config::RunConfig;
use crate::strategy::SummaryTable;

/// Serializable experiment snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    /// Run configuration the experiment was created with.
    pub config: RunConfig,
    /// Master seed of the run.
    pub master_seed: u64,
    /// Number of scored steps; the in-flight step on resume.
    pub current_step: usize,
    /// Frozen bundles of every scored step, in step order.
    pub bundles: Vec<SimulationBundle>,
    /// Observed target dataset.
    pub target: SummaryTable,
}

impl CheckpointPayload {
    /// Restores the payload from disk. Unreadable or unparsable
    /// checkpoints are fatal and require operator intervention.
    pub fn load(path: &Path) -> Result<Self, AbcError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AbcError::Checkpoint(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            AbcError::Checkpoint(
                ErrorInfo::new("checkpoint-parse", err.to_string())
                    .with_context("path", path.display().to_string())
                    .with_hint("the checkpoint is corrupt; the run cannot be silently restarted"),
            )
        })
    }

    /// Writes the payload to disk, overwriting any previous snapshot.
    pub fn store(&self, path: &Path) -> Result<(), AbcError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AbcError::Checkpoint(
                    ErrorInfo::new("checkpoint-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            AbcError::Checkpoint(
                ErrorInfo::new("checkpoint-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            AbcError::Checkpoint(
                ErrorInfo::new("checkpoint-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}
