//! Run manifest: the structured record a completed run leaves behind.

use std::fs;
use std::path::{Path, PathBuf};

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::tolerance::StopReason;

/// Per-step summary recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Step index.
    pub step: usize,
    /// Tolerance applied at the step.
    #[serde(with = "crate::bundle::tolerance_serde")]
    pub tolerance: f64,
    /// Accepted particle count.
    pub accepted: usize,
    /// Failed particle count (simulation failures and timeouts).
    pub failed: usize,
    /// Smallest distance observed in the step.
    pub min_distance: f64,
}

/// Structured manifest describing a completed or stopped run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Configuration used for the run.
    pub config: RunConfig,
    /// Master seed of the run.
    pub master_seed: u64,
    /// One summary per scored step.
    pub steps: Vec<StepSummary>,
    /// Why the run stopped.
    pub stop_reason: StopReason,
    /// Checkpoint file of the final state.
    pub checkpoint_file: PathBuf,
    /// Directory holding distance and summary product tables.
    pub products_dir: PathBuf,
}

impl RunManifest {
    /// Writes the manifest to a JSON file.
    pub fn write(&self, path: &Path) -> Result<(), AbcError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AbcError::Serde(
                    ErrorInfo::new("manifest-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("manifest-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        fs::write(path, json).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("manifest-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Loads a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, AbcError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("manifest-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("manifest-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }
}
