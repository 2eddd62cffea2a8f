//! YAML run configuration and experiment directory layout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::distributions::{DistributionSpec, ParameterSpec};

/// Immutable configuration of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root directory of the experiment's on-disk artefacts.
    pub experiment_dir: PathBuf,
    /// Number of particles per step.
    pub particles: usize,
    /// Simulator replicates per particle, aggregated before scoring.
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Master seed; every particle derives its own substream from it.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Prior distribution per dotted leaf path.
    pub priors: BTreeMap<String, DistributionSpec>,
    /// Perturbation kernel per dotted leaf path (additive noise).
    pub kernels: BTreeMap<String, DistributionSpec>,
    /// The simulator's default nested parameter tree.
    pub baseline_params: Value,
    /// Tolerance schedule and stopping thresholds.
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    /// Distance assigned to failed particles. The default is the upper
    /// precision bound for a negative log likelihood of zero.
    #[serde(default = "default_penalty_distance")]
    pub penalty_distance: f64,
    /// Retries allowed per leaf when a perturbed draw leaves the prior's
    /// support before the particle is marked failed.
    #[serde(default = "default_proposal_retry_budget")]
    pub proposal_retry_budget: usize,
    /// Wall-clock deadline per step; pending jobs become failures.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    /// Which backend executes simulation jobs.
    pub backend: BackendConfig,
    /// Directory layout under `experiment_dir`.
    #[serde(default)]
    pub layout: LayoutConfig,
}

fn default_replicates() -> usize {
    1
}

fn default_master_seed() -> u64 {
    0x0ABC_5EED_0ABC_5EED_u64
}

fn default_penalty_distance() -> f64 {
    750.0
}

fn default_proposal_retry_budget() -> usize {
    100
}

/// Tolerance schedule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceConfig {
    /// Percentile of the distance distribution used as the next
    /// tolerance, in `(0, 1]`.
    #[serde(default = "default_percentile")]
    pub percentile: f64,
    /// Stop once the tolerance reaches this floor.
    #[serde(default)]
    pub floor: f64,
    /// Maximum number of SMC steps.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// A step accepting fewer particles than this is non-convergent.
    #[serde(default = "default_min_accepted")]
    pub min_accepted: usize,
}

fn default_percentile() -> f64 {
    0.5
}

fn default_max_steps() -> usize {
    10
}

fn default_min_accepted() -> usize {
    2
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            floor: 0.0,
            max_steps: default_max_steps(),
            min_accepted: default_min_accepted(),
        }
    }
}

/// Backend selection, fixed by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// Blocking subprocesses on a bounded local worker pool.
    Local {
        /// Simulator executable path.
        simulator: PathBuf,
        /// Worker pool size.
        #[serde(default = "default_workers")]
        workers: usize,
    },
    /// Remote batch-compute service.
    Remote {
        /// Milliseconds between polling rounds.
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        /// Transient submit/poll failures retried before aborting.
        #[serde(default = "default_retry_budget")]
        retry_budget: usize,
        /// Backoff before the first retry, doubling per attempt.
        #[serde(default = "default_initial_backoff_ms")]
        initial_backoff_ms: u64,
    },
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_retry_budget() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

/// Experiment directory layout, relative to `experiment_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Directory of materialized per-particle parameter files.
    #[serde(default = "default_params_dir")]
    pub params_dir: PathBuf,
    /// Directory of raw per-particle simulator outputs.
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
    /// Directory of distance and summary product tables.
    #[serde(default = "default_products_dir")]
    pub products_dir: PathBuf,
    /// Checkpoint filename, overwritten after every scored step.
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    /// Run manifest filename.
    #[serde(default = "default_manifest_file")]
    pub manifest_file: PathBuf,
}

fn default_params_dir() -> PathBuf {
    PathBuf::from("parameters")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_products_dir() -> PathBuf {
    PathBuf::from("products")
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("checkpoint.json")
}

fn default_manifest_file() -> PathBuf {
    PathBuf::from("manifest.json")
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            params_dir: default_params_dir(),
            outputs_dir: default_outputs_dir(),
            products_dir: default_products_dir(),
            checkpoint_file: default_checkpoint_file(),
            manifest_file: default_manifest_file(),
        }
    }
}

impl RunConfig {
    /// Loads a configuration from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, AbcError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AbcError::Config(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_yaml::from_str(&contents).map_err(|err| {
            AbcError::Config(
                ErrorInfo::new("config-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Validates the configuration and builds the parameter spec.
    /// Fatal before any job is dispatched.
    pub fn validate(&self) -> Result<ParameterSpec, AbcError> {
        if self.particles == 0 {
            return Err(AbcError::Config(ErrorInfo::new(
                "particles-zero",
                "at least one particle per step is required",
            )));
        }
        if self.replicates == 0 {
            return Err(AbcError::Config(ErrorInfo::new(
                "replicates-zero",
                "at least one replicate per particle is required",
            )));
        }
        if !(self.tolerance.percentile > 0.0 && self.tolerance.percentile <= 1.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("percentile-out-of-range", "percentile must lie in (0, 1]")
                    .with_context("percentile", self.tolerance.percentile.to_string()),
            ));
        }
        if !(self.penalty_distance.is_finite() && self.penalty_distance > 0.0) {
            return Err(AbcError::Config(ErrorInfo::new(
                "penalty-not-finite",
                "penalty distance must be finite and positive",
            )));
        }
        ParameterSpec::new(&self.priors, &self.kernels, &self.baseline_params)
    }

    /// Absolute path of the per-particle parameter file.
    pub fn params_file(&self, simulation_index: u64) -> PathBuf {
        self.experiment_dir
            .join(&self.layout.params_dir)
            .join(format!("sim_{simulation_index:06}.json"))
    }

    /// Absolute path of the per-particle raw output directory.
    pub fn output_dir(&self, simulation_index: u64) -> PathBuf {
        self.experiment_dir
            .join(&self.layout.outputs_dir)
            .join(format!("sim_{simulation_index:06}"))
    }

    /// Absolute path of the products directory.
    pub fn products_dir(&self) -> PathBuf {
        self.experiment_dir.join(&self.layout.products_dir)
    }

    /// Absolute path of the checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.experiment_dir.join(&self.layout.checkpoint_file)
    }

    /// Absolute path of the run manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.experiment_dir.join(&self.layout.manifest_file)
    }
}
