#![deny(missing_docs)]

//! Sequential Monte Carlo Approximate Bayesian Computation (ABC-SMC)
//! calibration engine for stochastic black-box simulators.
//!
//! The engine fits simulator parameters against an observed target
//! dataset when no tractable likelihood exists: it manages multi-step
//! particle populations, adaptive acceptance tolerances,
//! perturbation-based proposals, importance reweighting, checkpointed
//! resumability, and dispatch of simulation jobs to a local or remote
//! batch-compute backend.

/// Particles and per-step simulation bundles.
pub mod bundle;
/// Checkpoint serialization helpers and payload structure.
pub mod checkpoint;
/// YAML run configuration schema and defaults.
pub mod config;
/// Prior and perturbation-kernel distribution families.
pub mod distributions;
/// The resumable experiment state machine and `run`/`resume` entry points.
pub mod experiment;
/// Run manifest serialization helpers.
pub mod manifest;
/// Distance and summary product tables on disk.
pub mod results;
/// Prior draws and perturbation-based particle proposals.
pub mod sampler;
/// Pluggable processing and distance strategies.
pub mod strategy;
/// Tolerance scheduling, acceptance, and importance reweighting.
pub mod tolerance;

pub use bundle::{Particle, SimulationBundle};
pub use checkpoint::CheckpointPayload;
pub use config::{BackendConfig, LayoutConfig, RunConfig, ToleranceConfig};
pub use distributions::{DistributionSpec, ParameterSpec};
pub use experiment::{local_dispatcher, remote_dispatcher, Experiment, ExperimentStatus};
pub use manifest::{RunManifest, StepSummary};
pub use sampler::ParticleSampler;
pub use strategy::{PoissonNllStrategy, SimulationStrategy, SummaryRow, SummaryTable};
pub use tolerance::{next_tolerance, quantile, reweight, StopReason};
