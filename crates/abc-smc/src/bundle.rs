//! Particles and per-step simulation bundles.

use std::path::PathBuf;

use abc_core::ParamValues;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One scored simulation: a sampled parameter set together with its
/// outcome for a single replicate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Globally unique, strictly increasing simulation index.
    pub simulation_index: u64,
    /// Particle slot within the step; replicate rows share a slot and a
    /// parameter set, and receive the slot's aggregated distance.
    pub slot: usize,
    /// Flattened leaf values of the sampled parameter set.
    pub values: ParamValues,
    /// Raw-output directory, when the job produced one.
    pub output_dir: Option<PathBuf>,
    /// Distance of the slot's aggregated summary to the target (>= 0;
    /// the configured penalty on failure).
    pub distance: f64,
    /// Importance weight (>= 0; accepted weights sum to 1 per step).
    pub weight: f64,
    /// Whether the distance passed the step tolerance.
    pub accepted: bool,
    /// Whether the simulation failed or proposal retries were exhausted.
    pub failed: bool,
}

/// JSON has no representation for infinity, so the step-0 tolerance is
/// stored as `null` and restored as `f64::INFINITY`.
pub(crate) mod tolerance_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// The full particle population of one SMC step, frozen once scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationBundle {
    /// Step index, starting at zero.
    pub step: usize,
    /// Acceptance tolerance applied at this step (infinite at step 0).
    #[serde(with = "tolerance_serde")]
    pub tolerance: f64,
    /// Particles in simulation-index order, `particles x replicates` rows.
    pub particles: Vec<Particle>,
    /// Snapshot of the baseline parameter tree the step ran against.
    pub baseline_params: Value,
}

impl SimulationBundle {
    /// Iterates the accepted particles.
    pub fn accepted(&self) -> impl Iterator<Item = &Particle> {
        self.particles.iter().filter(|p| p.accepted)
    }

    /// Number of accepted particles.
    pub fn accepted_count(&self) -> usize {
        self.accepted().count()
    }

    /// Distances of all particles in index order.
    pub fn distances(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.distance).collect()
    }

    /// Normalizes accepted-particle weights to sum to one; rejected
    /// particles get weight zero. A zero-mass accepted set keeps its
    /// zero weights so the caller can detect the collapse instead of
    /// resampling from particles no kernel or prior supports.
    pub fn normalize_weights(&mut self) {
        let total: f64 = self.accepted().map(|p| p.weight).sum();
        for particle in &mut self.particles {
            if !particle.accepted {
                particle.weight = 0.0;
            } else if total > 0.0 {
                particle.weight /= total;
            }
        }
    }

    /// Total importance weight of the accepted particles.
    pub fn accepted_mass(&self) -> f64 {
        self.accepted().map(|p| p.weight).sum()
    }

    /// Weighted mean of one leaf over the accepted particles.
    pub fn weighted_mean(&self, path: &abc_core::ParamPath) -> Option<f64> {
        let mut total_weight = 0.0;
        let mut total = 0.0;
        for particle in self.accepted() {
            let value = particle.values.get(path)?;
            total += particle.weight * value;
            total_weight += particle.weight;
        }
        (total_weight > 0.0).then(|| total / total_weight)
    }
}
