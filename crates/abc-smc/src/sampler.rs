//! Particle sampling: prior draws and perturbation-based proposals.

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, ParamValues, RngHandle};
use rand::Rng;

use crate::bundle::SimulationBundle;
use crate::distributions::ParameterSpec;

/// Draws parameter sets for new particles.
pub struct ParticleSampler<'a> {
    spec: &'a ParameterSpec,
    retry_budget: usize,
}

impl<'a> ParticleSampler<'a> {
    /// Creates a sampler over the run's parameter spec.
    pub fn new(spec: &'a ParameterSpec, retry_budget: usize) -> Self {
        Self { spec, retry_budget }
    }

    /// Step 0: draws each leaf independently from its prior.
    pub fn sample_prior(&self, rng: &mut RngHandle) -> Result<ParamValues, AbcError> {
        let mut values = ParamValues::new();
        for (path, prior) in self.spec.priors() {
            values.insert(path.clone(), prior.sample(rng)?);
        }
        Ok(values)
    }

    /// Step t>0: resamples a parent proportional to the previous step's
    /// weights and perturbs each leaf with its kernel. Draws outside the
    /// prior's support are retried up to the budget; exhaustion returns
    /// `None` and the particle is marked failed by the caller.
    pub fn propose(
        &self,
        rng: &mut RngHandle,
        previous: &SimulationBundle,
    ) -> Result<Option<ParamValues>, AbcError> {
        let parent = self.resample_parent(rng, previous)?;
        let mut values = ParamValues::new();
        for (path, prior) in self.spec.priors() {
            let kernel = self.spec.kernel(path).ok_or_else(|| {
                AbcError::Config(
                    ErrorInfo::new("kernel-without-prior", "kernel missing for leaf")
                        .with_context("path", path.as_str()),
                )
            })?;
            let center = *parent.get(path).ok_or_else(|| {
                AbcError::Config(
                    ErrorInfo::new("parent-missing-leaf", "parent particle lacks a leaf value")
                        .with_context("path", path.as_str()),
                )
            })?;
            let mut accepted = None;
            for _ in 0..=self.retry_budget {
                let candidate = center + kernel.sample(rng)?;
                if prior.supports(candidate) {
                    accepted = Some(candidate);
                    break;
                }
            }
            match accepted {
                Some(candidate) => {
                    values.insert(path.clone(), candidate);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    fn resample_parent<'b>(
        &self,
        rng: &mut RngHandle,
        previous: &'b SimulationBundle,
    ) -> Result<&'b ParamValues, AbcError> {
        let accepted: Vec<_> = previous.accepted().collect();
        let total: f64 = accepted.iter().map(|p| p.weight).sum();
        if accepted.is_empty() || total <= 0.0 {
            return Err(AbcError::Config(
                ErrorInfo::new(
                    "no-resampling-mass",
                    "previous step has no accepted particles with positive weight",
                )
                .with_context("step", previous.step.to_string()),
            ));
        }
        let mut draw = rng.gen::<f64>() * total;
        for particle in &accepted {
            draw -= particle.weight;
            if draw <= 0.0 {
                return Ok(&particle.values);
            }
        }
        Ok(&accepted[accepted.len() - 1].values)
    }
}
