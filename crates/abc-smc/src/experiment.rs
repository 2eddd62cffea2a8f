//! Experiment orchestration: the resumable SMC state machine.
//!
//! An experiment advances `Initialized -> StepRunning -> StepScored`
//! in a loop until a stop condition holds, persisting a checkpoint after
//! every scored step. Within one step all particle jobs are independent;
//! the orchestrator is single-threaded control flow with a barrier at
//! the end of the step, because step t+1's proposals need the full
//! weighted particle set of step t.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use abc_core::errors::ErrorInfo;
use abc_core::{particle_seed, AbcError, ParamValues, RngHandle};
use abc_dispatch::local::COMPLETION_MARKER;
use abc_dispatch::{
    BatchClient, Dispatcher, JobOutcome, JobSpec, JobStatus, LocalDispatcher, RemoteDispatcher,
};
use serde::{Deserialize, Serialize};

use crate::bundle::{Particle, SimulationBundle};
use crate::checkpoint::CheckpointPayload;
use crate::config::{BackendConfig, RunConfig};
use crate::distributions::ParameterSpec;
use crate::manifest::{RunManifest, StepSummary};
use crate::results;
use crate::sampler::ParticleSampler;
use crate::strategy::{SimulationStrategy, SummaryTable};
use crate::tolerance::{next_tolerance, reweight, StopReason};

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentStatus {
    /// Created fresh or restored; no step in flight.
    Initialized,
    /// A step is sampling, dispatching, or processing.
    StepRunning,
    /// The most recent step was scored and checkpointed.
    StepScored,
    /// The tolerance floor was reached; the run converged.
    Complete,
    /// The run stopped without convergence.
    Stopped(StopReason),
}

/// A calibration experiment: configuration, history, and collaborators.
pub struct Experiment {
    config: RunConfig,
    spec: ParameterSpec,
    target: SummaryTable,
    strategy: Box<dyn SimulationStrategy>,
    dispatcher: Box<dyn Dispatcher>,
    bundles: Vec<SimulationBundle>,
    current_step: usize,
    status: ExperimentStatus,
}

impl Experiment {
    /// Creates a fresh experiment. Configuration problems are fatal
    /// before any job is dispatched.
    pub fn new(
        config: RunConfig,
        target: SummaryTable,
        strategy: Box<dyn SimulationStrategy>,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Result<Self, AbcError> {
        let spec = config.validate()?;
        Ok(Self {
            config,
            spec,
            target,
            strategy,
            dispatcher,
            bundles: Vec::new(),
            current_step: 0,
            status: ExperimentStatus::Initialized,
        })
    }

    /// Restores an experiment from its checkpoint. The in-flight step's
    /// parameter sets are re-derived from the master seed, and only
    /// particles without on-disk outputs are re-dispatched. Assumes
    /// exclusive ownership of the checkpoint file.
    pub fn resume(
        checkpoint_path: &Path,
        strategy: Box<dyn SimulationStrategy>,
        dispatcher: Box<dyn Dispatcher>,
    ) -> Result<Self, AbcError> {
        let payload = CheckpointPayload::load(checkpoint_path)?;
        let spec = payload.config.validate()?;
        Ok(Self {
            config: payload.config,
            spec,
            target: payload.target,
            strategy,
            dispatcher,
            bundles: payload.bundles,
            current_step: payload.current_step,
            status: ExperimentStatus::Initialized,
        })
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Scored bundles in step order.
    pub fn bundles(&self) -> &[SimulationBundle] {
        &self.bundles
    }

    /// Index of the next step to run.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Executes one full SMC step: sample or propose parameter sets,
    /// dispatch all jobs, process and score outputs, accept against the
    /// step tolerance, reweight, freeze the bundle, write products, and
    /// overwrite the checkpoint.
    pub fn run_step(&mut self) -> Result<(), AbcError> {
        self.status = ExperimentStatus::StepRunning;
        let step = self.current_step;
        let tolerance = match self.bundles.last() {
            None => f64::INFINITY,
            Some(previous) => next_tolerance(
                previous.tolerance,
                &previous.distances(),
                self.config.tolerance.percentile,
            ),
        };

        let slot_values = self.sample_step(step)?;
        let (mut bundle, jobs) = self.build_bundle(step, tolerance, slot_values)?;
        let outcomes = self.dispatch_step(step, &jobs)?;
        let summaries = self.score_step(&mut bundle, &outcomes)?;

        let previous = self.bundles.last();
        reweight(&mut bundle, previous, &self.spec);

        // A step is non-convergent when too few particles pass, or when
        // the accepted set carries no importance mass to resample from.
        let collapsed = bundle.accepted_count() < self.config.tolerance.min_accepted
            || bundle.accepted_mass() <= 0.0;
        self.write_step_products(&bundle, &summaries)?;
        self.bundles.push(bundle);
        self.current_step += 1;
        self.store_checkpoint()?;
        self.status = if collapsed {
            ExperimentStatus::Stopped(StopReason::AcceptanceCollapsed)
        } else {
            ExperimentStatus::StepScored
        };
        Ok(())
    }

    /// Runs steps until a stop condition holds, then writes the run
    /// manifest. Non-convergence is reported explicitly through the
    /// returned [`StopReason`] and the final status.
    pub fn run(&mut self) -> Result<StopReason, AbcError> {
        let reason = loop {
            if let ExperimentStatus::Stopped(reason) = self.status {
                break reason;
            }
            if self.current_step >= self.config.tolerance.max_steps {
                break StopReason::StepBudgetExhausted;
            }
            if let Some(previous) = self.bundles.last() {
                let upcoming = next_tolerance(
                    previous.tolerance,
                    &previous.distances(),
                    self.config.tolerance.percentile,
                );
                if upcoming <= self.config.tolerance.floor {
                    break StopReason::ToleranceFloorReached;
                }
            }
            self.run_step()?;
        };
        self.status = match reason {
            StopReason::ToleranceFloorReached => ExperimentStatus::Complete,
            other => ExperimentStatus::Stopped(other),
        };
        self.write_manifest(reason)?;
        Ok(reason)
    }

    /// Merges all bundles' distances and on-disk summary products into
    /// one long-format table and writes it as `results.csv`.
    pub fn read_results(&self) -> Result<Vec<results::ResultRow>, AbcError> {
        let products_dir = self.config.products_dir();
        results::write_results(&products_dir, &self.bundles)?;
        results::read_results(&products_dir, &self.bundles)
    }

    fn sample_step(&self, step: usize) -> Result<Vec<Option<ParamValues>>, AbcError> {
        let sampler = ParticleSampler::new(&self.spec, self.config.proposal_retry_budget);
        let mut slot_values = Vec::with_capacity(self.config.particles);
        for slot in 0..self.config.particles {
            let seed = particle_seed(self.config.master_seed, step, slot);
            let mut rng = RngHandle::from_seed(seed);
            let values = match self.bundles.last() {
                None => Some(sampler.sample_prior(&mut rng)?),
                Some(previous) => sampler.propose(&mut rng, previous)?,
            };
            slot_values.push(values);
        }
        Ok(slot_values)
    }

    fn build_bundle(
        &self,
        step: usize,
        tolerance: f64,
        slot_values: Vec<Option<ParamValues>>,
    ) -> Result<(SimulationBundle, Vec<JobSpec>), AbcError> {
        let replicates = self.config.replicates;
        let stride = (self.config.particles * replicates) as u64;
        let mut particles = Vec::with_capacity(self.config.particles * replicates);
        let mut jobs = Vec::new();
        for (slot, values) in slot_values.into_iter().enumerate() {
            for replicate in 0..replicates {
                let simulation_index =
                    step as u64 * stride + (slot * replicates + replicate) as u64;
                let (row_values, failed) = match &values {
                    Some(values) => (values.clone(), false),
                    None => (ParamValues::new(), true),
                };
                if !failed {
                    let params_file = self.write_params_file(simulation_index, &row_values)?;
                    jobs.push(JobSpec {
                        simulation_index,
                        params_file,
                        output_dir: self.config.output_dir(simulation_index),
                    });
                }
                particles.push(Particle {
                    simulation_index,
                    slot,
                    values: row_values,
                    output_dir: None,
                    distance: 0.0,
                    weight: 0.0,
                    accepted: false,
                    failed,
                });
            }
        }
        let bundle = SimulationBundle {
            step,
            tolerance,
            particles,
            baseline_params: self.config.baseline_params.clone(),
        };
        Ok((bundle, jobs))
    }

    fn write_params_file(
        &self,
        simulation_index: u64,
        values: &ParamValues,
    ) -> Result<PathBuf, AbcError> {
        let tree = abc_core::params::materialize(&self.config.baseline_params, values)?;
        let path = self.config.params_file(simulation_index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AbcError::Serde(
                    ErrorInfo::new("params-mkdir", err.to_string())
                        .with_context("path", parent.display().to_string()),
                )
            })?;
        }
        let json = serde_json::to_string_pretty(&tree).map_err(|err| {
            AbcError::Serde(ErrorInfo::new("params-serialize", err.to_string()))
        })?;
        fs::write(&path, json).map_err(|err| {
            AbcError::Serde(
                ErrorInfo::new("params-write", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        Ok(path)
    }

    /// Dispatches only the jobs whose outputs are not already on disk;
    /// already-completed particles are folded back in as completed
    /// outcomes. This is what makes `resume` idempotent after a crash.
    fn dispatch_step(&self, step: usize, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut pending = Vec::new();
        for job in jobs {
            match existing_output(&job.output_dir) {
                Some(output_dir) => outcomes.push(JobOutcome {
                    simulation_index: job.simulation_index,
                    status: JobStatus::Completed,
                    output_dir,
                }),
                None => pending.push(job.clone()),
            }
        }
        if !pending.is_empty() {
            let dispatched = self
                .dispatcher
                .run_step(&pending)
                .map_err(|err| err.with_context("step", step.to_string()))?;
            for (job, outcome) in pending.iter().zip(&dispatched) {
                if outcome.status.is_completed() {
                    record_completion(job, outcome)?;
                }
            }
            outcomes.extend(dispatched);
        }
        outcomes.sort_by_key(|outcome| outcome.simulation_index);
        Ok(outcomes)
    }

    fn score_step(
        &self,
        bundle: &mut SimulationBundle,
        outcomes: &[JobOutcome],
    ) -> Result<Vec<(u64, SummaryTable)>, AbcError> {
        let step = bundle.step;
        let mut processed = Vec::new();
        let mut slot_summaries: Vec<Vec<SummaryTable>> =
            vec![Vec::new(); self.config.particles];

        for particle in &mut bundle.particles {
            if particle.failed {
                slot_summaries[particle.slot].push(SummaryTable::empty());
                continue;
            }
            let outcome = outcomes
                .binary_search_by_key(&particle.simulation_index, |o| o.simulation_index)
                .ok()
                .map(|idx| &outcomes[idx]);
            let summary = match outcome {
                Some(outcome) if outcome.status.is_completed() => {
                    particle.output_dir = Some(outcome.output_dir.clone());
                    // A processing error is a per-particle simulation
                    // failure, recovered with the sentinel empty summary.
                    self.strategy
                        .process(&outcome.output_dir)
                        .unwrap_or_else(|_| SummaryTable::empty())
                }
                _ => SummaryTable::empty(),
            };
            if summary.is_empty() {
                particle.failed = true;
            } else {
                processed.push((particle.simulation_index, summary.clone()));
            }
            slot_summaries[particle.slot].push(summary);
        }

        let mut slot_distances = Vec::with_capacity(self.config.particles);
        for (slot, summaries) in slot_summaries.iter().enumerate() {
            let aggregated = SummaryTable::mean_of(summaries);
            let distance = self
                .strategy
                .score(&aggregated, &self.target)
                .map_err(|err| {
                    AbcError::Distance(
                        ErrorInfo::new("score-failed", err.to_string())
                            .with_context("step", step.to_string())
                            .with_context("slot", slot.to_string()),
                    )
                })?;
            if !(distance >= 0.0 && distance.is_finite()) {
                return Err(AbcError::Distance(
                    ErrorInfo::new(
                        "distance-not-finite",
                        "distance strategy returned a negative or non-finite value",
                    )
                    .with_context("step", step.to_string())
                    .with_context("slot", slot.to_string()),
                ));
            }
            slot_distances.push(distance);
        }

        for particle in &mut bundle.particles {
            particle.distance = slot_distances[particle.slot];
            particle.accepted = particle.distance <= bundle.tolerance;
        }
        Ok(processed)
    }

    fn write_step_products(
        &self,
        bundle: &SimulationBundle,
        summaries: &[(u64, SummaryTable)],
    ) -> Result<(), AbcError> {
        let products_dir = self.config.products_dir();
        results::write_distances(&products_dir, bundle)?;
        results::write_summaries(&products_dir, bundle.step, summaries)
    }

    fn store_checkpoint(&self) -> Result<(), AbcError> {
        let payload = CheckpointPayload {
            config: self.config.clone(),
            master_seed: self.config.master_seed,
            current_step: self.current_step,
            bundles: self.bundles.clone(),
            target: self.target.clone(),
        };
        payload.store(&self.config.checkpoint_path())
    }

    fn write_manifest(&self, stop_reason: StopReason) -> Result<(), AbcError> {
        let steps = self
            .bundles
            .iter()
            .map(|bundle| StepSummary {
                step: bundle.step,
                tolerance: bundle.tolerance,
                accepted: bundle.accepted_count(),
                failed: bundle.particles.iter().filter(|p| p.failed).count(),
                min_distance: bundle
                    .distances()
                    .into_iter()
                    .fold(f64::INFINITY, f64::min),
            })
            .collect();
        let manifest = RunManifest {
            config: self.config.clone(),
            master_seed: self.config.master_seed,
            steps,
            stop_reason,
            checkpoint_file: self.config.checkpoint_path(),
            products_dir: self.config.products_dir(),
        };
        manifest.write(&self.config.manifest_path())
    }
}

/// Returns the output location of an already-completed job, when its
/// completion marker is on disk. The marker may name a fetched location
/// that differs from the job's own output directory (remote backends).
fn existing_output(output_dir: &Path) -> Option<PathBuf> {
    let contents = fs::read_to_string(output_dir.join(COMPLETION_MARKER)).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Some(output_dir.to_path_buf())
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn record_completion(job: &JobSpec, outcome: &JobOutcome) -> Result<(), AbcError> {
    let marker = job.output_dir.join(COMPLETION_MARKER);
    if marker.exists() {
        return Ok(());
    }
    fs::create_dir_all(&job.output_dir).map_err(|err| {
        AbcError::Backend(
            ErrorInfo::new("marker-mkdir", err.to_string())
                .with_context("path", job.output_dir.display().to_string()),
        )
    })?;
    let contents = if outcome.output_dir == job.output_dir {
        String::new()
    } else {
        outcome.output_dir.display().to_string()
    };
    fs::write(&marker, contents).map_err(|err| {
        AbcError::Backend(
            ErrorInfo::new("marker-write", err.to_string())
                .with_context("path", marker.display().to_string()),
        )
    })
}

/// Builds the local dispatcher described by the configuration, when the
/// configured backend is local.
pub fn local_dispatcher(config: &RunConfig) -> Option<LocalDispatcher> {
    match &config.backend {
        BackendConfig::Local { simulator, workers } => {
            let mut dispatcher = LocalDispatcher::new(simulator, *workers);
            if let Some(secs) = config.step_timeout_secs {
                dispatcher = dispatcher.with_step_deadline(Duration::from_secs(secs));
            }
            Some(dispatcher)
        }
        BackendConfig::Remote { .. } => None,
    }
}

/// Builds the remote dispatcher described by the configuration over the
/// supplied batch client, when the configured backend is remote.
pub fn remote_dispatcher<C: BatchClient>(
    config: &RunConfig,
    client: C,
) -> Option<RemoteDispatcher<C>> {
    match &config.backend {
        BackendConfig::Remote {
            poll_interval_ms,
            retry_budget,
            initial_backoff_ms,
        } => {
            let mut dispatcher = RemoteDispatcher::new(client)
                .with_poll_interval(Duration::from_millis(*poll_interval_ms))
                .with_retry_budget(*retry_budget)
                .with_initial_backoff(Duration::from_millis(*initial_backoff_ms));
            if let Some(secs) = config.step_timeout_secs {
                dispatcher = dispatcher.with_step_deadline(Duration::from_secs(secs));
            }
            Some(dispatcher)
        }
        BackendConfig::Local { .. } => None,
    }
}
