use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use abc_dispatch::local::COMPLETION_MARKER;
use abc_dispatch::{Dispatcher, JobOutcome, JobSpec, JobStatus};
use abc_smc::{
    BackendConfig, CheckpointPayload, DistributionSpec, Experiment, RunConfig,
    SimulationStrategy, SummaryTable, ToleranceConfig,
};

struct AbsStrategy;

impl SimulationStrategy for AbsStrategy {
    fn process(&self, output_dir: &Path) -> Result<SummaryTable, AbcError> {
        SummaryTable::read_csv(&output_dir.join("value.csv"))
    }

    fn score(&self, summary: &SummaryTable, target: &SummaryTable) -> Result<f64, AbcError> {
        if summary.is_empty() {
            return Ok(750.0);
        }
        let model = summary.value_at(0).unwrap_or(0.0);
        let truth = target.value_at(0).unwrap_or(0.0);
        Ok((model - truth).abs())
    }
}

fn write_echo_output(job: &JobSpec) -> JobOutcome {
    std::fs::create_dir_all(&job.output_dir).unwrap();
    let tree: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&job.params_file).unwrap()).unwrap();
    let x = tree["x"].as_f64().unwrap();
    std::fs::write(job.output_dir.join("value.csv"), format!("t,value\n0,{x}\n")).unwrap();
    std::fs::write(job.output_dir.join(COMPLETION_MARKER), "").unwrap();
    JobOutcome {
        simulation_index: job.simulation_index,
        status: JobStatus::Completed,
        output_dir: job.output_dir.clone(),
    }
}

struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        Ok(jobs.iter().map(write_echo_output).collect())
    }
}

/// Completes the first `complete` jobs (outputs and markers land on
/// disk) and then dies with an infrastructure fault, as a crashed
/// worker pool would.
struct FlakyDispatcher {
    complete: usize,
}

impl Dispatcher for FlakyDispatcher {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        for job in jobs.iter().take(self.complete) {
            write_echo_output(job);
        }
        Err(AbcError::Backend(ErrorInfo::new(
            "pool-lost",
            "worker pool crashed mid-step",
        )))
    }
}

/// Echoes like [`EchoDispatcher`] and records how many jobs it was
/// actually handed.
struct CountingDispatcher {
    seen: Arc<AtomicUsize>,
}

impl Dispatcher for CountingDispatcher {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        self.seen.fetch_add(jobs.len(), Ordering::SeqCst);
        Ok(jobs.iter().map(write_echo_output).collect())
    }
}

fn config(dir: &Path, particles: usize, max_steps: usize) -> RunConfig {
    let mut priors = BTreeMap::new();
    priors.insert(
        "x".to_string(),
        DistributionSpec::Uniform { low: 0.0, high: 1.0 },
    );
    let mut kernels = BTreeMap::new();
    kernels.insert(
        "x".to_string(),
        DistributionSpec::Normal {
            mean: 0.0,
            std_dev: 0.05,
        },
    );
    RunConfig {
        experiment_dir: dir.to_path_buf(),
        particles,
        replicates: 1,
        master_seed: 424242,
        priors,
        kernels,
        baseline_params: serde_json::json!({"x": 0.5}),
        tolerance: ToleranceConfig {
            percentile: 0.5,
            floor: 0.0,
            max_steps,
            min_accepted: 2,
        },
        penalty_distance: 750.0,
        proposal_retry_budget: 100,
        step_timeout_secs: None,
        backend: BackendConfig::Local {
            simulator: "/unused".into(),
            workers: 1,
        },
        layout: Default::default(),
    }
}

fn target() -> SummaryTable {
    SummaryTable::from_pairs([(0, 0.8)])
}

#[test]
fn checkpoint_roundtrip_restores_the_full_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::new(
        config(dir.path(), 10, 2),
        target(),
        Box::new(AbsStrategy),
        Box::new(EchoDispatcher),
    )
    .unwrap();
    experiment.run_step().unwrap();
    experiment.run_step().unwrap();

    let payload = CheckpointPayload::load(&experiment.config().checkpoint_path()).unwrap();
    assert_eq!(payload.current_step, 2);
    assert_eq!(payload.master_seed, 424242);
    assert_eq!(payload.bundles, experiment.bundles());
    assert_eq!(payload.target, target());
    assert!(payload.bundles[0].tolerance.is_infinite());

    let restored = Experiment::resume(
        &experiment.config().checkpoint_path(),
        Box::new(AbsStrategy),
        Box::new(EchoDispatcher),
    )
    .unwrap();
    assert_eq!(restored.current_step(), 2);
    assert_eq!(restored.bundles(), experiment.bundles());
    assert_eq!(restored.config(), experiment.config());
}

#[test]
fn resume_redispatches_only_the_missing_jobs_and_matches_a_clean_run() {
    let particles = 8;
    let completed_before_crash = 4;

    // Reference: the same seed, never interrupted.
    let clean_dir = tempfile::tempdir().unwrap();
    let mut clean = Experiment::new(
        config(clean_dir.path(), particles, 2),
        target(),
        Box::new(AbsStrategy),
        Box::new(EchoDispatcher),
    )
    .unwrap();
    clean.run_step().unwrap();
    clean.run_step().unwrap();

    // Interrupted run: step 0 succeeds, step 1 crashes mid-dispatch.
    let dir = tempfile::tempdir().unwrap();
    let mut interrupted = Experiment::new(
        config(dir.path(), particles, 2),
        target(),
        Box::new(AbsStrategy),
        Box::new(EchoDispatcher),
    )
    .unwrap();
    interrupted.run_step().unwrap();
    let checkpoint_path = interrupted.config().checkpoint_path();

    let mut crashing = Experiment::resume(
        &checkpoint_path,
        Box::new(AbsStrategy),
        Box::new(FlakyDispatcher {
            complete: completed_before_crash,
        }),
    )
    .unwrap();
    let err = crashing.run_step().unwrap_err();
    // The dispatcher's own code survives, with the step attached.
    assert_eq!(err.info().code, "pool-lost");
    assert_eq!(err.info().context.get("step").map(String::as_str), Some("1"));

    // The checkpoint still points at the in-flight step.
    let payload = CheckpointPayload::load(&checkpoint_path).unwrap();
    assert_eq!(payload.current_step, 1);

    // Resume with a healthy dispatcher: only the jobs without on-disk
    // outputs are handed to it.
    let seen = Arc::new(AtomicUsize::new(0));
    let mut resumed = Experiment::resume(
        &checkpoint_path,
        Box::new(AbsStrategy),
        Box::new(CountingDispatcher { seen: seen.clone() }),
    )
    .unwrap();
    resumed.run_step().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), particles - completed_before_crash);

    // The resumed step is indistinguishable from the uninterrupted one.
    let resumed_bundle = &resumed.bundles()[1];
    let clean_bundle = &clean.bundles()[1];
    assert_eq!(resumed_bundle.tolerance, clean_bundle.tolerance);
    for (ours, theirs) in resumed_bundle.particles.iter().zip(&clean_bundle.particles) {
        assert_eq!(ours.simulation_index, theirs.simulation_index);
        assert_eq!(ours.values, theirs.values);
        assert_eq!(ours.distance, theirs.distance);
        assert_eq!(ours.weight, theirs.weight);
        assert_eq!(ours.accepted, theirs.accepted);
    }

    // Tolerances never increase across the run.
    assert!(resumed.bundles()[1].tolerance <= resumed.bundles()[0].tolerance);
}
