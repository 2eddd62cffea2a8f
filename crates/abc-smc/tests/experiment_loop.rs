use std::collections::BTreeMap;
use std::path::Path;

use abc_core::{AbcError, ParamPath};
use abc_dispatch::local::COMPLETION_MARKER;
use abc_dispatch::{Dispatcher, JobOutcome, JobSpec, JobStatus};
use abc_smc::{
    BackendConfig, DistributionSpec, Experiment, RunConfig, SimulationStrategy, StopReason,
    SummaryTable, ToleranceConfig,
};

/// Simulator stand-in that echoes the sampled leaf `x` into its output.
struct IdentityDispatcher;

impl Dispatcher for IdentityDispatcher {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        jobs.iter()
            .map(|job| {
                std::fs::create_dir_all(&job.output_dir).unwrap();
                let tree: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(&job.params_file).unwrap())
                        .unwrap();
                let x = tree["x"].as_f64().unwrap();
                std::fs::write(job.output_dir.join("value.csv"), format!("t,value\n0,{x}\n"))
                    .unwrap();
                std::fs::write(job.output_dir.join(COMPLETION_MARKER), "").unwrap();
                Ok(JobOutcome {
                    simulation_index: job.simulation_index,
                    status: JobStatus::Completed,
                    output_dir: job.output_dir.clone(),
                })
            })
            .collect()
    }
}

/// Scores the absolute difference of the single summary value at t=0.
struct AbsStrategy {
    penalty: f64,
}

impl SimulationStrategy for AbsStrategy {
    fn process(&self, output_dir: &Path) -> Result<SummaryTable, AbcError> {
        SummaryTable::read_csv(&output_dir.join("value.csv"))
    }

    fn score(&self, summary: &SummaryTable, target: &SummaryTable) -> Result<f64, AbcError> {
        if summary.is_empty() {
            return Ok(self.penalty);
        }
        let model = summary.value_at(0).unwrap_or(0.0);
        let truth = target.value_at(0).unwrap_or(0.0);
        Ok((model - truth).abs())
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
        master_seed: 20240817,
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

fn target(value: f64) -> SummaryTable {
    SummaryTable::from_pairs([(0, value)])
}

#[test]
fn posterior_contracts_toward_the_generating_value() {
    let dir = tempfile::tempdir().unwrap();
    let truth = 0.8;
    let mut experiment = Experiment::new(
        config(dir.path(), 100, 3),
        target(truth),
        Box::new(AbsStrategy { penalty: 750.0 }),
        Box::new(IdentityDispatcher),
    )
    .unwrap();

    let reason = experiment.run().unwrap();
    assert_eq!(reason, StopReason::StepBudgetExhausted);
    let bundles = experiment.bundles();
    assert_eq!(bundles.len(), 3);

    // Tolerance is non-increasing and strictly below the step-0 infinity.
    assert!(bundles[0].tolerance.is_infinite());
    assert!(bundles[1].tolerance.is_finite());
    assert!(bundles[2].tolerance < bundles[1].tolerance);

    // Accepted weights sum to one at every step.
    for bundle in bundles {
        let sum: f64 = bundle.accepted().map(|p| p.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9, "step {} weights {}", bundle.step, sum);
        assert!(bundle.particles.iter().all(|p| p.weight >= 0.0));
    }

    // The weighted posterior mean moves from the prior mean toward truth.
    let path = ParamPath::parse("x").unwrap();
    let posterior_mean = bundles[2].weighted_mean(&path).unwrap();
    assert!(
        (posterior_mean - truth).abs() < (0.5f64 - truth).abs(),
        "posterior mean {posterior_mean} is no closer to {truth} than the prior mean"
    );
}

#[test]
fn exact_simulator_yields_zero_distances_and_full_acceptance() {
    let dir = tempfile::tempdir().unwrap();

    /// Ignores the parameters and reproduces the target exactly.
    struct ExactDispatcher {
        truth: f64,
    }
    impl Dispatcher for ExactDispatcher {
        fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
            jobs.iter()
                .map(|job| {
                    std::fs::create_dir_all(&job.output_dir).unwrap();
                    std::fs::write(
                        job.output_dir.join("value.csv"),
                        format!("t,value\n0,{}\n", self.truth),
                    )
                    .unwrap();
                    std::fs::write(job.output_dir.join(COMPLETION_MARKER), "").unwrap();
                    Ok(JobOutcome {
                        simulation_index: job.simulation_index,
                        status: JobStatus::Completed,
                        output_dir: job.output_dir.clone(),
                    })
                })
                .collect()
        }
    }

    let mut experiment = Experiment::new(
        config(dir.path(), 20, 1),
        target(0.8),
        Box::new(AbsStrategy { penalty: 750.0 }),
        Box::new(ExactDispatcher { truth: 0.8 }),
    )
    .unwrap();
    experiment.run_step().unwrap();

    let bundle = experiment.bundles().last().unwrap();
    assert!(bundle.particles.iter().all(|p| p.distance == 0.0));
    assert_eq!(bundle.accepted_count(), bundle.particles.len());
}

#[test]
fn read_results_joins_distances_and_summaries_per_simulation_index() {
    let dir = tempfile::tempdir().unwrap();
    let mut experiment = Experiment::new(
        config(dir.path(), 10, 2),
        target(0.8),
        Box::new(AbsStrategy { penalty: 750.0 }),
        Box::new(IdentityDispatcher),
    )
    .unwrap();
    experiment.run_step().unwrap();
    experiment.run_step().unwrap();

    let rows = experiment.read_results().unwrap();
    // One summary row per particle per step (the echo writes one t).
    assert_eq!(rows.len(), 20);
    let mut indices: Vec<u64> = rows.iter().map(|r| r.simulation_index).collect();
    indices.dedup();
    assert_eq!(indices.len(), 20);
    assert!(rows.iter().all(|r| r.distance >= 0.0));
    assert!(dir.path().join("products").join("results.csv").exists());
}
