//! Blocking subprocess dispatch on a bounded local worker pool.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use rayon::prelude::*;

use crate::{Dispatcher, JobOutcome, JobSpec, JobStatus};

/// Marker file written into an output directory once its job completed.
/// Resume scans for it to avoid re-running finished particles.
pub const COMPLETION_MARKER: &str = ".completed";

/// Runs the simulator as one blocking subprocess per particle.
///
/// The simulator is invoked with the fixed argument shape
/// `<simulator> --config <params_file> --output <output_dir>`; its
/// output-file schema is opaque here. Parallelism is bounded by a
/// dedicated worker pool of `workers` threads. A non-zero exit or a
/// spawn failure yields a [`JobStatus::Failed`] outcome; the step itself
/// never fails because of one particle.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    simulator: PathBuf,
    workers: usize,
    step_deadline: Option<Duration>,
}

impl LocalDispatcher {
    /// Creates a dispatcher for the given simulator executable.
    pub fn new(simulator: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            simulator: simulator.into(),
            workers: workers.max(1),
            step_deadline: None,
        }
    }

    /// Sets the wall-clock deadline for one step. Jobs still running
    /// when the deadline passes are killed and reported as timed out.
    pub fn with_step_deadline(mut self, deadline: Duration) -> Self {
        self.step_deadline = Some(deadline);
        self
    }

    fn run_job(&self, job: &JobSpec, started: Instant) -> JobOutcome {
        if marker_path(&job.output_dir).exists() {
            return JobOutcome {
                simulation_index: job.simulation_index,
                status: JobStatus::Completed,
                output_dir: job.output_dir.clone(),
            };
        }
        let status = match self.invoke(job, started) {
            Ok(JobStatus::Completed) => {
                if std::fs::write(marker_path(&job.output_dir), b"").is_err() {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                }
            }
            Ok(status) => status,
            Err(_) => JobStatus::Failed,
        };
        JobOutcome {
            simulation_index: job.simulation_index,
            status,
            output_dir: job.output_dir.clone(),
        }
    }

    /// Runs the subprocess, enforcing whatever remains of the step
    /// deadline: the child is polled and killed once the deadline
    /// passes, so a hung simulator cannot stall the step barrier.
    fn invoke(&self, job: &JobSpec, started: Instant) -> std::io::Result<JobStatus> {
        let remaining = match self.step_deadline {
            None => None,
            Some(deadline) => match deadline.checked_sub(started.elapsed()) {
                Some(left) => Some(left),
                None => return Ok(JobStatus::TimedOut),
            },
        };
        std::fs::create_dir_all(&job.output_dir)?;
        let mut child = Command::new(&self.simulator)
            .arg("--config")
            .arg(&job.params_file)
            .arg("--output")
            .arg(&job.output_dir)
            .spawn()?;
        let exit = match remaining {
            None => child.wait()?,
            Some(left) => {
                let expires = Instant::now() + left;
                loop {
                    if let Some(exit) = child.try_wait()? {
                        break exit;
                    }
                    if Instant::now() >= expires {
                        child.kill().ok();
                        child.wait().ok();
                        return Ok(JobStatus::TimedOut);
                    }
                    std::thread::sleep(WAIT_POLL);
                }
            }
        };
        Ok(if exit.success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        })
    }
}

const WAIT_POLL: Duration = Duration::from_millis(25);

fn marker_path(output_dir: &Path) -> PathBuf {
    output_dir.join(COMPLETION_MARKER)
}

impl Dispatcher for LocalDispatcher {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|err| {
                AbcError::Backend(
                    ErrorInfo::new("worker-pool-build", err.to_string())
                        .with_context("workers", self.workers.to_string()),
                )
            })?;
        let started = Instant::now();
        let outcomes = pool.install(|| {
            jobs.par_iter()
                .map(|job| self.run_job(job, started))
                .collect()
        });
        Ok(outcomes)
    }
}
