#![deny(missing_docs)]

//! Simulation job dispatch for the calibration engine.
//!
//! One step of the SMC loop produces a batch of independent simulation
//! jobs. A [`Dispatcher`] receives the entire batch and blocks until every
//! job has reached a terminal state, so the orchestrator can score the
//! step behind a single synchronization barrier. Two variants share the
//! contract: [`local::LocalDispatcher`] runs the simulator as a blocking
//! subprocess per particle on a bounded worker pool, and
//! [`remote::RemoteDispatcher`] submits batch tasks to an object-storage
//! backed compute service and polls them to completion.

use std::path::PathBuf;

use abc_core::AbcError;
use serde::{Deserialize, Serialize};

pub mod local;
pub mod remote;

pub use local::LocalDispatcher;
pub use remote::{BatchClient, BatchStatus, JobId, RemoteDispatcher};

/// One simulation job: a materialized parameter file and the directory
/// the simulator must write its raw output into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Globally unique simulation index of the particle.
    pub simulation_index: u64,
    /// Nested parameter file materialized for this particle.
    pub params_file: PathBuf,
    /// Directory the raw simulator output lands in.
    pub output_dir: PathBuf,
}

/// Terminal state of one dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// The simulator ran to completion and wrote its output.
    Completed,
    /// The simulator exited abnormally or produced no output.
    Failed,
    /// The job was still pending when the step deadline expired.
    TimedOut,
}

impl JobStatus {
    /// Whether the job produced output worth processing.
    pub fn is_completed(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// Outcome of one job after the step barrier has been crossed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Simulation index the outcome belongs to.
    pub simulation_index: u64,
    /// Terminal status reached by the job.
    pub status: JobStatus,
    /// Location of the raw output (valid only when completed).
    pub output_dir: PathBuf,
}

/// Executes a full step of simulation jobs to terminal state.
///
/// Implementations must return one outcome per input job, preserving
/// input order, and must convert per-job failures into [`JobStatus`]
/// values rather than errors: only infrastructure faults (exhausted
/// submission retries, broken worker pool) abort the step.
pub trait Dispatcher: Send + Sync {
    /// Dispatches all jobs of one step and blocks until each is terminal.
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError>;
}
