//! Remote batch-compute dispatch: submit a whole step, then poll.
//!
//! The remote collaborator is an object-storage plus batch-compute
//! service reduced to three operations. Submission latency is decoupled
//! from completion latency: all jobs of a step are submitted first, then
//! polled together until every one is terminal or the step deadline
//! expires.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};

use crate::{Dispatcher, JobOutcome, JobSpec, JobStatus};

/// Opaque identifier assigned by the batch service to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

/// Status reported by the batch service for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Queued, not yet scheduled.
    Pending,
    /// Scheduled and executing.
    Running,
    /// Finished and output is available.
    Succeeded,
    /// Finished abnormally.
    Failed,
}

impl BatchStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Succeeded | BatchStatus::Failed)
    }
}

/// Minimal client contract for the batch-compute collaborator.
///
/// `submit` uploads the job inputs and enqueues a task keyed by the
/// job's simulation index; `poll` and `fetch_output` may fail
/// transiently and are retried by the dispatcher.
pub trait BatchClient: Send + Sync {
    /// Uploads inputs and submits one task, returning its identifier.
    fn submit(&self, job: &JobSpec) -> Result<JobId, AbcError>;
    /// Reports the current status of a submitted task.
    fn poll(&self, id: &JobId) -> Result<BatchStatus, AbcError>;
    /// Returns the local location of a succeeded task's output.
    fn fetch_output(&self, id: &JobId) -> Result<PathBuf, AbcError>;
}

/// Dispatches a step to a remote batch service with bounded retries.
pub struct RemoteDispatcher<C: BatchClient> {
    client: C,
    poll_interval: Duration,
    retry_budget: usize,
    initial_backoff: Duration,
    step_deadline: Option<Duration>,
}

impl<C: BatchClient> RemoteDispatcher<C> {
    /// Creates a dispatcher over the given client with default pacing
    /// (5s poll interval, 3 retries, 500ms initial backoff).
    pub fn new(client: C) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(5),
            retry_budget: 3,
            initial_backoff: Duration::from_millis(500),
            step_deadline: None,
        }
    }

    /// Sets the interval between polling rounds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how many times a transient submit/poll failure is retried.
    pub fn with_retry_budget(mut self, budget: usize) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the backoff before the first retry (doubles per attempt).
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the wall-clock deadline for one step. Jobs still pending at
    /// the deadline are reported as timed out, not failed.
    pub fn with_step_deadline(mut self, deadline: Duration) -> Self {
        self.step_deadline = Some(deadline);
        self
    }

    fn with_retries<T>(
        &self,
        mut op: impl FnMut() -> Result<T, AbcError>,
        code: &str,
    ) -> Result<T, AbcError> {
        let mut backoff = self.initial_backoff;
        let mut last = None;
        for attempt in 0..=self.retry_budget {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last = Some(err);
                    if attempt < self.retry_budget {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        let last = last.unwrap_or_else(|| {
            AbcError::Backend(ErrorInfo::new(code, "retry budget exhausted"))
        });
        Err(AbcError::Backend(
            ErrorInfo::new(code, "retry budget exhausted")
                .with_context("attempts", (self.retry_budget + 1).to_string())
                .with_hint(last.to_string()),
        ))
    }
}

impl<C: BatchClient> Dispatcher for RemoteDispatcher<C> {
    fn run_step(&self, jobs: &[JobSpec]) -> Result<Vec<JobOutcome>, AbcError> {
        let started = Instant::now();

        // Submit the entire step before any polling.
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = self.with_retries(|| self.client.submit(job), "batch-submit")?;
            ids.push(id);
        }

        let mut terminal: BTreeMap<usize, BatchStatus> = BTreeMap::new();
        loop {
            for (slot, id) in ids.iter().enumerate() {
                if terminal.contains_key(&slot) {
                    continue;
                }
                let status = self.with_retries(|| self.client.poll(id), "batch-poll")?;
                if status.is_terminal() {
                    terminal.insert(slot, status);
                }
            }
            if terminal.len() == jobs.len() {
                break;
            }
            if let Some(deadline) = self.step_deadline {
                if started.elapsed() >= deadline {
                    break;
                }
            }
            std::thread::sleep(self.poll_interval);
        }

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (slot, (job, id)) in jobs.iter().zip(&ids).enumerate() {
            let outcome = match terminal.get(&slot) {
                Some(BatchStatus::Succeeded) => {
                    let output_dir =
                        self.with_retries(|| self.client.fetch_output(id), "batch-fetch")?;
                    JobOutcome {
                        simulation_index: job.simulation_index,
                        status: JobStatus::Completed,
                        output_dir,
                    }
                }
                Some(_) => JobOutcome {
                    simulation_index: job.simulation_index,
                    status: JobStatus::Failed,
                    output_dir: job.output_dir.clone(),
                },
                None => JobOutcome {
                    simulation_index: job.simulation_index,
                    status: JobStatus::TimedOut,
                    output_dir: job.output_dir.clone(),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedClient {
        /// Remaining poll responses per job, popped front to back.
        polls: Mutex<BTreeMap<String, Vec<BatchStatus>>>,
        /// submit() failures to inject before accepting.
        submit_faults: Mutex<usize>,
        output_root: PathBuf,
    }

    impl ScriptedClient {
        fn new(output_root: PathBuf) -> Self {
            Self {
                polls: Mutex::new(BTreeMap::new()),
                submit_faults: Mutex::new(0),
                output_root,
            }
        }

        fn script(&self, index: u64, statuses: Vec<BatchStatus>) {
            self.polls
                .lock()
                .unwrap()
                .insert(format!("task-{index}"), statuses);
        }
    }

    impl BatchClient for &ScriptedClient {
        fn submit(&self, job: &JobSpec) -> Result<JobId, AbcError> {
            let mut faults = self.submit_faults.lock().unwrap();
            if *faults > 0 {
                *faults -= 1;
                return Err(AbcError::Backend(ErrorInfo::new(
                    "transient",
                    "submission throttled",
                )));
            }
            Ok(JobId(format!("task-{}", job.simulation_index)))
        }

        fn poll(&self, id: &JobId) -> Result<BatchStatus, AbcError> {
            let mut polls = self.polls.lock().unwrap();
            let queue = polls.get_mut(&id.0).expect("unknown job id");
            if queue.len() > 1 {
                Ok(queue.remove(0))
            } else {
                Ok(queue[0])
            }
        }

        fn fetch_output(&self, id: &JobId) -> Result<PathBuf, AbcError> {
            Ok(self.output_root.join(&id.0))
        }
    }

    fn job(index: u64) -> JobSpec {
        JobSpec {
            simulation_index: index,
            params_file: PathBuf::from(format!("params_{index}.json")),
            output_dir: PathBuf::from(format!("sim_{index}")),
        }
    }

    fn fast_dispatcher(client: &ScriptedClient) -> RemoteDispatcher<&ScriptedClient> {
        RemoteDispatcher::new(client)
            .with_poll_interval(Duration::from_millis(1))
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn step_waits_for_all_jobs_then_reports_statuses() {
        let client = ScriptedClient::new(PathBuf::from("/fetched"));
        client.script(0, vec![BatchStatus::Pending, BatchStatus::Succeeded]);
        client.script(1, vec![BatchStatus::Running, BatchStatus::Failed]);
        let outcomes = fast_dispatcher(&client)
            .run_step(&[job(0), job(1)])
            .unwrap();
        assert_eq!(outcomes[0].status, JobStatus::Completed);
        assert_eq!(outcomes[0].output_dir, PathBuf::from("/fetched/task-0"));
        assert_eq!(outcomes[1].status, JobStatus::Failed);
    }

    #[test]
    fn transient_submit_failures_are_retried() {
        let client = ScriptedClient::new(PathBuf::from("/fetched"));
        *client.submit_faults.lock().unwrap() = 2;
        client.script(0, vec![BatchStatus::Succeeded]);
        let outcomes = fast_dispatcher(&client)
            .with_retry_budget(3)
            .run_step(&[job(0)])
            .unwrap();
        assert_eq!(outcomes[0].status, JobStatus::Completed);
    }

    #[test]
    fn exhausted_retry_budget_is_fatal() {
        let client = ScriptedClient::new(PathBuf::from("/fetched"));
        *client.submit_faults.lock().unwrap() = 10;
        let err = fast_dispatcher(&client)
            .with_retry_budget(2)
            .run_step(&[job(0)])
            .unwrap_err();
        assert_eq!(err.info().code, "batch-submit");
    }

    #[test]
    fn deadline_converts_pending_jobs_to_timeouts() {
        let client = ScriptedClient::new(PathBuf::from("/fetched"));
        client.script(0, vec![BatchStatus::Succeeded]);
        client.script(1, vec![BatchStatus::Pending]);
        let outcomes = fast_dispatcher(&client)
            .with_step_deadline(Duration::from_millis(5))
            .run_step(&[job(0), job(1)])
            .unwrap();
        assert_eq!(outcomes[0].status, JobStatus::Completed);
        assert_eq!(outcomes[1].status, JobStatus::TimedOut);
    }
}
