//! Single-job queue worker.
//!
//! A worker polls the queue in bounded waits, runs at most one job, and
//! exits. Between empty polls it checks whether it should retire: either the
//! shared worker version moved (a new build was rolled out) or its jittered
//! lifetime ran out. An external supervisor respawns it.

use rand::Rng;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::queue::{Job, JobQueue};

pub const BASE_LIFETIME: Duration = Duration::from_secs(3600);
pub const MAX_JITTER_SECS: u64 = 600;
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum WorkerExit {
    JobProcessed { command: String, success: bool },
    InvalidJob { error: String },
    VersionChanged { from: Option<i64>, to: Option<i64> },
    LifetimeExpired,
}

/// Version and deadline captured when the worker starts.
#[derive(Debug, Clone)]
pub struct RetirementToken {
    version: Option<i64>,
    deadline: Instant,
}

impl RetirementToken {
    pub fn new(version: Option<i64>, lifetime: Duration) -> Self {
        Self {
            version,
            deadline: Instant::now() + lifetime,
        }
    }

    /// Base lifetime plus up to ten minutes, so a fleet does not restart in
    /// lockstep.
    pub fn jittered(version: Option<i64>) -> Self {
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_SECS);
        Self::new(version, BASE_LIFETIME + Duration::from_secs(jitter))
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn version_changed(&self, current: Option<i64>) -> bool {
        current != self.version
    }
}

/// Runs a decoded job. Implemented by the CLI layer.
pub trait JobDispatcher {
    fn dispatch(&mut self, job: &Job) -> Result<()>;
}

pub struct Worker<Q: JobQueue> {
    queue: Q,
}

impl<Q: JobQueue> Worker<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    /// Capture the current version and a jittered deadline.
    pub fn start(&mut self) -> Result<RetirementToken> {
        let version = self.queue.version()?;
        Ok(RetirementToken::jittered(version))
    }

    /// Poll until one job has run or the token says to retire.
    ///
    /// Dispatch errors are logged and reported in the exit; queue errors are
    /// returned.
    pub fn run(
        &mut self,
        token: &RetirementToken,
        dispatcher: &mut dyn JobDispatcher,
    ) -> Result<WorkerExit> {
        while !token.expired() {
            let Some(payload) = self.queue.pop(POLL_TIMEOUT)? else {
                let current = self.queue.version()?;
                if token.version_changed(current) {
                    log_line("New version detected, reloading.");
                    return Ok(WorkerExit::VersionChanged {
                        from: token.version(),
                        to: current,
                    });
                }
                continue;
            };

            let job = match Job::decode(&payload) {
                Ok(job) => job,
                Err(e) => {
                    log_line(&format!("Error: {}", e.describe()));
                    return Ok(WorkerExit::InvalidJob {
                        error: e.describe(),
                    });
                }
            };

            log_line(&format!("New job started: {}", job.summary()));
            let success = match dispatcher.dispatch(&job) {
                Ok(()) => {
                    log_line("Job successfully executed.");
                    true
                }
                Err(e) => {
                    log_line(&format!("Error: {}", e.describe()));
                    false
                }
            };

            return Ok(WorkerExit::JobProcessed {
                command: job.command,
                success,
            });
        }

        Ok(WorkerExit::LifetimeExpired)
    }
}

fn log_line(message: &str) {
    log_status!("worker", "[{}] {}", chrono::Local::now().to_rfc3339(), message);
}
