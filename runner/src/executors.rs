pub mod local;
pub mod remote;

use crate::{
    config::WorkerConfig,
    distributed::RemoteError,
    job::{JobError, JobId, JobSpec, JobStatus},
    resources::CoreSampler,
};
use parking_lot::Mutex;
use std::{io, path::Path, process::Child, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

pub use local::LocalExecutor;
pub use remote::RemoteExecutor;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid job id {0}")]
    UnknownJob(JobId),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Failed to start output transfer: {0}")]
    Transfer(#[source] io::Error),
}

/// Executor shared between the scheduler and every handle it gave out
pub type SharedExecutor = Arc<Mutex<Executors>>;

/// All executor variants, these should be created through `Executors::load`
#[derive(Debug)]
pub enum Executors {
    Local(LocalExecutor),
    Remote(RemoteExecutor),
}

impl Executors {
    /// Create the executor described by an already validated worker slot.
    ///
    /// Remote slots connect immediately, failing to open the channel is an executor error.
    pub fn load(config: &WorkerConfig, sampler: &CoreSampler) -> Result<Self, ExecutorError> {
        match config {
            WorkerConfig::Local => Ok(Self::Local(LocalExecutor::new(sampler.clone()))),
            WorkerConfig::Remote {
                host,
                executable,
                working_dir,
                testing,
            } => Ok(Self::Remote(RemoteExecutor::connect(
                host,
                executable,
                working_dir.as_deref(),
                *testing,
            )?)),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Local(executor) => executor.host(),
            Self::Remote(executor) => executor.host(),
        }
    }

    /// the slot description that recreates this executor
    pub fn config(&self) -> WorkerConfig {
        match self {
            Self::Local(_) => WorkerConfig::Local,
            Self::Remote(executor) => executor.config(),
        }
    }

    pub fn free_cores(&mut self) -> Result<usize, ExecutorError> {
        match self {
            Self::Local(executor) => Ok(executor.free_cores()),
            Self::Remote(executor) => executor.free_cores(),
        }
    }

    /// Admission control for a job needing `n_core` cores.
    ///
    /// The sampled free cores must cover the request once the cores reserved by this executor's
    /// own running jobs are taken off. Jobs asking for no cores are always admitted.
    pub fn can_run(&mut self, n_core: usize) -> Result<bool, ExecutorError> {
        if n_core == 0 {
            return Ok(true);
        }

        let free = self.free_cores()?;
        if free < n_core {
            debug!(host = self.host(), free, n_core, "Not enough free cores");
            return Ok(false);
        }

        self.refresh_running()?;
        let reserved = self.reserved_cores();
        debug!(host = self.host(), free, reserved, n_core, "Checking admission");

        Ok(free.saturating_sub(reserved) >= n_core)
    }

    /// poll every job still believed to be running so finished ones drop out of the set
    fn refresh_running(&mut self) -> Result<(), ExecutorError> {
        for job_id in self.running_jobs() {
            self.status(job_id)?;
        }

        Ok(())
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        match self {
            Self::Local(executor) => executor.running_jobs(),
            Self::Remote(executor) => executor.running_jobs(),
        }
    }

    /// cores claimed by jobs this executor believes are still running
    pub fn reserved_cores(&self) -> usize {
        match self {
            Self::Local(executor) => executor.reserved_cores(),
            Self::Remote(executor) => executor.reserved_cores(),
        }
    }

    pub fn start(&mut self, job: JobSpec) -> Result<JobId, ExecutorError> {
        info!(host = self.host(), "Running {job}");

        match self {
            Self::Local(executor) => executor.start(job),
            Self::Remote(executor) => executor.start(job),
        }
    }

    pub fn status(&mut self, job_id: JobId) -> Result<JobStatus, ExecutorError> {
        match self {
            Self::Local(executor) => executor.status(job_id),
            Self::Remote(executor) => executor.status(job_id),
        }
    }

    pub fn clean(&mut self, job_id: JobId, force: bool) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.clean(job_id, force),
            Self::Remote(executor) => executor.clean(job_id, force),
        }
    }

    pub fn get_stdout(&mut self, job_id: JobId) -> Result<String, ExecutorError> {
        match self {
            Self::Local(executor) => executor.get_stdout(job_id),
            Self::Remote(executor) => executor.get_stdout(job_id),
        }
    }

    pub fn get_stderr(&mut self, job_id: JobId) -> Result<String, ExecutorError> {
        match self {
            Self::Local(executor) => executor.get_stderr(job_id),
            Self::Remote(executor) => executor.get_stderr(job_id),
        }
    }

    /// Start copying the job's output to `dest`.
    ///
    /// Local output is already in place so there is nothing to do, remote output is fetched by a
    /// background transfer process that the caller may wait on.
    pub fn copy_output(
        &mut self,
        job_id: JobId,
        dest: &Path,
    ) -> Result<Option<Child>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.copy_output(job_id, dest).map(|()| None),
            Self::Remote(executor) => executor.copy_output(job_id, dest).map(Some),
        }
    }
}

/// Handle for a dispatched job.
///
/// Every query is forwarded to the executor that started the job, callers never need to know
/// whether it runs locally or on a remote host.
#[derive(Clone, Debug)]
pub struct JobHandle {
    executor: SharedExecutor,
    job_id: JobId,
    job: JobSpec,
}

impl JobHandle {
    /// start `job` on `executor` and wrap the result
    pub fn dispatch(executor: &SharedExecutor, job: JobSpec) -> Result<Self, ExecutorError> {
        let job_id = executor.lock().start(job.clone())?;

        Ok(Self {
            executor: Arc::clone(executor),
            job_id,
            job,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    pub fn executor(&self) -> &SharedExecutor {
        &self.executor
    }

    pub fn host(&self) -> String {
        self.executor.lock().host().to_owned()
    }

    pub fn free_cores(&self) -> Result<usize, ExecutorError> {
        self.executor.lock().free_cores()
    }

    pub fn status(&self) -> Result<JobStatus, ExecutorError> {
        self.executor.lock().status(self.job_id)
    }

    pub fn copy_output(&self, dest: &Path) -> Result<Option<Child>, ExecutorError> {
        self.executor.lock().copy_output(self.job_id, dest)
    }

    pub fn clean(&self, force: bool) -> Result<(), ExecutorError> {
        self.executor.lock().clean(self.job_id, force)
    }

    pub fn get_stdout(&self) -> Result<String, ExecutorError> {
        self.executor.lock().get_stdout(self.job_id)
    }

    pub fn get_stderr(&self) -> Result<String, ExecutorError> {
        self.executor.lock().get_stderr(self.job_id)
    }
}
