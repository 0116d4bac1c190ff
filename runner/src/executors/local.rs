use super::ExecutorError;
use crate::{
    job::{Environment, Job, JobId, JobSpec, JobStatus},
    resources::CoreSampler,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};
use tracing::{debug, instrument};

/// Executor that starts jobs as child processes of this host
#[derive(Debug)]
pub struct LocalExecutor {
    jobs: BTreeMap<JobId, Job>,
    running: BTreeSet<JobId>,
    job_count: JobId,
    ambient: Environment,
    sampler: CoreSampler,
}

impl LocalExecutor {
    /// create a new LocalExecutor, capturing the current environment for jobs without their own
    pub fn new(sampler: CoreSampler) -> Self {
        Self {
            jobs: BTreeMap::new(),
            running: BTreeSet::new(),
            job_count: 0,
            ambient: Environment::ambient(),
            sampler,
        }
    }

    pub fn with_environment(mut self, ambient: Environment) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn host(&self) -> &str {
        "localhost"
    }

    pub fn free_cores(&self) -> usize {
        self.sampler.free_cores()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.running.iter().copied().collect()
    }

    pub fn reserved_cores(&self) -> usize {
        self.running
            .iter()
            .filter_map(|job_id| self.jobs.get(job_id))
            .map(|job| job.spec().n_core)
            .sum()
    }

    pub fn job(&self, job_id: JobId) -> Result<&Job, ExecutorError> {
        self.jobs
            .get(&job_id)
            .ok_or(ExecutorError::UnknownJob(job_id))
    }

    #[instrument(skip(self, spec), fields(command = %spec), level = "debug")]
    pub fn start(&mut self, spec: JobSpec) -> Result<JobId, ExecutorError> {
        let mut job = Job::new(spec, &self.ambient);
        job.run()?;

        let job_id = self.job_count;
        self.job_count += 1;
        self.jobs.insert(job_id, job);
        self.running.insert(job_id);
        debug!(job_id, "Job registered");

        Ok(job_id)
    }

    pub fn status(&mut self, job_id: JobId) -> Result<JobStatus, ExecutorError> {
        let status = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ExecutorError::UnknownJob(job_id))?
            .status()?;

        if status != JobStatus::Running && self.running.remove(&job_id) {
            debug!(job_id, %status, "Job left the running set");
        }

        Ok(status)
    }

    pub fn clean(&mut self, job_id: JobId, force: bool) -> Result<(), ExecutorError> {
        Ok(self.job(job_id)?.clean(force)?)
    }

    pub fn get_stdout(&self, job_id: JobId) -> Result<String, ExecutorError> {
        Ok(self.job(job_id)?.get_stdout()?)
    }

    pub fn get_stderr(&self, job_id: JobId) -> Result<String, ExecutorError> {
        Ok(self.job(job_id)?.get_stderr()?)
    }

    /// output is already where it belongs, only the id is checked
    pub fn copy_output(&self, job_id: JobId, _dest: &Path) -> Result<(), ExecutorError> {
        self.job(job_id).map(|_| ())
    }
}
