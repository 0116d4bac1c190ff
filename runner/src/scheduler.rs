use crate::{
    config::{absolute_root, ConfigErrors, PoolConfig, WorkerConfig},
    executors::{ExecutorError, Executors, JobHandle, SharedExecutor},
    job::JobSpec,
    resources::CoreSampler,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("No worker slots are configured")]
    NoWorkers,
    #[error("No worker could admit the job after {attempts} attempts")]
    NoCapacity { attempts: usize },
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// How the next worker is picked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// some slots have no executor yet, idle executors are reused and new ones created otherwise
    Filling,
    /// every slot has its executor, idle ones first then round robin
    Saturated,
}

#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    // pause between two full passes over the workers
    pub wait: Duration,
    // None retries forever
    pub max_attempts: Option<usize>,
    // free core estimate used by local executors
    pub sampler: CoreSampler,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            max_attempts: None,
            sampler: CoreSampler::default(),
        }
    }
}

/// Places jobs on a bounded pool of executors.
///
/// Executors are created lazily, at most one per configured slot, and live as long as the
/// scheduler. Submission is meant to be driven from a single thread, `can_run` followed by the
/// dispatch is not atomic across concurrent callers.
#[derive(Debug)]
pub struct Scheduler {
    root: PathBuf,
    worker_config: Vec<WorkerConfig>,
    workers: VecDeque<SharedExecutor>,
    phase: Phase,
    jobs: Vec<JobHandle>,
    completed: Vec<JobHandle>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(root: &Path, worker_config: Vec<WorkerConfig>, options: SchedulerOptions) -> Self {
        let mut scheduler = Self {
            root: absolute_root(root),
            worker_config,
            workers: VecDeque::new(),
            phase: Phase::Filling,
            jobs: Vec::new(),
            completed: Vec::new(),
            options,
        };
        scheduler.update_phase();

        scheduler
    }

    pub fn from_config(config: PoolConfig, options: SchedulerOptions) -> Self {
        Self::new(&config.root, config.workers, options)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn worker_config(&self) -> &[WorkerConfig] {
        &self.worker_config
    }

    /// number of executors created so far
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    /// submissions not yet seen finished
    pub fn active_jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    pub fn completed_jobs(&self) -> &[JobHandle] {
        &self.completed
    }

    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            root: self.root.clone(),
            workers: self.worker_config.clone(),
        }
    }

    pub fn add_worker(&mut self, config: WorkerConfig) {
        self.worker_config.push(config);
        self.update_phase();
    }

    /// persist the root and worker slots, running executors and jobs are not saved
    pub fn save(&self, path: &Path) -> Result<(), ConfigErrors> {
        self.config().save(path)
    }

    /// Replace root and worker slots with the saved ones.
    ///
    /// Executors that already exist keep their slots.
    pub fn load(&mut self, path: &Path) -> Result<(), ConfigErrors> {
        let config = PoolConfig::load(path)?;
        self.root = absolute_root(&config.root);
        self.worker_config = config.workers;
        self.update_phase();

        Ok(())
    }

    fn update_phase(&mut self) {
        self.phase = if self.workers.len() < self.worker_config.len() {
            Phase::Filling
        } else {
            Phase::Saturated
        };
    }

    fn create_worker(&mut self) -> Result<SharedExecutor, SchedulerError> {
        let config = &self.worker_config[self.workers.len()];
        config.validate()?;
        info!("Starting worker on {}", config.host());

        let worker = Arc::new(Mutex::new(Executors::load(config, &self.options.sampler)?));
        self.workers.push_back(Arc::clone(&worker));
        self.update_phase();

        Ok(worker)
    }

    fn rotate_existing_workers(&mut self) -> SharedExecutor {
        self.workers.rotate_left(1);
        // the previous front is now at the back
        Arc::clone(&self.workers[self.workers.len() - 1])
    }

    /// Move finished submissions to the completed list and return the executors still busy
    pub fn refresh(&mut self) -> Result<Vec<SharedExecutor>, SchedulerError> {
        let mut busy: Vec<SharedExecutor> = Vec::new();
        let mut index = 0;

        while index < self.jobs.len() {
            let job = &self.jobs[index];

            if job.status()?.is_finished() {
                let job = self.jobs.remove(index);
                self.completed.push(job);
            } else {
                if !busy.iter().any(|worker| Arc::ptr_eq(worker, job.executor())) {
                    busy.push(Arc::clone(job.executor()));
                }
                index += 1;
            }
        }

        Ok(busy)
    }

    /// Pick the next worker to try, together with whether it already admitted `n_core`
    fn select_worker(&mut self, n_core: usize) -> Result<(SharedExecutor, bool), SchedulerError> {
        let busy = self.refresh()?;
        let is_idle =
            |worker: &SharedExecutor| !busy.iter().any(|other| Arc::ptr_eq(worker, other));

        match self.phase {
            Phase::Saturated => {
                if busy.len() < self.workers.len() {
                    for _ in 0..self.workers.len() {
                        let worker = self.rotate_existing_workers();
                        if is_idle(&worker) {
                            return Ok((worker, false));
                        }
                    }
                }

                Ok((self.rotate_existing_workers(), false))
            }
            Phase::Filling => {
                for worker in self.workers.iter().filter(|worker| is_idle(worker)) {
                    if worker.lock().can_run(n_core)? {
                        return Ok((Arc::clone(worker), true));
                    }
                }

                Ok((self.create_worker()?, false))
            }
        }
    }

    /// Place `job` on the first worker that admits it.
    ///
    /// When no worker has room the calling thread sleeps for the configured wait and tries
    /// again, forever unless `max_attempts` is set. Executor and channel failures are returned
    /// as they happen.
    #[instrument(skip(self, job), fields(job = %job), level = "info")]
    pub fn submit(&mut self, job: JobSpec) -> Result<JobHandle, SchedulerError> {
        if self.worker_config.is_empty() {
            return Err(SchedulerError::NoWorkers);
        }

        let mut attempts = 0;
        let mut waiting = false;

        loop {
            for _ in 0..self.worker_config.len() {
                let (worker, admitted) = self.select_worker(job.n_core)?;
                let admitted = admitted || worker.lock().can_run(job.n_core)?;

                if admitted {
                    if waiting {
                        eprintln!();
                    }
                    info!("Job run by {}", worker.lock().host());

                    let handle = JobHandle::dispatch(&worker, job)?;
                    self.jobs.push(handle.clone());

                    return Ok(handle);
                }
            }

            attempts += 1;
            debug!(attempts, "No worker could admit the job");

            if self.options.max_attempts.is_some_and(|max| attempts >= max) {
                if waiting {
                    eprintln!();
                }
                return Err(SchedulerError::NoCapacity { attempts });
            }

            thread::sleep(self.options.wait);
            waiting = true;

            let mut stderr = io::stderr();
            let _ = write!(
                stderr,
                "\r{} Waiting for a free worker ...",
                SPINNER[attempts % SPINNER.len()]
            );
            let _ = stderr.flush();
        }
    }
}
