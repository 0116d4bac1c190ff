pub mod config;
pub mod distributed;
pub mod executors;
pub mod job;
pub mod resources;
pub mod scheduler;

pub use config::{PoolConfig, WorkerConfig};
pub use executors::{ExecutorError, Executors, JobHandle};
pub use job::{Environment, JobSpec, JobStatus};
pub use scheduler::{Scheduler, SchedulerError, SchedulerOptions};
