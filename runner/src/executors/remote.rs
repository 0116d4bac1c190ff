use super::ExecutorError;
use crate::{
    config::WorkerConfig,
    distributed::{read_line, write_message, RemoteError, Request, Response},
    job::{JobId, JobSpec, JobStatus},
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// how long the peer gets to exit on its own once its stdin is closed
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Line based request/response channel to a dispatcher
struct Channel {
    peer: Option<Child>,
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    // set once a round trip failed, requests and responses can no longer be paired
    broken: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer.as_ref().map(Child::id))
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Channel {
    fn call(&mut self, request: &Request) -> Result<Response, RemoteError> {
        if self.broken {
            return Err(RemoteError::ChannelClosed);
        }

        let result = self.exchange(request);
        if let Err(error) = &result {
            warn!(error = %error, "Channel unusable, closing it");
            self.broken = true;
        }

        result
    }

    fn exchange(&mut self, request: &Request) -> Result<Response, RemoteError> {
        write_message(&mut self.writer, request)?;

        match read_line(&mut self.reader)? {
            Some(line) => Ok(serde_json::from_slice(&line)?),
            None => Err(RemoteError::ChannelClosed),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // closing stdin ends the dispatcher loop
        self.writer = Box::new(io::sink());

        let Some(mut peer) = self.peer.take() else {
            return;
        };

        match peer.wait_timeout(TEARDOWN_GRACE) {
            Ok(Some(status)) => debug!("Dispatcher exited with {status}"),
            _ => {
                warn!(pid = peer.id(), "Dispatcher did not exit, terminating it");
                if let Ok(pid) = i32::try_from(peer.id()) {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                }
                if !matches!(peer.wait_timeout(TEARDOWN_GRACE), Ok(Some(_))) {
                    let _ = peer.kill();
                    let _ = peer.wait();
                }
            }
        }
    }
}

/// Executor that forwards every operation to a dispatcher on another host
#[derive(Debug)]
pub struct RemoteExecutor {
    host: String,
    executable: PathBuf,
    working_dir: Option<PathBuf>,
    testing: bool,
    channel: Channel,
    jobs: BTreeMap<JobId, JobSpec>,
    running: BTreeSet<JobId>,
}

impl RemoteExecutor {
    /// Launch a dispatcher on `host` and keep a channel to it.
    ///
    /// In testing mode the dispatcher is spawned on this machine instead of through `ssh`.
    #[instrument(skip(executable, working_dir), level = "info")]
    pub fn connect(
        host: &str,
        executable: &Path,
        working_dir: Option<&Path>,
        testing: bool,
    ) -> Result<Self, RemoteError> {
        let mut command = if testing {
            let mut command = Command::new(executable);
            command.arg("dispatch");
            if let Some(dir) = working_dir {
                command.current_dir(dir);
            }
            command
        } else {
            let mut command = Command::new("ssh");
            command
                .arg("-T")
                .arg(host)
                .arg(remote_command(executable, working_dir));
            command
        };

        debug!("Opening channel with {command:?}");
        let mut peer = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| RemoteError::Spawn {
                host: host.to_owned(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (peer.stdin.take(), peer.stdout.take()) else {
            let _ = peer.kill();
            return Err(RemoteError::ChannelClosed);
        };

        let mut executor = Self::with_channel(
            host,
            executable,
            working_dir,
            testing,
            BufReader::new(stdout),
            stdin,
        );
        executor.channel.peer = Some(peer);

        Ok(executor)
    }

    /// Use an already established channel, no peer process is owned in this case
    pub fn with_channel<R, W>(
        host: &str,
        executable: &Path,
        working_dir: Option<&Path>,
        testing: bool,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            host: host.to_owned(),
            executable: executable.to_path_buf(),
            working_dir: working_dir.map(Path::to_path_buf),
            testing,
            channel: Channel {
                peer: None,
                reader: Box::new(reader),
                writer: Box::new(writer),
                broken: false,
            },
            jobs: BTreeMap::new(),
            running: BTreeSet::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> WorkerConfig {
        WorkerConfig::Remote {
            host: self.host.clone(),
            executable: self.executable.clone(),
            working_dir: self.working_dir.clone(),
            testing: self.testing,
        }
    }

    /// one synchronous round trip, peer faults become executor errors
    fn call(&mut self, request: Request) -> Result<Response, ExecutorError> {
        trace!(host = %self.host, operation = request.operation(), "Remote call");

        match self.channel.call(&request)? {
            Response::Fault(fault) => Err(fault.into()),
            response => Ok(response),
        }
    }

    fn unexpected(operation: &'static str, response: Response) -> ExecutorError {
        RemoteError::UnexpectedResponse {
            operation,
            response: format!("{response:?}"),
        }
        .into()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.running.iter().copied().collect()
    }

    pub fn reserved_cores(&self) -> usize {
        self.running
            .iter()
            .filter_map(|job_id| self.jobs.get(job_id))
            .map(|job| job.n_core)
            .sum()
    }

    pub fn free_cores(&mut self) -> Result<usize, ExecutorError> {
        match self.call(Request::FreeCores)? {
            Response::FreeCores(cores) => Ok(cores),
            other => Err(Self::unexpected("free_cores", other)),
        }
    }

    pub fn start(&mut self, job: JobSpec) -> Result<JobId, ExecutorError> {
        match self.call(Request::Run { job: job.clone() })? {
            Response::Started(job_id) => {
                self.jobs.insert(job_id, job);
                self.running.insert(job_id);
                Ok(job_id)
            }
            other => Err(Self::unexpected("run", other)),
        }
    }

    pub fn status(&mut self, job_id: JobId) -> Result<JobStatus, ExecutorError> {
        match self.call(Request::Status { job_id })? {
            Response::Status(status) => {
                if status != JobStatus::Running {
                    self.running.remove(&job_id);
                }
                Ok(status)
            }
            other => Err(Self::unexpected("status", other)),
        }
    }

    pub fn clean(&mut self, job_id: JobId, force: bool) -> Result<(), ExecutorError> {
        match self.call(Request::Clean { job_id, force })? {
            Response::Cleaned => Ok(()),
            other => Err(Self::unexpected("clean", other)),
        }
    }

    pub fn get_stdout(&mut self, job_id: JobId) -> Result<String, ExecutorError> {
        match self.call(Request::GetStdout { job_id })? {
            Response::Output(output) => Ok(output),
            other => Err(Self::unexpected("get_stdout", other)),
        }
    }

    pub fn get_stderr(&mut self, job_id: JobId) -> Result<String, ExecutorError> {
        match self.call(Request::GetStderr { job_id })? {
            Response::Output(output) => Ok(output),
            other => Err(Self::unexpected("get_stderr", other)),
        }
    }

    /// Spawn the transfer of a job's output directory into `dest`.
    ///
    /// Returns immediately, the transfer is not tracked as part of the job.
    pub fn copy_output(&self, job_id: JobId, dest: &Path) -> Result<Child, ExecutorError> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(ExecutorError::UnknownJob(job_id))?;
        let source = match &self.working_dir {
            Some(dir) => dir.join(&job.output_dir),
            None => job.output_dir.clone(),
        };

        let mut command = if self.testing {
            let target = dest.join(&job.output_dir);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(ExecutorError::Transfer)?;
            }

            let mut command = Command::new("cp");
            command.arg("-r").arg(&source).arg(target);
            command
        } else {
            let target = match job.output_dir.parent() {
                Some(parent) => dest.join(parent),
                None => dest.to_path_buf(),
            };

            let mut command = Command::new("scp");
            command
                .arg("-qr")
                .arg(format!("{}:{}", self.host, source.display()))
                .arg(target);
            command
        };

        info!(host = %self.host, "Copying output with {command:?}");
        command.spawn().map_err(ExecutorError::Transfer)
    }
}

/// command line run by ssh on the remote host
fn remote_command(executable: &Path, working_dir: Option<&Path>) -> String {
    let dispatch = format!("exec {} dispatch", shell_quote(&executable.to_string_lossy()));

    match working_dir {
        Some(dir) => format!("cd {} && {dispatch}", shell_quote(&dir.to_string_lossy())),
        None => dispatch,
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
