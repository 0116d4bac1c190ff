use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    fmt::{self, Display},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, trace};

/// id handed out by an executor, only unique within that executor
pub type JobId = usize;

/// environment variable carrying the requested thread count
pub const THREAD_HINT_VAR: &str = "OMP_NUM_THREADS";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job command is empty")]
    EmptyCommand,
    #[error("Unable to split command line `{0}`")]
    InvalidCommandLine(String),
    #[error("Output not found at {}", path.display())]
    OutputNotFound { path: PathBuf },
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Job io failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// `done` and `error` are terminal
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        })
    }
}

/// Explicit snapshot of a process environment.
///
/// Executors capture the ambient environment once when they are built and hand it to every job
/// that does not bring its own, so no job ever reads the global environment on its own.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// capture the environment of the current process, skipping non unicode entries
    pub fn ambient() -> Self {
        env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// put `dir` in front of `PATH` unless it is already listed
    pub fn prepend_path(&mut self, dir: &Path) {
        let current = self.get("PATH").unwrap_or_default();
        let mut paths = env::split_paths(current).collect::<Vec<_>>();

        if paths.iter().any(|path| path == dir) {
            return;
        }

        paths.insert(0, dir.to_path_buf());
        match env::join_paths(paths) {
            Ok(joined) => {
                if let Some(joined) = joined.to_str() {
                    self.set("PATH", joined);
                }
            }
            Err(error) => debug!(error = ?error, "Unable to extend PATH with {}", dir.display()),
        }
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn default_n_core() -> usize {
    1
}

fn default_n_thread() -> usize {
    1
}

/// Serializable description of a job, this is what crosses the remote channel
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub command: Vec<String>,
    pub output_dir: PathBuf,
    // cores needed on the target machine, 0 means unconstrained
    #[serde(default = "default_n_core")]
    pub n_core: usize,
    // exported as OMP_NUM_THREADS
    #[serde(default = "default_n_thread")]
    pub n_thread: usize,
    // None resolves to the ambient environment of the executing host
    #[serde(default)]
    pub env: Option<Environment>,
}

impl JobSpec {
    pub fn new<I, S>(command: I, output_dir: impl Into<PathBuf>) -> Result<Self, JobError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into_iter().map(Into::into).collect::<Vec<String>>();

        if command.is_empty() {
            return Err(JobError::EmptyCommand);
        }

        Ok(Self {
            command,
            output_dir: output_dir.into(),
            n_core: default_n_core(),
            n_thread: default_n_thread(),
            env: None,
        })
    }

    /// Build a job from a single command line split with POSIX shell rules
    pub fn from_command_line(
        command_line: &str,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, JobError> {
        let command = shlex::split(command_line)
            .ok_or_else(|| JobError::InvalidCommandLine(command_line.to_owned()))?;

        Self::new(command, output_dir)
    }

    pub fn with_cores(mut self, n_core: usize) -> Self {
        self.n_core = n_core;
        self
    }

    pub fn with_threads(mut self, n_thread: usize) -> Self {
        self.n_thread = n_thread.max(1);
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir.join(STDERR_FILE)
    }

    pub fn pretty_command(&self) -> String {
        self.command.join(" ")
    }
}

impl Display for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_command())
    }
}

/// A job bound to the host it runs on, owning its OS process once started
#[derive(Debug)]
pub struct Job {
    spec: JobSpec,
    env: Environment,
    output_already_exists: bool,
    process: Option<Child>,
}

impl Job {
    pub fn new(mut spec: JobSpec, ambient: &Environment) -> Self {
        // a deserialized spec may carry 0 threads
        spec.n_thread = spec.n_thread.max(1);
        let mut env = spec.env.clone().unwrap_or_else(|| ambient.clone());
        env.set(THREAD_HINT_VAR, spec.n_thread.to_string());
        let output_already_exists = spec.output_dir.exists();

        Self {
            spec,
            env,
            output_already_exists,
            process: None,
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// the environment the process is launched with
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Launch the command without waiting for it.
    ///
    /// Creates the output directory if needed and truncates any previously captured output.
    pub fn run(&mut self) -> Result<(), JobError> {
        let (program, args) = self
            .spec
            .command
            .split_first()
            .ok_or(JobError::EmptyCommand)?;

        fs::create_dir_all(&self.spec.output_dir)?;
        let stdout = File::create(self.spec.stdout_path())?;
        let stderr = File::create(self.spec.stderr_path())?;

        let child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| JobError::Spawn {
                command: self.spec.pretty_command(),
                source,
            })?;

        debug!(pid = child.id(), "Started `{}`", self.spec);
        self.process = Some(child);

        Ok(())
    }

    /// Non blocking poll of the job.
    ///
    /// Without a tracked process (e.g., after a restart) a job with captured output counts as
    /// done, the exit code is lost in that case.
    pub fn status(&mut self) -> Result<JobStatus, JobError> {
        let Some(process) = self.process.as_mut() else {
            return Ok(if self.spec.stdout_path().exists() {
                JobStatus::Done
            } else {
                JobStatus::NotStarted
            });
        };

        Ok(match process.try_wait()? {
            None => JobStatus::Running,
            Some(status) => {
                trace!("`{}` exited with {status}", self.spec);
                match status.code() {
                    Some(code) if code > 0 => JobStatus::Error,
                    // killed by a signal or exited cleanly
                    _ => JobStatus::Done,
                }
            }
        })
    }

    /// Remove what the job produced.
    ///
    /// A directory that existed before the job is kept unless `force` is set, only the captured
    /// output is removed from it.
    pub fn clean(&self, force: bool) -> Result<(), JobError> {
        if self.output_already_exists && !force {
            for path in [self.spec.stdout_path(), self.spec.stderr_path()] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
        } else if self.spec.output_dir.exists() {
            fs::remove_dir_all(&self.spec.output_dir)?;
        }

        Ok(())
    }

    pub fn get_stdout(&self) -> Result<String, JobError> {
        read_output(&self.spec.stdout_path())
    }

    pub fn get_stderr(&self) -> Result<String, JobError> {
        read_output(&self.spec.stderr_path())
    }
}

fn read_output(path: &Path) -> Result<String, JobError> {
    fs::read_to_string(path).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => JobError::OutputNotFound {
            path: path.to_path_buf(),
        },
        _ => JobError::Io(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn wait_finished(job: &mut Job) -> JobStatus {
        for _ in 0..500 {
            let status = job.status().unwrap();
            if status.is_finished() {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("job did not finish in time");
    }

    #[test]
    fn echo_reaches_done_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(["echo", "hello"], dir.path().join("echo"))
            .unwrap()
            .with_cores(0);
        let mut job = Job::new(spec, &Environment::ambient());

        assert_eq!(job.status().unwrap(), JobStatus::NotStarted);
        job.run().unwrap();

        assert_eq!(wait_finished(&mut job), JobStatus::Done);
        assert_eq!(job.get_stdout().unwrap(), "hello\n");
        assert_eq!(job.get_stderr().unwrap(), "");
    }

    #[test]
    fn sleeping_job_is_running() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(["sleep", "5"], dir.path().join("sleep")).unwrap();
        let mut job = Job::new(spec, &Environment::ambient());

        job.run().unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Running);
    }

    #[test]
    fn positive_exit_code_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(["sh", "-c", "echo broken >&2; exit 3"], dir.path().join("fail"))
            .unwrap();
        let mut job = Job::new(spec, &Environment::ambient());

        job.run().unwrap();
        assert_eq!(wait_finished(&mut job), JobStatus::Error);
        assert_eq!(job.get_stderr().unwrap(), "broken\n");
    }

    #[test]
    fn thread_hint_is_exported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(["sh", "-c", "echo $OMP_NUM_THREADS"], dir.path().join("omp"))
            .unwrap()
            .with_threads(4);
        let mut job = Job::new(spec, &Environment::ambient());

        assert_eq!(job.env().get(THREAD_HINT_VAR), Some("4"));
        job.run().unwrap();
        wait_finished(&mut job);
        assert_eq!(job.get_stdout().unwrap(), "4\n");
    }

    #[test]
    fn explicit_environment_replaces_ambient() {
        let mut ambient = Environment::empty();
        ambient.set("FROM_AMBIENT", "1");
        let mut given = Environment::empty();
        given.set("FROM_JOB", "1");

        let spec = JobSpec::new(["true"], "unused").unwrap().with_env(given);
        let job = Job::new(spec, &ambient);

        assert_eq!(job.env().get("FROM_JOB"), Some("1"));
        assert_eq!(job.env().get("FROM_AMBIENT"), None);
    }

    #[test]
    fn output_before_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let spec = JobSpec::new(["true"], dir.path().join("never")).unwrap();
        let job = Job::new(spec, &Environment::ambient());

        assert!(matches!(
            job.get_stdout(),
            Err(JobError::OutputNotFound { .. })
        ));
    }

    #[test]
    fn zero_threads_from_the_wire_become_one() {
        let spec: JobSpec =
            serde_json::from_str(r#"{"command":["true"],"output_dir":"out","n_thread":0}"#)
                .unwrap();
        assert_eq!(spec.n_thread, 0);

        let job = Job::new(spec, &Environment::empty());
        assert_eq!(job.spec().n_thread, 1);
        assert_eq!(job.env().get(THREAD_HINT_VAR), Some("1"));
    }

    #[test]
    fn command_line_is_split_like_a_shell() {
        let spec =
            JobSpec::from_command_line(r#"solver --name "two words" 'a b'"#, "out").unwrap();
        assert_eq!(spec.command, ["solver", "--name", "two words", "a b"]);

        assert!(matches!(
            JobSpec::from_command_line("solver \"unterminated", "out"),
            Err(JobError::InvalidCommandLine(_))
        ));
        assert!(matches!(
            JobSpec::from_command_line("   ", "out"),
            Err(JobError::EmptyCommand)
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            JobSpec::new(Vec::<String>::new(), "out"),
            Err(JobError::EmptyCommand)
        ));
    }

    #[test]
    fn clean_removes_fresh_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("fresh");
        let mut job = Job::new(
            JobSpec::new(["true"], &output).unwrap(),
            &Environment::ambient(),
        );

        job.run().unwrap();
        wait_finished(&mut job);
        job.clean(false).unwrap();

        assert!(!output.exists());
    }

    #[test]
    fn clean_keeps_preexisting_dir() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("existing");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("input.dat"), "keep me").unwrap();

        let mut job = Job::new(
            JobSpec::new(["true"], &output).unwrap(),
            &Environment::ambient(),
        );
        job.run().unwrap();
        wait_finished(&mut job);
        job.clean(false).unwrap();

        assert!(output.join("input.dat").exists());
        assert!(!output.join(STDOUT_FILE).exists());
        assert!(!output.join(STDERR_FILE).exists());

        job.clean(true).unwrap();
        assert!(!output.exists());
    }

    #[test]
    fn captured_output_without_process_counts_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("restarted");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join(STDOUT_FILE), "old run\n").unwrap();

        let mut job = Job::new(
            JobSpec::new(["true"], &output).unwrap(),
            &Environment::ambient(),
        );

        assert_eq!(job.status().unwrap(), JobStatus::Done);
    }

    #[test]
    fn prepend_path_is_idempotent() {
        let mut env = Environment::empty();
        env.set("PATH", "/usr/bin:/bin");

        env.prepend_path(Path::new("/opt/sim/bin"));
        env.prepend_path(Path::new("/opt/sim/bin"));

        assert_eq!(env.get("PATH"), Some("/opt/sim/bin:/usr/bin:/bin"));
    }
}
