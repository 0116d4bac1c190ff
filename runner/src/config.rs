use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Worker slot for {host:?} is invalid: {reason}")]
    InvalidWorker { host: String, reason: String },
    #[error("Failed to access pool config: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid JSON pool config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid YAML pool config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// One slot of the worker pool
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkerConfig {
    Local,
    Remote {
        host: String,
        // path of the simsched runtime on the remote host
        executable: PathBuf,
        #[serde(default)]
        working_dir: Option<PathBuf>,
        // spawn the dispatcher locally and copy with `cp`, for trying a pool on one machine
        #[serde(default)]
        testing: bool,
    },
}

impl WorkerConfig {
    pub fn host(&self) -> &str {
        match self {
            Self::Local => "localhost",
            Self::Remote { host, .. } => host,
        }
    }

    /// check the fields needed to create an executor for this slot
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        self.problems()
            .into_iter()
            .next()
            .map_or(Ok(()), |reason| {
                Err(ConfigErrors::InvalidWorker {
                    host: self.host().to_owned(),
                    reason,
                })
            })
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Self::Remote {
            host, executable, ..
        } = self
        {
            if host.trim().is_empty() {
                problems.push("host must not be empty".to_owned());
            }
            if executable.as_os_str().is_empty() {
                problems.push("executable must not be empty".to_owned());
            }
        }

        problems
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

/// Persistent part of a scheduler: its root and the worker slots
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            workers: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// load a pool config, `.yaml`/`.yml` files are read as YAML and everything else as JSON
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let reader = BufReader::new(File::open(path)?);

        if is_yaml(path) {
            Ok(serde_yaml::from_reader(reader)?)
        } else {
            Ok(serde_json::from_reader(reader)?)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigErrors> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);

        if is_yaml(path) {
            serde_yaml::to_writer(&mut writer, self)?;
        } else {
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Report every invalid slot at once instead of piece-by-piece.
    ///
    /// Returns true if any error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.workers.is_empty() {
            error!("No worker slot was defined, no job can be scheduled");
            contains_error = true;
        }

        for (index, worker) in self.workers.iter().enumerate() {
            for problem in worker.problems() {
                error!("workers.{index}: {problem}");
                contains_error = true;
            }

            if let WorkerConfig::Remote {
                working_dir: Some(dir),
                testing: false,
                ..
            } = worker
            {
                if dir.is_relative() {
                    warn!(
                        "workers.{index}.working_dir ({}) is relative to the login directory on the remote host",
                        dir.display()
                    );
                }
            }
        }

        contains_error
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|extension| extension.to_str()),
        Some("yaml" | "yml")
    )
}

/// Expand a leading `~` and make the path absolute against the current directory
pub fn absolute_root(root: &Path) -> PathBuf {
    let expanded = match root.strip_prefix("~") {
        Ok(rest) => match env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => root.to_path_buf(),
        },
        Err(_) => root.to_path_buf(),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}
