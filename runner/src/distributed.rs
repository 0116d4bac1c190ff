pub mod dispatcher;

/*
 * Remote channel protocol
 *
 * One JSON document per line in each direction. The owning RemoteExecutor writes a `Request` to
 * the peer's stdin and blocks until the matching `Response` arrives on the peer's stdout. There
 * is no termination message, the peer runs until its stdin is closed.
 */

use crate::{
    executors::ExecutorError,
    job::{JobError, JobId, JobSpec, JobStatus},
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    str,
};
use thiserror::Error;

/// operation names accepted by the dispatcher
pub const OPERATIONS: [&str; 6] = [
    "free_cores",
    "run",
    "status",
    "clean",
    "get_stdout",
    "get_stderr",
];

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to open channel to {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("Channel closed by peer")]
    ChannelClosed,
    #[error("Channel io failed: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Unexpected response to {operation}: {response}")]
    UnexpectedResponse {
        operation: &'static str,
        response: String,
    },
    #[error("Remote fault: {0}")]
    Fault(RemoteFault),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    FreeCores,
    Run { job: JobSpec },
    Status { job_id: JobId },
    Clean { job_id: JobId, force: bool },
    GetStdout { job_id: JobId },
    GetStderr { job_id: JobId },
}

impl Request {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::FreeCores => OPERATIONS[0],
            Self::Run { .. } => OPERATIONS[1],
            Self::Status { .. } => OPERATIONS[2],
            Self::Clean { .. } => OPERATIONS[3],
            Self::GetStdout { .. } => OPERATIONS[4],
            Self::GetStderr { .. } => OPERATIONS[5],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Response {
    FreeCores(usize),
    Started(JobId),
    Status(JobStatus),
    Cleaned,
    Output(String),
    Fault(RemoteFault),
}

/// Failures reported by the peer, the channel itself stays usable after one of these
#[derive(Error, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "fault", content = "detail", rename_all = "snake_case")]
pub enum RemoteFault {
    #[error("invalid job id {0}")]
    UnknownJob(JobId),
    #[error("output not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported operation `{0}`")]
    UnsupportedOperation(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("{0}")]
    Failed(String),
}

impl From<ExecutorError> for RemoteFault {
    fn from(error: ExecutorError) -> Self {
        match error {
            ExecutorError::UnknownJob(job_id) => Self::UnknownJob(job_id),
            ExecutorError::Job(JobError::OutputNotFound { path }) => Self::NotFound(path),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<RemoteFault> for ExecutorError {
    fn from(fault: RemoteFault) -> Self {
        match fault {
            RemoteFault::UnknownJob(job_id) => Self::UnknownJob(job_id),
            RemoteFault::NotFound(path) => Self::Job(JobError::OutputNotFound { path }),
            other => Self::Remote(RemoteError::Fault(other)),
        }
    }
}

/// write a single message followed by a newline and flush it
pub fn write_message<W: Write + ?Sized, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), RemoteError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;

    Ok(())
}

/// Read the next raw line, `None` once the other side closed the channel.
///
/// Bytes are returned as is, invalid UTF-8 is left for the decoder to reject.
pub fn read_line<R: BufRead + ?Sized>(reader: &mut R) -> Result<Option<Vec<u8>>, RemoteError> {
    let mut line = Vec::new();

    match reader.read_until(b'\n', &mut line)? {
        0 => Ok(None),
        _ => Ok(Some(line)),
    }
}

/// Decode a request, naming the operation when it is not one we know
pub fn decode_request(line: &[u8]) -> Result<Request, RemoteFault> {
    let line = str::from_utf8(line).map_err(|error| RemoteFault::Malformed(error.to_string()))?;

    serde_json::from_str(line).map_err(|error| {
        let operation = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("op")?.as_str().map(str::to_owned));

        match operation {
            Some(operation) if !OPERATIONS.contains(&operation.as_str()) => {
                RemoteFault::UnsupportedOperation(operation)
            }
            _ => RemoteFault::Malformed(error.to_string()),
        }
    })
}
