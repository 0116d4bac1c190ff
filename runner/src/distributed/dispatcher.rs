use super::{decode_request, read_line, write_message, RemoteError, Request, Response};
use crate::{executors::LocalExecutor, job::Environment, resources::CoreSampler};
use std::{
    env,
    io::{BufRead, Write},
};
use tracing::{debug, info, warn};

/// Peer side of a remote executor.
///
/// Owns its own job table (a `LocalExecutor`), independent of any executor on the scheduling
/// host, and lives exactly as long as the channel it serves.
#[derive(Debug)]
pub struct Dispatcher {
    executor: LocalExecutor,
}

impl Dispatcher {
    pub fn new(executor: LocalExecutor) -> Self {
        Self { executor }
    }

    /// Dispatcher for this host, jobs inherit an environment whose `PATH` also covers the
    /// directory this runtime was started from
    pub fn for_host(sampler: CoreSampler) -> Self {
        let mut ambient = Environment::ambient();

        match env::current_exe() {
            Ok(exe) => {
                if let Some(dir) = exe.parent() {
                    ambient.prepend_path(dir);
                }
            }
            Err(error) => warn!(error = ?error, "Unable to locate the dispatcher executable"),
        }

        Self::new(LocalExecutor::new(sampler).with_environment(ambient))
    }

    /// execute a single request against the local job table
    pub fn handle(&mut self, request: Request) -> Response {
        let result = match request {
            Request::FreeCores => Ok(Response::FreeCores(self.executor.free_cores())),
            Request::Run { job } => self.executor.start(job).map(Response::Started),
            Request::Status { job_id } => self.executor.status(job_id).map(Response::Status),
            Request::Clean { job_id, force } => {
                self.executor.clean(job_id, force).map(|()| Response::Cleaned)
            }
            Request::GetStdout { job_id } => {
                self.executor.get_stdout(job_id).map(Response::Output)
            }
            Request::GetStderr { job_id } => {
                self.executor.get_stderr(job_id).map(Response::Output)
            }
        };

        result.unwrap_or_else(|error| {
            debug!(error = %error, "Request failed");
            Response::Fault(error.into())
        })
    }

    /// Answer requests until the other side closes the channel.
    ///
    /// Requests that cannot be decoded are answered with a fault and the loop keeps going, only
    /// channel failures end it early.
    pub fn serve<R: BufRead, W: Write>(
        &mut self,
        mut reader: R,
        mut writer: W,
    ) -> Result<(), RemoteError> {
        info!("Dispatcher ready");

        while let Some(line) = read_line(&mut reader)? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let response = match decode_request(&line) {
                Ok(request) => {
                    debug!(operation = request.operation(), "Handling request");
                    self.handle(request)
                }
                Err(fault) => {
                    warn!(fault = %fault, "Rejecting request");
                    Response::Fault(fault)
                }
            };

            write_message(&mut writer, &response)?;
        }

        info!("Channel closed, dispatcher exiting");
        Ok(())
    }
}
