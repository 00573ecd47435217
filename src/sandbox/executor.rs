use std::collections::HashMap;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Result, SandgateError};
use crate::rpc::envelope::{self, EnvelopeDecoder, Frame};
use crate::rpc::events::{end_stream_error, ProcessEvent};
use crate::sandbox::{ExecOptions, ExecutionResult};

const START_PATH: &str = "/process.Process/Start";
const SHELL: &str = "/bin/bash";

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    process: ProcessConfig<'a>,
    stdin: bool,
}

#[derive(Debug, Serialize)]
struct ProcessConfig<'a> {
    cmd: &'a str,
    args: [&'a str; 3],
    cwd: &'a str,
    envs: &'a HashMap<String, String>,
}

/// Accumulates process output from decoded frames.
#[derive(Debug, Default)]
struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
}

impl OutputCollector {
    fn apply(&mut self, frame: Frame) {
        if frame.is_end_stream() {
            if let Some(error) = end_stream_error(&frame.payload) {
                warn!(error = %error, "Process stream ended with an error");
            }
            return;
        }
        if frame.is_compressed() {
            warn!(len = frame.payload.len(), "Skipping compressed frame");
            return;
        }

        match ProcessEvent::parse(&frame.payload) {
            ProcessEvent::Start { pid } => debug!(pid = ?pid, "Process started"),
            ProcessEvent::Stdout(bytes) => self.stdout.extend_from_slice(&bytes),
            ProcessEvent::Stderr(bytes) => self.stderr.extend_from_slice(&bytes),
            ProcessEvent::End { exit_code } => self.exit_code = Some(exit_code),
            ProcessEvent::Keepalive => {}
            ProcessEvent::Unrecognized => trace!("Ignoring unrecognized stream message"),
        }
    }

    fn finish(self, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: self.exit_code.unwrap_or(0),
            timed_out,
        }
    }
}

enum StreamEnd {
    Complete,
    DeadlineExceeded,
}

/// Feed a chunked body through the envelope decoder until it ends or the deadline passes.
async fn consume_stream<S, B, E>(
    stream: &mut S,
    collector: &mut OutputCollector,
    deadline: Instant,
) -> Result<StreamEnd>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<SandgateError>,
{
    let mut decoder = EnvelopeDecoder::new();

    loop {
        let next = match timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Ok(StreamEnd::DeadlineExceeded),
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(Into::into)?;

        decoder.push(chunk.as_ref());
        drain_into(&mut decoder, collector);
    }

    drain_into(&mut decoder, collector);
    if decoder.pending() > 0 {
        warn!(bytes = decoder.pending(), "Stream ended inside a frame");
    }
    Ok(StreamEnd::Complete)
}

fn drain_into(decoder: &mut EnvelopeDecoder, collector: &mut OutputCollector) {
    for frame in decoder.drain_frames() {
        collector.apply(frame);
    }
    if let Some(e) = decoder.take_violation() {
        warn!(error = %e, "Dropped undecodable stream data");
    }
}

/// Runs shell commands through envd's streaming `Start` RPC.
pub struct ProcessExecutor {
    http: Client,
    default_cwd: String,
    default_timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(http: Client, default_cwd: String, default_timeout: Duration) -> Self {
        Self {
            http,
            default_cwd,
            default_timeout,
        }
    }

    /// Execute `command` via `bash -l -c` against the agent at `endpoint`.
    ///
    /// A non-zero exit code is returned as data. Exceeding the timeout drops
    /// the in-flight request and yields `CommandTimeout` carrying whatever
    /// output arrived before the deadline.
    pub async fn execute(
        &self,
        endpoint: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let request = StartRequest {
            process: ProcessConfig {
                cmd: SHELL,
                args: ["-l", "-c", command],
                cwd: options.cwd.as_deref().unwrap_or(&self.default_cwd),
                envs: &options.envs,
            },
            stdin: false,
        };
        let body = envelope::encode(&serde_json::to_vec(&request)?);
        let url = format!("{}{}", endpoint.trim_end_matches('/'), START_PATH);

        debug!(url = %url, command = %command, timeout_ms = timeout.as_millis() as u64, "Starting process");

        let mut collector = OutputCollector::default();
        let send = self
            .http
            .post(&url)
            .header("Connect-Protocol-Version", "1")
            .header("Content-Type", "application/connect+json")
            .header("Connect-Content-Encoding", "identity")
            .body(body)
            .send();

        let response = match timeout_at(deadline, send).await {
            Ok(response) => response?,
            Err(_) => return Err(timeout_error(command, timeout, collector)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SandgateError::Transport {
                message: format!("Failed to start process: {} {}", status, text),
                status: Some(status.as_u16()),
            });
        }

        let mut stream = Box::pin(response.bytes_stream());
        match consume_stream(&mut stream, &mut collector, deadline).await? {
            StreamEnd::Complete => {}
            StreamEnd::DeadlineExceeded => return Err(timeout_error(command, timeout, collector)),
        }

        let result = collector.finish(false);
        debug!(
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Command completed"
        );
        Ok(result)
    }
}

fn timeout_error(command: &str, timeout: Duration, collector: OutputCollector) -> SandgateError {
    warn!(command = %command, timeout_ms = timeout.as_millis() as u64, "Command timed out");
    SandgateError::CommandTimeout {
        command: command.to_string(),
        timeout_ms: timeout.as_millis() as u64,
        partial: Box::new(collector.finish(true)),
    }
}
