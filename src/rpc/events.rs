//! Events carried by the `process.Process/Start` response stream.
//!
//! envd has emitted output both as `event.data.stdout` and as
//! `event.stdout.data` across versions, so both shapes are accepted.
//! Anything else decodes to [`ProcessEvent::Unrecognized`] and is skipped.

use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Process spawned inside the sandbox
    Start { pid: Option<u32> },
    /// Decoded stdout bytes
    Stdout(Vec<u8>),
    /// Decoded stderr bytes
    Stderr(Vec<u8>),
    /// Process finished
    End { exit_code: i32 },
    Keepalive,
    Unrecognized,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    event: Option<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    start: Option<StartEvent>,
    data: Option<DataEvent>,
    stdout: Option<OutputChunk>,
    stderr: Option<OutputChunk>,
    end: Option<EndEvent>,
    keepalive: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    pid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputChunk {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndEvent {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStreamTrailer {
    error: Option<ConnectError>,
}

#[derive(Debug, Deserialize)]
struct ConnectError {
    code: Option<String>,
    message: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

impl ProcessEvent {
    /// Interpret one envelope payload. Never fails.
    pub fn parse(payload: &[u8]) -> Self {
        let message: StreamMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(_) => return Self::Unrecognized,
        };
        let Some(event) = message.event else {
            return Self::Unrecognized;
        };

        let (data_stdout, data_stderr) = match event.data {
            Some(data) => (non_empty(data.stdout), non_empty(data.stderr)),
            None => (None, None),
        };

        if let Some(start) = event.start {
            return Self::Start { pid: start.pid };
        }
        if let Some(text) = data_stdout {
            return Self::Stdout(decode_output(&text));
        }
        if let Some(text) = event.stdout.and_then(|c| non_empty(c.data)) {
            return Self::Stdout(decode_output(&text));
        }
        if let Some(text) = data_stderr {
            return Self::Stderr(decode_output(&text));
        }
        if let Some(text) = event.stderr.and_then(|c| non_empty(c.data)) {
            return Self::Stderr(decode_output(&text));
        }
        if let Some(end) = event.end {
            let status = end.status.unwrap_or_else(|| "exit status 0".to_string());
            return Self::End {
                exit_code: parse_exit_status(&status),
            };
        }
        if event.keepalive.is_some() {
            return Self::Keepalive;
        }
        Self::Unrecognized
    }
}

/// Output is base64 on the wire; fall back to the raw text if it is not.
fn decode_output(text: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .unwrap_or_else(|_| text.as_bytes().to_vec())
}

/// Extract `N` from a status such as `"exit status N"`; 0 when absent or unparsable.
pub fn parse_exit_status(status: &str) -> i32 {
    let Some((_, tail)) = status.split_once("exit status ") else {
        return 0;
    };
    let tail = tail.trim_start();
    let digits_end = tail
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(tail.len());
    tail[..digits_end].parse().unwrap_or(0)
}

/// Error carried in an end-of-stream trailer, if any.
pub fn end_stream_error(payload: &[u8]) -> Option<String> {
    let trailer: EndStreamTrailer = serde_json::from_slice(payload).ok()?;
    let error = trailer.error?;
    Some(format!(
        "{}: {}",
        error.code.as_deref().unwrap_or("unknown"),
        error.message.as_deref().unwrap_or("")
    ))
}
