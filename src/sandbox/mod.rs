mod cache;
mod executor;
mod lifecycle;
mod shell;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use cache::EndpointCache;
pub use executor::ProcessExecutor;
pub use lifecycle::{CreateOptions, LifecycleClient};
pub use shell::{shell_quote, CodeExecutionResult, RemoteShell};

/// A sandbox known to this client.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub id: String,
    pub template_id: String,
    /// URL of the in-sandbox agent (`scheme://ip:port`)
    pub private_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of executing a command in the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Per-command execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory inside the sandbox (client default when unset)
    pub cwd: Option<String>,
    pub envs: HashMap<String, String>,
    /// Wall-clock limit (client default when unset)
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}
